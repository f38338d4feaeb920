//! In-page scripts executed inside the queue page's own context.

/// Read-only extraction of everything the queue page exposes.
///
/// Runs inside the page so signal objects are read verbatim; element text is
/// only read when the element exists and is not hidden by layout. The captcha
/// bitmap is re-encoded to a data URL in-page because the image itself is not
/// reachable from outside.
pub const POLL_SCRIPT: &str = r#"
(() => {
	const extractText = (selector) => {
		const el = document.querySelector(selector);
		if (!el) return null;
		const style = window.getComputedStyle(el);
		if (style.display === 'none' || style.visibility === 'hidden') {
			return null;
		}
		return el.innerText.trim();
	};
	const captchaEl = document.querySelector('#captcha');
	const captchaVisible = captchaEl
		? window.getComputedStyle(captchaEl).display !== 'none'
		: false;
	let captchaDataUrl = null;
	if (captchaVisible) {
		const captchaImg = document.querySelector('#img_captcha');
		if (captchaImg && captchaImg.complete && captchaImg.naturalWidth > 0) {
			try {
				const canvas = document.createElement('canvas');
				canvas.width = captchaImg.naturalWidth;
				canvas.height = captchaImg.naturalHeight;
				const ctx = canvas.getContext('2d');
				ctx.drawImage(captchaImg, 0, 0);
				captchaDataUrl = canvas.toDataURL('image/png');
			} catch (error) {
				captchaDataUrl = null;
			}
		}
	}
	return {
		url: window.location.href,
		admissionInfo: window.admissionInfo ?? null,
		queueinfo: window.queueinfo ?? null,
		wr_error: window.wr_error ?? null,
		countdownText: extractText('#wait'),
		queuePosition: extractText('#queueposition'),
		statusMessage: extractText('#message') || extractText('#message_wait'),
		captchaVisible,
		captchaDataUrl,
		title: extractText('#titre'),
		infoBanner: extractText('#info') ?? null,
		timestamp: Date.now(),
	};
})()
"#;

/// Best-effort focus after bringing the window forward.
pub const FOCUS_SCRIPT: &str = "document.body ? (document.body.focus(), true) : false";

/// Injects a captcha answer and submits it the way the page prefers:
/// a known submit control, a page-exposed function, or a form submit event.
pub fn submit_captcha_script(answer: &str) -> String {
	let literal = serde_json::Value::String(answer.to_string()).to_string();
	format!(
		r#"
(() => {{
	const input = document.querySelector('#secret');
	if (!input) {{
		throw new Error('Captcha input not found');
	}}
	input.value = {literal};
	const submitButton = document.querySelector('#submit_button');
	if (submitButton) {{
		submitButton.click();
		return true;
	}}
	if (typeof window.submitCaptcha === 'function') {{
		window.submitCaptcha();
		return true;
	}}
	const form = document.querySelector('#form_captcha');
	if (form) {{
		form.dispatchEvent(new Event('submit', {{ bubbles: true, cancelable: true }}));
		return true;
	}}
	return false;
}})()
"#
	)
}

/// Requests a fresh captcha via the page function or the refresh control.
pub const REFRESH_CAPTCHA_SCRIPT: &str = r#"
(() => {
	if (typeof window.newCaptcha === 'function') {
		window.newCaptcha();
		return true;
	}
	const refreshButton = document.querySelector('#newcaptcha_button a, #newcaptcha_button');
	if (refreshButton instanceof HTMLElement) {
		refreshButton.click();
		return true;
	}
	return false;
})()
"#;
