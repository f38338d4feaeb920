//! Push channel: full state on connect, one event per change thereafter.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use qmon::{GlobalSettings, MonitorEvent, SessionManager, SessionSnapshot};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Wire frame pushed to dashboard clients. Updates carry the full current
/// snapshot, never a diff.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data")]
enum PushEvent {
	#[serde(rename = "sessions:init")]
	SessionsInit(Vec<SessionSnapshot>),
	#[serde(rename = "settings:init")]
	SettingsInit(GlobalSettings),
	#[serde(rename = "sessions:update")]
	SessionsUpdate(SessionSnapshot),
	#[serde(rename = "settings:update")]
	SettingsUpdate(GlobalSettings),
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(manager): State<SessionManager>) -> impl IntoResponse {
	ws.on_upgrade(move |socket| handle_socket(socket, manager))
}

async fn handle_socket(socket: WebSocket, manager: SessionManager) {
	debug!(target = "qmon.server", "dashboard client connected");
	let (mut tx, mut rx) = socket.split();

	// Subscribe before the initial snapshot so no change can fall between.
	let mut events = manager.subscribe();
	if send_event(&mut tx, &PushEvent::SessionsInit(manager.list().await)).await.is_err() {
		return;
	}
	if send_event(&mut tx, &PushEvent::SettingsInit(manager.settings())).await.is_err() {
		return;
	}

	loop {
		tokio::select! {
			event = events.recv() => {
				let frame = match event {
					Ok(MonitorEvent::State(snapshot)) => PushEvent::SessionsUpdate(snapshot),
					Ok(MonitorEvent::Settings(settings)) => PushEvent::SettingsUpdate(settings),
					Err(RecvError::Lagged(skipped)) => {
						// Updates are snapshots, so a full resync recovers.
						warn!(target = "qmon.server", %skipped, "dashboard client lagged, resyncing");
						PushEvent::SessionsInit(manager.list().await)
					}
					Err(RecvError::Closed) => break,
				};
				if send_event(&mut tx, &frame).await.is_err() {
					break;
				}
			}
			incoming = rx.next() => {
				match incoming {
					Some(Ok(Message::Ping(data))) => {
						if tx.send(Message::Pong(data)).await.is_err() {
							break;
						}
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(err)) => {
						debug!(target = "qmon.server", error = %err, "websocket receive failed");
						break;
					}
				}
			}
		}
	}

	// Dropping the receiver tears the subscription down.
	debug!(target = "qmon.server", "dashboard client disconnected");
}

async fn send_event(tx: &mut SplitSink<WebSocket, Message>, event: &PushEvent) -> Result<(), axum::Error> {
	let json = serde_json::to_string(event).map_err(axum::Error::new)?;
	tx.send(Message::Text(json.into())).await
}
