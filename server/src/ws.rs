//! The `/data` websocket route (spec.md §6.1): an `axum` `WebSocketUpgrade` handler
//! whose per-connection task pumps binary DObj frames instead of this example pack's
//! usual JSON text messages.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::{info, info_span, instrument, warn, Instrument};

use crate::resolver::RoomCollection;
use crate::session::Session;

#[derive(Clone)]
pub struct AppState {
	pub rooms: Arc<RoomCollection>,
}

pub async fn data_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
	ws.on_upgrade(move |socket| {
		let id = uuid::Uuid::new_v4();
		handle_socket(socket, state).instrument(info_span!("session", %id))
	})
}

/// Owns one connection end to end: wires up the per-session FIFO send queue
/// (spec.md §4.4 "Send path"), subscribes the root object, then loops reading inbound
/// frames and forwarding outbound ones until the socket closes.
#[instrument(skip_all)]
async fn handle_socket(socket: WebSocket, state: AppState) {
	let (mut sink, mut stream) = socket.split();
	let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
	let session = Session::new(outbound_tx, state.rooms.clone());
	info!("session opened");

	loop {
		tokio::select! {
			outgoing = outbound_rx.recv() => {
				match outgoing {
					Some(frame) => {
						if sink.send(Message::Binary(frame.to_vec())).await.is_err() {
							break;
						}
					}
					None => break,
				}
			}
			incoming = stream.next() => {
				match incoming {
					Some(Ok(Message::Binary(bytes))) => {
						session.handle_frame(bytes::Bytes::from(bytes)).await;
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(error)) => {
						warn!(%error, "websocket read error");
						break;
					}
				}
			}
		}
	}

	session.on_close();
	info!("session closed");
}
