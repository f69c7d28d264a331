//! One websocket connection's server-side state (spec.md §4.4): the `id ↔ DObject`
//! maps, the reactive `userId`, and the per-session FIFO send queue.
//!
//! The spec's "single-outstanding-write flag plus FIFO queue" is rendered here as a
//! `tokio::sync::mpsc` channel whose receiver is drained by one dedicated writer task
//! per connection (see `crate::ws`): the channel itself *is* the FIFO queue, and
//! `.await`ing each websocket send before pulling the next item off the channel is what
//! enforces "one outstanding write at a time" - no separate in-flight flag is needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use replicate_common::codec::{read_value, write_value};
use replicate_common::dobj::{DObject, Room, RoomDeltaSubscription};
use replicate_common::message::{
	decode_envelope, encode_envelope, MessageType, MetaDown, MetaUp,
};
use replicate_common::path::Path;
use replicate_common::wire::{self, WireType};
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use crate::resolver::{resolve, Resolved, RoomCollection};

/// The root object's well-known id (spec.md §4.3 "the root is always 0").
pub const ROOT_OBJECT_ID: u32 = 0;

struct Attached {
	room: Arc<StdMutex<Room>>,
	token: RoomDeltaSubscription,
}

/// A session is one websocket connection (spec.md §4.4). `Session` owns the
/// subscription maps and hands the session's `user_id` off to whatever authorization
/// policy cares to read it; nothing else about this connection survives `OnClose`.
pub struct Session {
	user_id: StdMutex<Option<String>>,
	attached: StdMutex<HashMap<u32, Attached>>,
	outbound: mpsc::UnboundedSender<Bytes>,
	rooms: Arc<RoomCollection>,
}

impl Session {
	/// Opens a session and immediately subscribes it to the root object under id `0`
	/// (spec.md §4.4 "On open"), giving the client access to the meta queue before
	/// anything else happens.
	pub fn new(outbound: mpsc::UnboundedSender<Bytes>, rooms: Arc<RoomCollection>) -> Arc<Self> {
		let session =
			Arc::new(Self { user_id: StdMutex::new(None), attached: StdMutex::new(HashMap::new()), outbound, rooms });
		session.send(ROOT_OBJECT_ID, sync_frame(&[]));
		session
	}

	/// Handles one already-unwrapped inbound binary frame (spec.md §4.2 "Framing by
	/// id"). Id `0` carries meta-queue requests; any other id is a `Queue::Post`
	/// against whatever is currently attached under that id.
	#[instrument(skip_all, fields(object_id))]
	pub async fn handle_frame(self: &Arc<Self>, frame: Bytes) {
		let Ok((object_id, body)) = decode_envelope(frame) else {
			warn!("dropping malformed inbound frame");
			return;
		};
		tracing::Span::current().record("object_id", object_id);
		if object_id == ROOT_OBJECT_ID {
			self.handle_meta(body).await;
			return;
		}
		let room = {
			let attached = self.attached.lock().unwrap();
			attached.get(&object_id).map(|a| a.room.clone())
		};
		let Some(room) = room else {
			warn!("queue post for unattached object, dropping");
			return;
		};
		let result = room.lock().unwrap().apply_queue_post(body);
		if let Err(error) = result {
			warn!(%error, "failed to apply queue post");
		}
	}

	async fn handle_meta(self: &Arc<Self>, mut body: Bytes) {
		let Ok(meta): Result<MetaUp, _> = read_value(&mut body, WireType::ByteLength) else {
			warn!("dropping malformed meta-up message");
			return;
		};
		match meta {
			MetaUp::Null => {}
			MetaUp::Authenticate { user_id, token: _ } => {
				// Token accepted unconditionally - see spec.md §7's Open Question; a
				// production deployment must verify it and derive user_id from it.
				*self.user_id.lock().unwrap() = Some(user_id);
			}
			MetaUp::Subscribe { object_id, path } => self.subscribe(object_id, path).await,
			MetaUp::Unsubscribe { object_id } => self.unsubscribe(object_id),
		}
	}

	/// Resolves `path` and, on success, subscribes `object_id` to the result
	/// (spec.md §4.4 "SubscribeToObject"); on failure, sends `SubscribeFailed{cause}`
	/// on the meta queue (spec.md §4.5, §7 "FriendlyException").
	async fn subscribe(self: &Arc<Self>, object_id: u32, path: Path) {
		match resolve(&self.rooms, &path).await {
			Ok(Resolved::Root) => {
				// The root is already attached under id 0 at session open; re-subscribing
				// it under a client-chosen id would be redundant, so just re-sync.
				self.send(object_id, sync_frame(&[]));
			}
			Ok(Resolved::Room(room)) => self.subscribe_to_object(object_id, room),
			Err(error) => {
				warn!(object_id, %error, "subscribe failed");
				self.send_meta(&MetaDown::SubscribeFailed { object_id, cause: error.message });
			}
		}
	}

	/// Registers both direction maps, hooks the object's delta emitter so every
	/// mutation is framed `(id ‖ payload)` and sent, and immediately sends a `Sync`
	/// (spec.md §4.4 "SubscribeToObject"). The order matters: the emitter is hooked
	/// before the Sync is sent, so no mutation between resolve and Sync can race ahead
	/// of it in the FIFO send queue.
	fn subscribe_to_object(self: &Arc<Self>, object_id: u32, room: Arc<StdMutex<Room>>) {
		let session = self.clone();
		let token = {
			let mut guard = room.lock().unwrap();
			let emit: replicate_common::dobj::DeltaEmitter =
				Arc::new(move |delta| session.send(object_id, delta));
			guard.subscribe_deltas(emit)
		};
		let sync = sync_frame(&room.lock().unwrap().encode_sync_body());
		self.attached.lock().unwrap().insert(object_id, Attached { room, token });
		self.send(object_id, sync);
	}

	/// Symmetric teardown of [`Self::subscribe_to_object`] (spec.md §4.4
	/// "UnsubscribeFromObject"): detaches this session's emitter only, leaving any
	/// other session still subscribed to the same room untouched.
	fn unsubscribe(&self, object_id: u32) {
		if let Some(attached) = self.attached.lock().unwrap().remove(&object_id) {
			attached.room.lock().unwrap().unsubscribe_deltas(attached.token);
		}
	}

	/// Walks the whole map and detaches every remaining subscription
	/// (spec.md §4.4 "OnClose").
	pub fn on_close(&self) {
		let attached = std::mem::take(&mut *self.attached.lock().unwrap());
		for (_, attached) in attached {
			attached.room.lock().unwrap().unsubscribe_deltas(attached.token);
		}
	}

	fn send(&self, object_id: u32, payload: Bytes) {
		let _ = self.outbound.send(encode_envelope(object_id, &payload));
	}

	fn send_meta(&self, meta: &MetaDown) {
		let mut buf = bytes::BytesMut::new();
		write_value(&mut buf, meta);
		self.send(ROOT_OBJECT_ID, buf.freeze());
	}
}

/// Frames a `Sync` message: the `MessageType::Sync` varint followed by `body`
/// (spec.md §4.2 "Per-type emission rules"). The root object has no fields of its own,
/// so its Sync body is simply empty.
fn sync_frame(body: &[u8]) -> Bytes {
	let mut buf = bytes::BytesMut::with_capacity(1 + body.len());
	wire::write_var_u64(&mut buf, MessageType::Sync as u64);
	buf.extend_from_slice(body);
	buf.freeze()
}

#[cfg(test)]
mod tests {
	use super::*;
	use replicate_common::message::decode_envelope;

	fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Bytes> {
		let mut out = Vec::new();
		while let Ok(frame) = rx.try_recv() {
			out.push(frame);
		}
		out
	}

	#[tokio::test]
	async fn open_sends_root_sync_under_id_zero() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let _session = Session::new(tx, Arc::new(RoomCollection::new()));
		let frames = drain(&mut rx);
		assert_eq!(frames.len(), 1);
		let (id, _body) = decode_envelope(frames[0].clone()).unwrap();
		assert_eq!(id, ROOT_OBJECT_ID);
	}

	#[tokio::test]
	async fn subscribe_then_sync_then_deltas_arrive_in_order() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let session = Session::new(tx, Arc::new(RoomCollection::new()));
		drain(&mut rx); // the root Sync from open

		let subscribe = MetaUp::Subscribe { object_id: 1, path: Path::root().child(1, "lobby") };
		let mut buf = bytes::BytesMut::new();
		write_value(&mut buf, &subscribe);
		session.handle_frame(encode_envelope(ROOT_OBJECT_ID, &buf.freeze())).await;

		let frames = drain(&mut rx);
		assert_eq!(frames.len(), 1, "expected exactly one Sync for the new subscription");
		let (id, mut body) = decode_envelope(frames[0].clone()).unwrap();
		assert_eq!(id, 1);
		let msg_type = MessageType::from_u64(wire::read_var_u64(&mut body).unwrap()).unwrap();
		assert_eq!(msg_type, MessageType::Sync);

		// Mutate the room now that it's subscribed: the delta must be the next frame.
		{
			let attached = session.attached.lock().unwrap();
			let room = attached.get(&1).unwrap().room.clone();
			drop(attached);
			room.lock().unwrap().players.add("alice".into());
		}
		let frames = drain(&mut rx);
		assert_eq!(frames.len(), 1);
		let (id, mut body) = decode_envelope(frames[0].clone()).unwrap();
		assert_eq!(id, 1);
		assert_eq!(MessageType::from_u64(wire::read_var_u64(&mut body).unwrap()).unwrap(), MessageType::SetAdd);
	}

	#[tokio::test]
	async fn unsubscribe_detaches_only_that_sessions_emitter() {
		let rooms = Arc::new(RoomCollection::new());
		let (tx_a, mut rx_a) = mpsc::unbounded_channel();
		let session_a = Session::new(tx_a, rooms.clone());
		let (tx_b, mut rx_b) = mpsc::unbounded_channel();
		let session_b = Session::new(tx_b, rooms.clone());
		drain(&mut rx_a);
		drain(&mut rx_b);

		for session in [&session_a, &session_b] {
			let subscribe = MetaUp::Subscribe { object_id: 1, path: Path::root().child(1, "lobby") };
			let mut buf = bytes::BytesMut::new();
			write_value(&mut buf, &subscribe);
			session.handle_frame(encode_envelope(ROOT_OBJECT_ID, &buf.freeze())).await;
		}
		drain(&mut rx_a);
		drain(&mut rx_b);

		session_a.unsubscribe(1);
		let room = rooms.resolve("lobby").await.unwrap();
		room.lock().unwrap().players.add("carol".into());

		assert!(drain(&mut rx_a).is_empty(), "unsubscribed session must not receive further deltas");
		assert_eq!(drain(&mut rx_b).len(), 1, "still-subscribed session must still receive them");
	}

	#[tokio::test]
	async fn access_denied_sends_subscribe_failed() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let session = Session::new(tx, Arc::new(RoomCollection::new()));
		drain(&mut rx);

		let subscribe = MetaUp::Subscribe { object_id: 1, path: Path::root().child(1, "private") };
		let mut buf = bytes::BytesMut::new();
		write_value(&mut buf, &subscribe);
		session.handle_frame(encode_envelope(ROOT_OBJECT_ID, &buf.freeze())).await;

		let frames = drain(&mut rx);
		assert_eq!(frames.len(), 1);
		let (id, mut body) = decode_envelope(frames[0].clone()).unwrap();
		assert_eq!(id, ROOT_OBJECT_ID);
		let meta: MetaDown = read_value(&mut body, WireType::ByteLength).unwrap();
		assert_eq!(meta, MetaDown::SubscribeFailed { object_id: 1, cause: "Access denied.".into() });
	}
}
