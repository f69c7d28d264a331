//! `Room` - the worked example from spec.md §8, used across `common`/`client`/`server`
//! tests and the example client: a `name` that changes as a whole, a `players` set that
//! converges through adds/removes, a `scores` map keyed by player name, and a `chat`
//! queue with no stored state at all.

use bytes::{Buf, Bytes, BytesMut};

use crate::codec::read_value;
use crate::dobj::field::{ListenerId, MapField, QueueField, SetField, ValueField};
use crate::dobj::object::{Backing, DObject, DeltaEmitter};
use crate::error::CodecError;
use crate::message::{
	encode_map_remove, encode_map_set, encode_set_add, encode_set_remove, encode_value_change,
	write_sync_field, MessageType,
};
use crate::wire::{FieldTag, MapEntryTag};
use crate::{dobj_struct, ClientId};

dobj_struct! {
	/// Posted by a client onto `Room::chat`.
	pub struct ChatPost {
		1: text: String,
	}
}

dobj_struct! {
	/// Delivered by the server to every subscriber of `Room::chat`.
	pub struct ChatDelivered {
		1: sender: String,
		2: text: String,
	}
}

const FIELD_NAME: u32 = 1;
const FIELD_PLAYERS: u32 = 2;
const FIELD_SCORES: u32 = 3;
const FIELD_CHAT: u32 = 4;

/// The [`DObject::DeltaSubscription`] token for [`Room`]: one [`ListenerId`] per
/// listener `subscribe_deltas` installed, so `unsubscribe_deltas` can detach exactly
/// this subscriber's emitter and no other session's.
pub struct RoomDeltaSubscription {
	name: ListenerId,
	players_add: ListenerId,
	players_remove: ListenerId,
	scores_set: ListenerId,
	scores_remove: ListenerId,
}

pub struct Room {
	backing: Backing,
	pub name: ValueField<String>,
	pub players: SetField<String>,
	pub scores: MapField<String, i32>,
	pub chat: QueueField<ChatPost, ChatDelivered>,
}

impl Room {
	pub fn new(backing: Backing, name: impl Into<String>) -> Self {
		Self {
			backing,
			name: ValueField::new(name.into()),
			players: SetField::new(),
			scores: MapField::new(),
			chat: QueueField::new(),
		}
	}

	/// Encodes a client's `ChatPost` as the raw, `MessageType`-less frame a Queue::Post
	/// travels as (spec.md §4.2) - the envelope wraps this, nothing else does.
	pub fn encode_chat_post(text: impl Into<String>) -> Bytes {
		let post = ChatPost { text: text.into() };
		let mut buf = BytesMut::new();
		write_sync_field(&mut buf, FIELD_CHAT, &post);
		buf.freeze()
	}

	/// Server-side: decodes and dispatches a raw Queue::Post frame to `chat`'s
	/// `on_post` listeners. Callers are expected to have already checked this is the
	/// `chat` field's id.
	pub fn apply_chat_post(&self, mut body: Bytes) -> Result<(), CodecError> {
		let tag = FieldTag::read(&mut body)?;
		let post: ChatPost = read_value(&mut body, tag.wire_type)?;
		self.chat.dispatch_post(&post);
		Ok(())
	}

	/// Server-side: broadcasts a `ChatDelivered` to subscribers as a `QueueReceive`
	/// delta frame, prefixed by `_sender` purely for caller bookkeeping (the wire frame
	/// itself carries no client id - delivery fan-out is the session layer's job).
	pub fn encode_chat_delivered(&self, _sender: ClientId, sender_name: impl Into<String>, text: impl Into<String>) -> Bytes {
		let delivered = ChatDelivered { sender: sender_name.into(), text: text.into() };
		crate::message::encode_queue_receive(FIELD_CHAT, &delivered)
	}
}

impl DObject for Room {
	fn new(backing: Backing) -> Self {
		Room::new(backing, "")
	}

	fn backing(&self) -> Backing {
		self.backing
	}

	type DeltaSubscription = RoomDeltaSubscription;

	fn subscribe_deltas(&mut self, emit: DeltaEmitter) -> RoomDeltaSubscription {
		let e = emit.clone();
		let name = self.name.on_change(move |v| e(encode_value_change(FIELD_NAME, v)));

		let e = emit.clone();
		let players_add = self.players.on_add(move |v| e(encode_set_add(FIELD_PLAYERS, v)));
		let e = emit.clone();
		let players_remove =
			self.players.on_remove(move |v| e(encode_set_remove(FIELD_PLAYERS, v)));

		let e = emit.clone();
		let scores_set = self.scores.on_set(move |k, v| e(encode_map_set(FIELD_SCORES, k, v)));
		let scores_remove =
			self.scores.on_remove(move |k| emit(encode_map_remove(FIELD_SCORES, k)));

		RoomDeltaSubscription { name, players_add, players_remove, scores_set, scores_remove }
	}

	fn unsubscribe_deltas(&mut self, token: RoomDeltaSubscription) {
		self.name.off_change(token.name);
		self.players.off_add(token.players_add);
		self.players.off_remove(token.players_remove);
		self.scores.off_set(token.scores_set);
		self.scores.off_remove(token.scores_remove);
	}

	fn apply_queue_post(&self, body: Bytes) -> Result<(), CodecError> {
		self.apply_chat_post(body)
	}

	fn encode_sync_body(&self) -> Bytes {
		let mut buf = BytesMut::new();
		write_sync_field(&mut buf, FIELD_NAME, self.name.current());
		write_sync_field(&mut buf, FIELD_PLAYERS, self.players.items());
		write_sync_field(&mut buf, FIELD_SCORES, self.scores.entries());
		// `chat` is a Queue: no stored state, so it contributes nothing to Sync.
		buf.freeze()
	}

	fn apply_delta(&mut self, message_type: MessageType, mut body: Bytes) -> Result<(), CodecError> {
		match message_type {
			MessageType::Sync => {
				while body.has_remaining() {
					let tag = FieldTag::read(&mut body)?;
					match tag.id {
						FIELD_NAME => {
							let value = read_value(&mut body, tag.wire_type)?;
							self.name.apply(value);
						}
						FIELD_PLAYERS => {
							let value = read_value(&mut body, tag.wire_type)?;
							self.players.sync_from(value);
						}
						FIELD_SCORES => {
							let value = read_value(&mut body, tag.wire_type)?;
							self.scores.sync_from(value);
						}
						_ => tag.wire_type.skip(&mut body)?,
					}
				}
			}
			MessageType::ValueChange => {
				let tag = FieldTag::read(&mut body)?;
				if tag.id == FIELD_NAME {
					let value = read_value(&mut body, tag.wire_type)?;
					self.name.apply(value);
				} else {
					tag.wire_type.skip(&mut body)?;
				}
			}
			MessageType::SetAdd => {
				let tag = FieldTag::read(&mut body)?;
				if tag.id == FIELD_PLAYERS {
					let item = read_value(&mut body, tag.wire_type)?;
					self.players.add(item);
				} else {
					tag.wire_type.skip(&mut body)?;
				}
			}
			MessageType::SetRemove => {
				let tag = FieldTag::read(&mut body)?;
				if tag.id == FIELD_PLAYERS {
					let item: String = read_value(&mut body, tag.wire_type)?;
					self.players.remove(&item);
				} else {
					tag.wire_type.skip(&mut body)?;
				}
			}
			MessageType::MapSet => {
				let tag = MapEntryTag::read(&mut body)?;
				if tag.id == FIELD_SCORES {
					let key = read_value(&mut body, tag.key_wire_type)?;
					let value = read_value(&mut body, tag.value_wire_type)?;
					self.scores.set(key, value);
				} else {
					tag.key_wire_type.skip(&mut body)?;
					tag.value_wire_type.skip(&mut body)?;
				}
			}
			MessageType::MapRemove => {
				let tag = FieldTag::read(&mut body)?;
				if tag.id == FIELD_SCORES {
					let key: String = read_value(&mut body, tag.wire_type)?;
					self.scores.remove(&key);
				} else {
					tag.wire_type.skip(&mut body)?;
				}
			}
			MessageType::QueueReceive => {
				let tag = FieldTag::read(&mut body)?;
				if tag.id == FIELD_CHAT {
					let delivered: ChatDelivered = read_value(&mut body, tag.wire_type)?;
					self.chat.dispatch_receive(&delivered);
				} else {
					tag.wire_type.skip(&mut body)?;
				}
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{Arc, Mutex};

	fn encode_sync(room: &Room) -> Bytes {
		let mut buf = BytesMut::new();
		crate::wire::write_var_u64(&mut buf, MessageType::Sync as u64);
		buf.extend_from_slice(&room.encode_sync_body());
		buf.freeze()
	}

	#[test]
	fn sync_roundtrip_reproduces_full_state() {
		let mut server_room = Room::new(Backing::Server, "lobby");
		server_room.players.add("alice".into());
		server_room.players.add("bob".into());
		server_room.scores.set("alice".into(), 3);

		let mut frame = encode_sync(&server_room);
		let msg_type =
			MessageType::from_u64(crate::wire::read_var_u64(&mut frame).unwrap()).unwrap();

		let mut client_room = Room::new(Backing::Server, "");
		client_room.apply_delta(msg_type, frame).unwrap();

		assert_eq!(client_room.name.current(), "lobby");
		assert_eq!(
			client_room.players.items(),
			&std::collections::HashSet::from(["alice".to_string(), "bob".to_string()])
		);
		assert_eq!(client_room.scores.entries().get("alice"), Some(&3));
	}

	#[test]
	fn set_add_and_remove_deltas_apply() {
		let mut client_room = Room::new(Backing::Server, "lobby");
		let add = crate::message::encode_set_add(FIELD_PLAYERS, &"carol".to_string());
		let mut buf = add;
		let msg_type =
			MessageType::from_u64(crate::wire::read_var_u64(&mut buf).unwrap()).unwrap();
		client_room.apply_delta(msg_type, buf).unwrap();
		assert!(client_room.players.items().contains("carol"));

		let remove = crate::message::encode_set_remove(FIELD_PLAYERS, &"carol".to_string());
		let mut buf = remove;
		let msg_type =
			MessageType::from_u64(crate::wire::read_var_u64(&mut buf).unwrap()).unwrap();
		client_room.apply_delta(msg_type, buf).unwrap();
		assert!(!client_room.players.items().contains("carol"));
	}

	#[test]
	fn map_set_and_remove_deltas_apply() {
		let mut client_room = Room::new(Backing::Server, "lobby");
		let set = crate::message::encode_map_set(FIELD_SCORES, &"dave".to_string(), &9i32);
		let mut buf = set;
		let msg_type =
			MessageType::from_u64(crate::wire::read_var_u64(&mut buf).unwrap()).unwrap();
		client_room.apply_delta(msg_type, buf).unwrap();
		assert_eq!(client_room.scores.entries().get("dave"), Some(&9));

		let remove = crate::message::encode_map_remove(FIELD_SCORES, &"dave".to_string());
		let mut buf = remove;
		let msg_type =
			MessageType::from_u64(crate::wire::read_var_u64(&mut buf).unwrap()).unwrap();
		client_room.apply_delta(msg_type, buf).unwrap();
		assert_eq!(client_room.scores.entries().get("dave"), None);
	}

	#[test]
	fn chat_post_and_deliver_roundtrip() {
		let mut server_room = Room::new(Backing::Server, "lobby");
		let heard = Arc::new(Mutex::new(Vec::new()));
		{
			let heard = heard.clone();
			server_room.chat.on_post(move |post: &ChatPost| heard.lock().unwrap().push(post.text.clone()));
		}
		let frame = Room::encode_chat_post("hello");
		server_room.apply_chat_post(frame).unwrap();
		assert_eq!(*heard.lock().unwrap(), vec!["hello".to_string()]);

		let mut client_room = Room::new(Backing::Server, "lobby");
		let received = Arc::new(Mutex::new(Vec::new()));
		{
			let received = received.clone();
			client_room.chat.on_receive(move |msg: &ChatDelivered| {
				received.lock().unwrap().push((msg.sender.clone(), msg.text.clone()))
			});
		}
		let deliver = server_room.encode_chat_delivered(ClientId::random(), "alice", "hi");
		let mut buf = deliver;
		let msg_type =
			MessageType::from_u64(crate::wire::read_var_u64(&mut buf).unwrap()).unwrap();
		client_room.apply_delta(msg_type, buf).unwrap();
		assert_eq!(*received.lock().unwrap(), vec![("alice".to_string(), "hi".to_string())]);
	}
}
