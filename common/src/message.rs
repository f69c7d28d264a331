//! The delta protocol's message envelope, message types, and the meta queue
//! (spec.md §4.2).

use bytes::{Bytes, BytesMut};

use crate::codec::{read_value, value_size, write_value, Codec};
use crate::error::CodecError;
use crate::path::{Path, PathSegment};
use crate::schema::Polymorphic;
use crate::wire::{self, WireType};
use crate::ClientId;

/// The seven message types carried after the object id in every application frame.
/// Upstream queue posts are the one exception (spec.md §4.2): they have no
/// `MessageType` of their own, the server dispatches them straight through the field
/// table's `DecodeQueuePost`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageType {
	Sync = 0,
	ValueChange = 1,
	SetAdd = 2,
	SetRemove = 3,
	MapSet = 4,
	MapRemove = 5,
	QueueReceive = 6,
}

impl MessageType {
	pub fn from_u64(value: u64) -> Option<Self> {
		Some(match value {
			0 => MessageType::Sync,
			1 => MessageType::ValueChange,
			2 => MessageType::SetAdd,
			3 => MessageType::SetRemove,
			4 => MessageType::MapSet,
			5 => MessageType::MapRemove,
			6 => MessageType::QueueReceive,
			_ => return None,
		})
	}
}

/// Reads one field of a hand-written record, logging and substituting the type's
/// default on a wire-type mismatch rather than failing the whole record (spec.md
/// §4.1's skip discipline, applied per-field).
fn read_field<T: Codec>(buf: &mut Bytes, declared: WireType, field: &'static str) -> T {
	read_value(buf, declared).unwrap_or_else(|error| {
		tracing::warn!(%error, field, "field decode failed, substituting default");
		T::default_value()
	})
}

/// Frames a payload as `varint(object_id) ‖ payload`, the envelope every application
/// message between client and server opens with (spec.md §4.2).
pub fn encode_envelope(object_id: u32, payload: &[u8]) -> Bytes {
	let mut buf = BytesMut::with_capacity(5 + payload.len());
	wire::write_var_u32(&mut buf, object_id);
	buf.extend_from_slice(payload);
	buf.freeze()
}

/// Splits an inbound frame into its object id and remaining payload.
pub fn decode_envelope(mut frame: Bytes) -> Result<(u32, Bytes), CodecError> {
	let object_id = wire::read_var_u32(&mut frame)?;
	Ok((object_id, frame))
}

impl Codec for PathSegment {
	const WIRE_TYPE: WireType = WireType::ByteLength;

	fn write_type(&self, buf: &mut BytesMut) {
		crate::wire::FieldTag::new(1, u32::WIRE_TYPE).write(buf);
		write_value(buf, &self.collection_id);
		crate::wire::FieldTag::new(2, String::WIRE_TYPE).write(buf);
		write_value(buf, &self.key);
	}

	fn type_size(&self) -> usize {
		crate::wire::FieldTag::new(1, u32::WIRE_TYPE).size()
			+ value_size(&self.collection_id)
			+ crate::wire::FieldTag::new(2, String::WIRE_TYPE).size()
			+ value_size(&self.key)
	}

	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		let mut collection_id = 0u32;
		let mut key = String::new();
		while bytes::Buf::has_remaining(buf) {
			let tag = crate::wire::FieldTag::read(buf)?;
			match tag.id {
				1 => collection_id = read_field(buf, tag.wire_type, "collection_id"),
				2 => key = read_field(buf, tag.wire_type, "key"),
				_ => tag.wire_type.skip(buf)?,
			}
		}
		Ok(PathSegment { collection_id, key })
	}

	fn default_value() -> Self {
		PathSegment { collection_id: 0, key: String::new() }
	}
}

impl Codec for Path {
	const WIRE_TYPE: WireType = WireType::ByteLength;

	fn write_type(&self, buf: &mut BytesMut) {
		self.segments().to_vec().write_type(buf)
	}

	fn type_size(&self) -> usize {
		self.segments().to_vec().type_size()
	}

	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		Ok(Path::from_segments(Vec::<PathSegment>::read_type(buf)?))
	}

	fn default_value() -> Self {
		Path::root()
	}
}

/// Upstream meta-queue messages (spec.md §4.2 "Meta queue"): the only transport for
/// subscription control.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaUp {
	Null,
	Authenticate { user_id: String, token: String },
	Subscribe { object_id: u32, path: Path },
	Unsubscribe { object_id: u32 },
}

/// Downstream meta-queue messages. Both `AuthenticateFailed` and `SubscribeFailed` are
/// included per the Open Question in spec.md §9 (the source's two meta-queue
/// declarations disagreed on this).
#[derive(Debug, Clone, PartialEq)]
pub enum MetaDown {
	Null,
	AuthenticateFailed { reason: String },
	SubscribeFailed { object_id: u32, cause: String },
}

impl Polymorphic for MetaUp {
	fn subtype_id(&self) -> u32 {
		match self {
			MetaUp::Null => 0,
			MetaUp::Authenticate { .. } => 1,
			MetaUp::Subscribe { .. } => 2,
			MetaUp::Unsubscribe { .. } => 3,
		}
	}

	fn write_variant(&self, buf: &mut BytesMut) {
		match self {
			MetaUp::Null => {}
			MetaUp::Authenticate { user_id, token } => {
				crate::wire::FieldTag::new(1, String::WIRE_TYPE).write(buf);
				write_value(buf, user_id);
				crate::wire::FieldTag::new(2, String::WIRE_TYPE).write(buf);
				write_value(buf, token);
			}
			MetaUp::Subscribe { object_id, path } => {
				crate::wire::FieldTag::new(1, u32::WIRE_TYPE).write(buf);
				write_value(buf, object_id);
				crate::wire::FieldTag::new(2, Path::WIRE_TYPE).write(buf);
				write_value(buf, path);
			}
			MetaUp::Unsubscribe { object_id } => {
				crate::wire::FieldTag::new(1, u32::WIRE_TYPE).write(buf);
				write_value(buf, object_id);
			}
		}
	}

	fn variant_size(&self) -> usize {
		match self {
			MetaUp::Null => 0,
			MetaUp::Authenticate { user_id, token } => {
				crate::wire::FieldTag::new(1, String::WIRE_TYPE).size()
					+ value_size(user_id)
					+ crate::wire::FieldTag::new(2, String::WIRE_TYPE).size()
					+ value_size(token)
			}
			MetaUp::Subscribe { object_id, path } => {
				crate::wire::FieldTag::new(1, u32::WIRE_TYPE).size()
					+ value_size(object_id)
					+ crate::wire::FieldTag::new(2, Path::WIRE_TYPE).size()
					+ value_size(path)
			}
			MetaUp::Unsubscribe { object_id } => {
				crate::wire::FieldTag::new(1, u32::WIRE_TYPE).size() + value_size(object_id)
			}
		}
	}

	fn read_variant(id: u32, buf: &mut Bytes) -> Result<Self, CodecError> {
		match id {
			1 => {
				let mut user_id = String::new();
				let mut token = String::new();
				while bytes::Buf::has_remaining(buf) {
					let tag = crate::wire::FieldTag::read(buf)?;
					match tag.id {
						1 => user_id = read_field(buf, tag.wire_type, "user_id"),
						2 => token = read_field(buf, tag.wire_type, "token"),
						_ => tag.wire_type.skip(buf)?,
					}
				}
				Ok(MetaUp::Authenticate { user_id, token })
			}
			2 => {
				let mut object_id = 0u32;
				let mut path = Path::root();
				while bytes::Buf::has_remaining(buf) {
					let tag = crate::wire::FieldTag::read(buf)?;
					match tag.id {
						1 => object_id = read_field(buf, tag.wire_type, "object_id"),
						2 => path = read_field(buf, tag.wire_type, "path"),
						_ => tag.wire_type.skip(buf)?,
					}
				}
				Ok(MetaUp::Subscribe { object_id, path })
			}
			3 => {
				let mut object_id = 0u32;
				while bytes::Buf::has_remaining(buf) {
					let tag = crate::wire::FieldTag::read(buf)?;
					match tag.id {
						1 => object_id = read_field(buf, tag.wire_type, "object_id"),
						_ => tag.wire_type.skip(buf)?,
					}
				}
				Ok(MetaUp::Unsubscribe { object_id })
			}
			other => Err(CodecError::UnknownSubtype(other)),
		}
	}

	fn null_variant() -> Self {
		MetaUp::Null
	}
}

impl Polymorphic for MetaDown {
	fn subtype_id(&self) -> u32 {
		match self {
			MetaDown::Null => 0,
			MetaDown::AuthenticateFailed { .. } => 1,
			MetaDown::SubscribeFailed { .. } => 2,
		}
	}

	fn write_variant(&self, buf: &mut BytesMut) {
		match self {
			MetaDown::Null => {}
			MetaDown::AuthenticateFailed { reason } => {
				crate::wire::FieldTag::new(1, String::WIRE_TYPE).write(buf);
				write_value(buf, reason);
			}
			MetaDown::SubscribeFailed { object_id, cause } => {
				crate::wire::FieldTag::new(1, u32::WIRE_TYPE).write(buf);
				write_value(buf, object_id);
				crate::wire::FieldTag::new(2, String::WIRE_TYPE).write(buf);
				write_value(buf, cause);
			}
		}
	}

	fn variant_size(&self) -> usize {
		match self {
			MetaDown::Null => 0,
			MetaDown::AuthenticateFailed { reason } => {
				crate::wire::FieldTag::new(1, String::WIRE_TYPE).size() + value_size(reason)
			}
			MetaDown::SubscribeFailed { object_id, cause } => {
				crate::wire::FieldTag::new(1, u32::WIRE_TYPE).size()
					+ value_size(object_id)
					+ crate::wire::FieldTag::new(2, String::WIRE_TYPE).size()
					+ value_size(cause)
			}
		}
	}

	fn read_variant(id: u32, buf: &mut Bytes) -> Result<Self, CodecError> {
		match id {
			1 => {
				let mut reason = String::new();
				while bytes::Buf::has_remaining(buf) {
					let tag = crate::wire::FieldTag::read(buf)?;
					match tag.id {
						1 => reason = read_field(buf, tag.wire_type, "reason"),
						_ => tag.wire_type.skip(buf)?,
					}
				}
				Ok(MetaDown::AuthenticateFailed { reason })
			}
			2 => {
				let mut object_id = 0u32;
				let mut cause = String::new();
				while bytes::Buf::has_remaining(buf) {
					let tag = crate::wire::FieldTag::read(buf)?;
					match tag.id {
						1 => object_id = read_field(buf, tag.wire_type, "object_id"),
						2 => cause = read_field(buf, tag.wire_type, "cause"),
						_ => tag.wire_type.skip(buf)?,
					}
				}
				Ok(MetaDown::SubscribeFailed { object_id, cause })
			}
			other => Err(CodecError::UnknownSubtype(other)),
		}
	}

	fn null_variant() -> Self {
		MetaDown::Null
	}
}

/// Writes this field's Sync contribution: `(field-id-wire-type) ‖ value`, the same
/// shape regardless of whether the field is a `Value`, `Set`, or `Map` - a Sync is
/// just every field's whole current value, concatenated like a struct (spec.md §4.2).
pub fn write_sync_field<T: Codec>(buf: &mut BytesMut, field_id: u32, value: &T) {
	crate::wire::FieldTag::new(field_id, T::WIRE_TYPE).write(buf);
	write_value(buf, value);
}

fn message_frame(message_type: MessageType, body: impl FnOnce(&mut BytesMut)) -> Bytes {
	let mut buf = BytesMut::new();
	wire::write_var_u64(&mut buf, message_type as u64);
	body(&mut buf);
	buf.freeze()
}

pub fn encode_value_change<T: Codec>(field_id: u32, value: &T) -> Bytes {
	message_frame(MessageType::ValueChange, |buf| write_sync_field(buf, field_id, value))
}

pub fn encode_set_add<T: Codec>(field_id: u32, element: &T) -> Bytes {
	message_frame(MessageType::SetAdd, |buf| write_sync_field(buf, field_id, element))
}

pub fn encode_set_remove<T: Codec>(field_id: u32, element: &T) -> Bytes {
	message_frame(MessageType::SetRemove, |buf| write_sync_field(buf, field_id, element))
}

pub fn encode_map_set<K: Codec, V: Codec>(field_id: u32, key: &K, value: &V) -> Bytes {
	message_frame(MessageType::MapSet, |buf| {
		crate::wire::MapEntryTag::new(field_id, K::WIRE_TYPE, V::WIRE_TYPE).write(buf);
		write_value(buf, key);
		write_value(buf, value);
	})
}

pub fn encode_map_remove<K: Codec>(field_id: u32, key: &K) -> Bytes {
	message_frame(MessageType::MapRemove, |buf| write_sync_field(buf, field_id, key))
}

pub fn encode_queue_receive<T: Codec>(field_id: u32, downstream: &T) -> Bytes {
	message_frame(MessageType::QueueReceive, |buf| write_sync_field(buf, field_id, downstream))
}

impl MetaUp {
	pub fn authenticate(client_id: ClientId, token: impl Into<String>) -> Self {
		MetaUp::Authenticate { user_id: client_id.to_string(), token: token.into() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_roundtrip() {
		let payload = [1u8, 2, 3, 4];
		let frame = encode_envelope(42, &payload);
		let (id, rest) = decode_envelope(frame).unwrap();
		assert_eq!(id, 42);
		assert_eq!(&rest[..], &payload);
	}

	#[test]
	fn meta_up_roundtrip() {
		for msg in [
			MetaUp::Null,
			MetaUp::Authenticate { user_id: "alice".into(), token: "tok".into() },
			MetaUp::Subscribe { object_id: 3, path: Path::root().child(1, "rooms") },
			MetaUp::Unsubscribe { object_id: 3 },
		] {
			let mut buf = BytesMut::new();
			write_value(&mut buf, &msg);
			let mut bytes = buf.freeze();
			let decoded: MetaUp = read_value(&mut bytes, WireType::ByteLength).unwrap();
			assert_eq!(decoded, msg);
		}
	}

	#[test]
	fn meta_down_roundtrip() {
		for msg in [
			MetaDown::Null,
			MetaDown::AuthenticateFailed { reason: "bad token".into() },
			MetaDown::SubscribeFailed { object_id: 5, cause: "Access denied.".into() },
		] {
			let mut buf = BytesMut::new();
			write_value(&mut buf, &msg);
			let mut bytes = buf.freeze();
			let decoded: MetaDown = read_value(&mut bytes, WireType::ByteLength).unwrap();
			assert_eq!(decoded, msg);
		}
	}

	#[test]
	fn message_type_round_trip_values() {
		for i in 0..=6u64 {
			assert!(MessageType::from_u64(i).is_some());
		}
		assert!(MessageType::from_u64(7).is_none());
	}
}
