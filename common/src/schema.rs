//! Schema-driven record and subtype-dispatch machinery (spec.md §3.5, §4.1, §9).
//!
//! [`dobj_struct!`] generates a plain record's [`Codec`](crate::codec::Codec) impl from
//! a list of `id: field: Type` entries — this is the "generate codec tables at compile
//! time... keyed by stable numeric field id" port strategy from the Design Notes,
//! rather than the reflective runtime metadata the original system used.
//!
//! [`Polymorphic`] is the trait closed-subtype-set records implement; a blanket
//! [`Codec`](crate::codec::Codec) impl gives every [`Polymorphic`] type the
//! subtype-id-prefixed framing of spec.md §4.1, with `0` reserved for the type's own
//! null/unknown variant.

use bytes::{Bytes, BytesMut};

use crate::codec::Codec;
use crate::error::CodecError;
use crate::wire::WireType;

/// A type whose wire representation is a closed set of numbered subtypes (spec.md
/// §3.5). `0` is reserved to mean "null"/unrecognized; concrete variants start at `1`.
pub trait Polymorphic: Sized {
	/// The subtype id for the current value. Must never return `0`.
	fn subtype_id(&self) -> u32;
	/// Writes this variant's field stream (no subtype id, no outer frame).
	fn write_variant(&self, buf: &mut BytesMut);
	/// Byte length of [`Self::write_variant`].
	fn variant_size(&self) -> usize;
	/// Builds the variant for a known, non-zero subtype id.
	fn read_variant(id: u32, buf: &mut Bytes) -> Result<Self, CodecError>;
	/// The value substituted for `0` or an unrecognized subtype id.
	fn null_variant() -> Self;
}

impl<T: Polymorphic> Codec for T {
	const WIRE_TYPE: WireType = WireType::ByteLength;

	fn write_type(&self, buf: &mut BytesMut) {
		crate::wire::write_var_u64(buf, self.subtype_id() as u64);
		self.write_variant(buf);
	}

	fn type_size(&self) -> usize {
		crate::wire::var_u64_size(self.subtype_id() as u64) + self.variant_size()
	}

	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		if buf.is_empty() {
			return Ok(T::null_variant());
		}
		let id = crate::wire::read_var_u64(buf)? as u32;
		if id == 0 {
			return Ok(T::null_variant());
		}
		// An unrecognized subtype id is a forward-compat skip, not a hard error: the
		// frame's remaining bytes (already isolated by `read_value`) are simply
		// dropped and the null variant is returned, per spec.md §4.1.
		Ok(T::read_variant(id, buf).unwrap_or_else(|error| {
			tracing::warn!(%error, subtype_id = id, "unrecognized subtype, substituting null variant");
			T::null_variant()
		}))
	}

	fn default_value() -> Self {
		T::null_variant()
	}
}

/// Declares a record type whose fields are each tagged by a stable numeric id, and
/// generates its [`Codec`](crate::codec::Codec) impl: concatenated `tag, value` pairs
/// with unknown ids skipped by wire type alone on read (spec.md §4.1 "Struct").
#[macro_export]
macro_rules! dobj_struct {
	(
		$(#[$meta:meta])*
		$vis:vis struct $name:ident {
			$($id:literal : $field:ident : $ty:ty),* $(,)?
		}
	) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Default)]
		$vis struct $name {
			$(pub $field: $ty),*
		}

		impl $crate::codec::Codec for $name {
			const WIRE_TYPE: $crate::wire::WireType = $crate::wire::WireType::ByteLength;

			fn write_type(&self, buf: &mut bytes::BytesMut) {
				$(
					$crate::wire::FieldTag::new(
						$id,
						<$ty as $crate::codec::Codec>::WIRE_TYPE,
					).write(buf);
					$crate::codec::write_value(buf, &self.$field);
				)*
			}

			fn type_size(&self) -> usize {
				0usize
				$(
					+ $crate::wire::FieldTag::new(
						$id,
						<$ty as $crate::codec::Codec>::WIRE_TYPE,
					).size()
					+ $crate::codec::value_size(&self.$field)
				)*
			}

			fn read_type(buf: &mut bytes::Bytes) -> Result<Self, $crate::error::CodecError> {
				let mut result = Self::default();
				while bytes::Buf::has_remaining(buf) {
					let tag = $crate::wire::FieldTag::read(buf)?;
					match tag.id {
						$(
							$id => {
								result.$field = $crate::codec::read_value(buf, tag.wire_type)
									.unwrap_or_else(|error| {
										tracing::warn!(
											%error,
											field = stringify!($field),
											field_id = $id,
											"field decode failed, substituting default",
										);
										<$ty as $crate::codec::Codec>::default_value()
									});
							}
						)*
						_unknown => {
							tag.wire_type.skip(buf)?;
						}
					}
				}
				Ok(result)
			}

			fn default_value() -> Self {
				Self::default()
			}
		}
	};
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::{read_value, value_size, write_value};

	dobj_struct! {
		#[derive(Eq)]
		struct RoomInfo {
			1: name: String,
			2: capacity: u32,
		}
	}

	#[test]
	fn struct_roundtrip() {
		let room = RoomInfo { name: "lobby".into(), capacity: 12 };
		let mut buf = BytesMut::new();
		write_value(&mut buf, &room);
		assert_eq!(buf.len(), value_size(&room));
		let mut bytes = buf.freeze();
		let decoded: RoomInfo = read_value(&mut bytes, WireType::ByteLength).unwrap();
		assert_eq!(decoded, room);
	}

	#[test]
	fn struct_skips_unknown_trailing_field() {
		let room = RoomInfo { name: "lobby".into(), capacity: 12 };
		let mut buf = BytesMut::new();
		room.write_type(&mut buf);
		// Append an unknown field: id=99, VarInt wire type, value 42.
		crate::wire::FieldTag::new(99, WireType::VarInt).write(&mut buf);
		crate::wire::write_var_u64(&mut buf, 42);

		let total_len = buf.len();
		let mut framed = BytesMut::new();
		crate::wire::write_var_u64(&mut framed, total_len as u64);
		framed.extend_from_slice(&buf);

		let mut bytes = framed.freeze();
		let decoded: RoomInfo = read_value(&mut bytes, WireType::ByteLength).unwrap();
		assert_eq!(decoded, room);
	}

	#[derive(Debug, Clone, PartialEq)]
	enum Shape {
		Null,
		Circle { radius: f32 },
		Square { side: f32 },
	}

	impl Polymorphic for Shape {
		fn subtype_id(&self) -> u32 {
			match self {
				Shape::Null => 0,
				Shape::Circle { .. } => 1,
				Shape::Square { .. } => 2,
			}
		}

		fn write_variant(&self, buf: &mut BytesMut) {
			match self {
				Shape::Null => {}
				Shape::Circle { radius } => {
					crate::wire::FieldTag::new(1, f32::WIRE_TYPE).write(buf);
					write_value(buf, radius);
				}
				Shape::Square { side } => {
					crate::wire::FieldTag::new(1, f32::WIRE_TYPE).write(buf);
					write_value(buf, side);
				}
			}
		}

		fn variant_size(&self) -> usize {
			match self {
				Shape::Null => 0,
				Shape::Circle { radius } => {
					crate::wire::FieldTag::new(1, f32::WIRE_TYPE).size() + value_size(radius)
				}
				Shape::Square { side } => {
					crate::wire::FieldTag::new(1, f32::WIRE_TYPE).size() + value_size(side)
				}
			}
		}

		fn read_variant(id: u32, buf: &mut Bytes) -> Result<Self, CodecError> {
			let mut value = 0.0f32;
			while bytes::Buf::has_remaining(buf) {
				let tag = crate::wire::FieldTag::read(buf)?;
				match tag.id {
					1 => value = read_value(buf, tag.wire_type).unwrap_or_default(),
					_ => tag.wire_type.skip(buf)?,
				}
			}
			match id {
				1 => Ok(Shape::Circle { radius: value }),
				2 => Ok(Shape::Square { side: value }),
				other => Err(CodecError::UnknownSubtype(other)),
			}
		}

		fn null_variant() -> Self {
			Shape::Null
		}
	}

	#[test]
	fn polymorphic_roundtrip() {
		for shape in [Shape::Null, Shape::Circle { radius: 1.5 }, Shape::Square { side: 2.0 }]
		{
			let mut buf = BytesMut::new();
			write_value(&mut buf, &shape);
			let mut bytes = buf.freeze();
			let decoded: Shape = read_value(&mut bytes, WireType::ByteLength).unwrap();
			assert_eq!(decoded, shape);
		}
	}

	#[test]
	fn polymorphic_unknown_subtype_yields_null() {
		let mut buf = BytesMut::new();
		crate::wire::write_var_u64(&mut buf, 99); // unknown subtype id
		let framed_len = buf.len();
		let mut framed = BytesMut::new();
		crate::wire::write_var_u64(&mut framed, framed_len as u64);
		framed.extend_from_slice(&buf);
		let mut bytes = framed.freeze();
		let decoded: Shape = read_value(&mut bytes, WireType::ByteLength).unwrap();
		assert_eq!(decoded, Shape::Null);
	}
}
