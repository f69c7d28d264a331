//! Value/type codec machinery (spec.md §4.1).
//!
//! [`Codec`] is implemented once per wire-level type and distinguishes the *type*
//! form (unframed contents, used for record fields and tuple/array elements) from the
//! *value* form (self-delimiting: `ByteLength` types get a varint length prefix,
//! fixed-width types don't). [`write_value`]/[`read_value`] add that framing generically
//! so every [`Codec`] impl only has to describe its unframed contents.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use uuid::Uuid;

use crate::error::CodecError;
use crate::wire::{self, WireType};

/// Implemented by every wire-level type: primitives, composites, and generated records.
pub trait Codec: Sized {
	const WIRE_TYPE: WireType;

	/// Writes the unframed contents (no length prefix, even for `ByteLength` types).
	fn write_type(&self, buf: &mut BytesMut);

	/// Byte length of what [`Self::write_type`] would write.
	fn type_size(&self) -> usize;

	/// Reads unframed contents. For `ByteLength` types, `buf` is a slice holding
	/// exactly the frame's payload; consuming less than all of it is legal (trailing
	/// bytes are simply the remainder of forward-compatible future fields).
	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError>;

	/// The zero/empty value, returned when decoding is skipped due to a warning.
	fn default_value() -> Self;
}

/// Writes `value` in its self-delimiting value form.
pub fn write_value<T: Codec>(buf: &mut BytesMut, value: &T) {
	match T::WIRE_TYPE {
		WireType::ByteLength => {
			wire::write_var_u64(buf, value.type_size() as u64);
			value.write_type(buf);
		}
		_ => value.write_type(buf),
	}
}

/// Byte length of what [`write_value`] would write.
pub fn value_size<T: Codec>(value: &T) -> usize {
	match T::WIRE_TYPE {
		WireType::ByteLength => {
			let inner = value.type_size();
			wire::var_u64_size(inner as u64) + inner
		}
		_ => value.type_size(),
	}
}

/// Reads a self-delimiting value, given the wire type the tag declared. Returns
/// `Ok(None)` (caller should warn+skip) on mismatch so the skip discipline of §4.1 is
/// centralized here rather than duplicated at every call site.
pub fn read_value<T: Codec>(
	buf: &mut Bytes,
	declared: WireType,
) -> Result<T, CodecError> {
	if declared != T::WIRE_TYPE {
		declared.skip(buf)?;
		return Err(CodecError::WireTypeMismatch { expected: T::WIRE_TYPE, actual: declared });
	}
	match T::WIRE_TYPE {
		WireType::ByteLength => {
			let len = wire::read_var_u64(buf)? as usize;
			if buf.remaining() < len {
				return Err(CodecError::Eof);
			}
			let mut framed = buf.split_to(len);
			T::read_type(&mut framed)
		}
		_ => T::read_type(buf),
	}
}

macro_rules! impl_varint_unsigned {
	($($t:ty),*) => {$(
		impl Codec for $t {
			const WIRE_TYPE: WireType = WireType::VarInt;
			fn write_type(&self, buf: &mut BytesMut) {
				wire::write_var_u64(buf, *self as u64);
			}
			fn type_size(&self) -> usize {
				wire::var_u64_size(*self as u64)
			}
			fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
				let v = wire::read_var_u64(buf)?;
				<$t>::try_from(v).map_err(|_| CodecError::VarIntTooLong)
			}
			fn default_value() -> Self { 0 }
		}
	)*};
}
impl_varint_unsigned!(u8, u16, u32, u64);

macro_rules! impl_varint_zigzag {
	($($t:ty),*) => {$(
		impl Codec for $t {
			const WIRE_TYPE: WireType = WireType::VarInt;
			fn write_type(&self, buf: &mut BytesMut) {
				wire::write_var_u64(buf, wire::zigzag_encode32(*self as i32) as u64);
			}
			fn type_size(&self) -> usize {
				wire::var_u64_size(wire::zigzag_encode32(*self as i32) as u64)
			}
			fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
				let v = wire::read_var_u64(buf)?;
				let decoded = wire::zigzag_decode32(v as u32);
				<$t>::try_from(decoded).map_err(|_| CodecError::VarIntTooLong)
			}
			fn default_value() -> Self { 0 }
		}
	)*};
}
impl_varint_zigzag!(i8, i16, i32);

impl Codec for bool {
	const WIRE_TYPE: WireType = WireType::VarInt;
	fn write_type(&self, buf: &mut BytesMut) {
		wire::write_var_u64(buf, *self as u64);
	}
	fn type_size(&self) -> usize {
		1
	}
	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		Ok(wire::read_var_u64(buf)? != 0)
	}
	fn default_value() -> Self {
		false
	}
}

impl Codec for char {
	const WIRE_TYPE: WireType = WireType::VarInt;
	fn write_type(&self, buf: &mut BytesMut) {
		wire::write_var_u64(buf, *self as u64);
	}
	fn type_size(&self) -> usize {
		wire::var_u64_size(*self as u64)
	}
	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		let v = wire::read_var_u64(buf)?;
		char::from_u32(v as u32).ok_or(CodecError::VarIntTooLong)
	}
	fn default_value() -> Self {
		'\0'
	}
}

impl Codec for f32 {
	const WIRE_TYPE: WireType = WireType::FourByte;
	fn write_type(&self, buf: &mut BytesMut) {
		buf.put_f32_le(*self);
	}
	fn type_size(&self) -> usize {
		4
	}
	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		if buf.remaining() < 4 {
			return Err(CodecError::Eof);
		}
		Ok(buf.get_f32_le())
	}
	fn default_value() -> Self {
		0.0
	}
}

impl Codec for f64 {
	const WIRE_TYPE: WireType = WireType::EightByte;
	fn write_type(&self, buf: &mut BytesMut) {
		buf.put_f64_le(*self);
	}
	fn type_size(&self) -> usize {
		8
	}
	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		if buf.remaining() < 8 {
			return Err(CodecError::Eof);
		}
		Ok(buf.get_f64_le())
	}
	fn default_value() -> Self {
		0.0
	}
}

impl Codec for String {
	const WIRE_TYPE: WireType = WireType::ByteLength;
	fn write_type(&self, buf: &mut BytesMut) {
		buf.put_slice(self.as_bytes());
	}
	fn type_size(&self) -> usize {
		self.len()
	}
	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		String::from_utf8(buf.to_vec()).map_err(|_| CodecError::InvalidUtf8)
	}
	fn default_value() -> Self {
		String::new()
	}
}

/// Three `f32`s, framed as a fixed 12-byte `ByteLength` blob.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3(pub f32, pub f32, pub f32);

impl Codec for Vec3 {
	const WIRE_TYPE: WireType = WireType::ByteLength;
	fn write_type(&self, buf: &mut BytesMut) {
		buf.put_f32_le(self.0);
		buf.put_f32_le(self.1);
		buf.put_f32_le(self.2);
	}
	fn type_size(&self) -> usize {
		12
	}
	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		if buf.remaining() < 12 {
			return Err(CodecError::Eof);
		}
		Ok(Vec3(buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le()))
	}
	fn default_value() -> Self {
		Vec3::default()
	}
}

/// A GUID, framed as a fixed 16-byte `ByteLength` blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub Uuid);

impl Codec for Guid {
	const WIRE_TYPE: WireType = WireType::ByteLength;
	fn write_type(&self, buf: &mut BytesMut) {
		buf.put_slice(self.0.as_bytes());
	}
	fn type_size(&self) -> usize {
		16
	}
	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		if buf.remaining() < 16 {
			return Err(CodecError::Eof);
		}
		let mut bytes = [0u8; 16];
		buf.copy_to_slice(&mut bytes);
		Ok(Guid(Uuid::from_bytes(bytes)))
	}
	fn default_value() -> Self {
		Guid(Uuid::nil())
	}
}

/// Header written before a collection's (or map's) elements: `id=0` means null,
/// `id=1` means present. Shared between arrays/sets/bags and maps.
fn write_presence_header(buf: &mut BytesMut, present: bool) {
	wire::write_var_u64(buf, if present { 1 } else { 0 });
}

fn presence_header_size(present: bool) -> usize {
	wire::var_u64_size(if present { 1 } else { 0 })
}

/// `Array<T>` / `list` / `bag`: a `ByteLength` frame with a presence header followed by
/// `0..n` elements in `T`'s value form. `Vec<T>` is used for both ordered arrays and
/// (at the wire level) sets/bags — uniqueness is a [`crate::dobj::Field`]-level concern,
/// not a wire-level one.
impl<T: Codec> Codec for Vec<T> {
	const WIRE_TYPE: WireType = WireType::ByteLength;

	fn write_type(&self, buf: &mut BytesMut) {
		write_presence_header(buf, true);
		for item in self {
			write_value(buf, item);
		}
	}

	fn type_size(&self) -> usize {
		presence_header_size(true) + self.iter().map(value_size).sum::<usize>()
	}

	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		if buf.is_empty() {
			return Ok(Vec::new());
		}
		let header = wire::read_var_u64(buf)?;
		if header == 0 {
			if buf.has_remaining() {
				return Err(CodecError::SpuriousTrailingBytes);
			}
			return Ok(Vec::new());
		}
		let mut items = Vec::new();
		while buf.has_remaining() {
			items.push(read_value(buf, T::WIRE_TYPE)?);
		}
		Ok(items)
	}

	fn default_value() -> Self {
		Vec::new()
	}
}

impl<T: Codec + Eq + Hash> Codec for HashSet<T> {
	const WIRE_TYPE: WireType = WireType::ByteLength;

	fn write_type(&self, buf: &mut BytesMut) {
		write_presence_header(buf, true);
		for item in self {
			write_value(buf, item);
		}
	}

	fn type_size(&self) -> usize {
		presence_header_size(true) + self.iter().map(value_size).sum::<usize>()
	}

	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		if buf.is_empty() {
			return Ok(HashSet::new());
		}
		let header = wire::read_var_u64(buf)?;
		if header == 0 {
			if buf.has_remaining() {
				return Err(CodecError::SpuriousTrailingBytes);
			}
			return Ok(HashSet::new());
		}
		let mut items = HashSet::new();
		while buf.has_remaining() {
			items.insert(read_value(buf, T::WIRE_TYPE)?);
		}
		Ok(items)
	}

	fn default_value() -> Self {
		HashSet::new()
	}
}

/// `Map<K,V>`: a `ByteLength` frame with a presence header then alternating key/value
/// pairs, both in value form.
impl<K: Codec + Eq + Hash, V: Codec> Codec for HashMap<K, V> {
	const WIRE_TYPE: WireType = WireType::ByteLength;

	fn write_type(&self, buf: &mut BytesMut) {
		write_presence_header(buf, true);
		for (k, v) in self {
			write_value(buf, k);
			write_value(buf, v);
		}
	}

	fn type_size(&self) -> usize {
		presence_header_size(true)
			+ self.iter().map(|(k, v)| value_size(k) + value_size(v)).sum::<usize>()
	}

	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		if buf.is_empty() {
			return Ok(HashMap::new());
		}
		let header = wire::read_var_u64(buf)?;
		if header == 0 {
			if buf.has_remaining() {
				return Err(CodecError::SpuriousTrailingBytes);
			}
			return Ok(HashMap::new());
		}
		let mut map = HashMap::new();
		while buf.has_remaining() {
			let k = read_value(buf, K::WIRE_TYPE)?;
			let v = read_value(buf, V::WIRE_TYPE)?;
			map.insert(k, v);
		}
		Ok(map)
	}

	fn default_value() -> Self {
		HashMap::new()
	}
}

/// A nullable value, framed as the "simple class" pattern of spec.md §4.1: a presence
/// varint (`0` = null, `1` = present) followed by the value form when present. Used for
/// any optional scalar/record field, independent of the array/map null encoding (which
/// is carried in-band by their own presence header instead).
impl<T: Codec> Codec for Option<T> {
	const WIRE_TYPE: WireType = WireType::ByteLength;

	fn write_type(&self, buf: &mut BytesMut) {
		match self {
			None => wire::write_var_u64(buf, 0),
			Some(v) => {
				wire::write_var_u64(buf, 1);
				write_value(buf, v);
			}
		}
	}

	fn type_size(&self) -> usize {
		match self {
			None => wire::var_u64_size(0),
			Some(v) => wire::var_u64_size(1) + value_size(v),
		}
	}

	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		if buf.is_empty() {
			return Ok(None);
		}
		let tag = wire::read_var_u64(buf)?;
		if tag == 0 {
			return Ok(None);
		}
		Ok(Some(read_value(buf, T::WIRE_TYPE)?))
	}

	fn default_value() -> Self {
		None
	}
}

/// A 2-tuple, framed per spec.md §4.1: a `ByteLength` frame containing one varint of
/// packed wire types (element 0 highest) followed by each element's value form. An
/// empty (zero-length) frame decodes to a zero-initialized tuple, with a warning
/// logged by the caller.
impl<A: Codec, B: Codec> Codec for (A, B) {
	const WIRE_TYPE: WireType = WireType::ByteLength;

	fn write_type(&self, buf: &mut BytesMut) {
		let packed = wire::pack_wire_types(&[A::WIRE_TYPE, B::WIRE_TYPE]);
		wire::write_var_u64(buf, packed);
		write_value(buf, &self.0);
		write_value(buf, &self.1);
	}

	fn type_size(&self) -> usize {
		let packed = wire::pack_wire_types(&[A::WIRE_TYPE, B::WIRE_TYPE]);
		wire::var_u64_size(packed) + value_size(&self.0) + value_size(&self.1)
	}

	fn read_type(buf: &mut Bytes) -> Result<Self, CodecError> {
		if buf.is_empty() {
			return Ok((A::default_value(), B::default_value()));
		}
		let packed = wire::read_var_u64(buf)?;
		let types = wire::unpack_wire_types(packed, 2);
		let a = read_value(buf, types[0]).unwrap_or_else(|error| {
			tracing::warn!(%error, element = 0, "tuple element decode failed, substituting default");
			A::default_value()
		});
		let b = read_value(buf, types[1]).unwrap_or_else(|error| {
			tracing::warn!(%error, element = 1, "tuple element decode failed, substituting default");
			B::default_value()
		});
		Ok((a, b))
	}

	fn default_value() -> Self {
		(A::default_value(), B::default_value())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip<T: Codec + PartialEq + std::fmt::Debug>(value: T) {
		let mut buf = BytesMut::new();
		write_value(&mut buf, &value);
		assert_eq!(buf.len(), value_size(&value));
		let mut bytes: Bytes = buf.freeze();
		let decoded: T = read_value(&mut bytes, T::WIRE_TYPE).unwrap();
		assert_eq!(decoded, value);
	}

	#[test]
	fn primitive_roundtrips() {
		roundtrip(true);
		roundtrip(false);
		roundtrip(42u8);
		roundtrip(65535u16);
		roundtrip(4_000_000_000u32);
		roundtrip(-17i32);
		roundtrip(i32::MIN);
		roundtrip(i32::MAX);
		roundtrip('x');
		roundtrip(1.5f32);
		roundtrip(-2.25f64);
		roundtrip("hello world".to_string());
		roundtrip(Vec3(1.0, 2.0, 3.0));
		roundtrip(Guid(Uuid::new_v4()));
	}

	#[test]
	fn array_roundtrip() {
		roundtrip(vec![1u32, 2, 3, 4]);
		roundtrip(Vec::<u32>::new());
	}

	#[test]
	fn null_array_is_zero_length() {
		let empty: Vec<u32> = Vec::new();
		let mut buf = BytesMut::new();
		write_value(&mut buf, &empty);
		// presence header alone, still non-zero-length frame; decode back to empty.
		let mut bytes = buf.freeze();
		let decoded: Vec<u32> = read_value(&mut bytes, WireType::ByteLength).unwrap();
		assert!(decoded.is_empty());
	}

	#[test]
	fn map_roundtrip() {
		let mut map = HashMap::new();
		map.insert(1u32, "one".to_string());
		map.insert(2u32, "two".to_string());
		roundtrip(map);
	}

	#[test]
	fn tuple_roundtrip() {
		roundtrip((7u32, "seven".to_string()));
	}

	#[test]
	fn empty_tuple_frame_is_zero_initialized() {
		let mut buf = BytesMut::new();
		crate::wire::write_var_u64(&mut buf, 0); // zero-length frame: no packed wire-types word, no elements
		let mut bytes = buf.freeze();
		let decoded: (u32, String) =
			read_value(&mut bytes, WireType::ByteLength).unwrap();
		assert_eq!(decoded, (0, String::new()));
	}

	#[test]
	fn wire_type_mismatch_skips_and_yields_default() {
		let mut buf = BytesMut::new();
		write_value(&mut buf, &42u32); // VarInt
		let mut bytes = buf.freeze();
		// Declare it as FourByte; reader should skip 4 bytes not matching varint len.
		let err = read_value::<f32>(&mut bytes, WireType::VarInt).unwrap_err();
		assert_eq!(err, CodecError::WireTypeMismatch {
			expected: WireType::FourByte,
			actual: WireType::VarInt,
		});
	}
}
