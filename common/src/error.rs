//! Errors raised by the codec and the data model.
//!
//! Codec errors are non-fatal by design (§4.1/§7): callers log them with
//! [`tracing::warn!`] and recover by skipping or substituting a default, they never
//! propagate as a hard failure of the surrounding decode. [`FriendlyError`] is the one
//! exception that crosses into user-facing territory, as a `SubscribeFailed` cause.

use thiserror::Error;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum CodecError {
	#[error("unexpected end of buffer")]
	Eof,
	#[error("varint exceeded 64 bits")]
	VarIntTooLong,
	#[error("wire type mismatch: expected {expected:?}, got {actual:?}")]
	WireTypeMismatch { expected: crate::wire::WireType, actual: crate::wire::WireType },
	#[error("tuple frame had {actual} bytes, expected at least {expected}")]
	TupleSizeMismatch { expected: usize, actual: usize },
	#[error("unknown subtype id {0}")]
	UnknownSubtype(u32),
	#[error("invalid utf8 string")]
	InvalidUtf8,
	#[error("trailing bytes after null collection")]
	SpuriousTrailingBytes,
}

/// An access-denied or validation failure that the server is permitted to surface
/// verbatim to the client, per spec.md §7.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct FriendlyError {
	pub message: String,
}

impl FriendlyError {
	pub fn new(message: impl Into<String>) -> Self {
		Self { message: message.into() }
	}
}
