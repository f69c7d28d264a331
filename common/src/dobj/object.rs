//! DObject lifecycle state, authority rules, and the subscription-facing [`DObject`]
//! trait every concrete replicated type implements (spec.md §3.1, §3.2, §4.2).

use std::sync::Arc;

use bytes::Bytes;

use crate::error::CodecError;
use crate::message::MessageType;

/// Called with one already-framed delta (a `ValueChange`/`SetAdd`/`SetRemove`/
/// `MapSet`/`MapRemove` message, sans object-id envelope) each time a field mutates.
/// Installed by the server session that subscribes an object (spec.md §4.4
/// "`SubscribeToObject` ... hook `obj.messageGenerated`").
pub type DeltaEmitter = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Where a `DObject` is authoritative. Determines which side is allowed to mutate its
/// fields directly (spec.md §3.2) - the other side only ever applies deltas received
/// over the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Backing {
	/// The server holds the authoritative state; clients are read-only subscribers.
	Server,
	/// A client holds the authoritative state and the server relays it (spec.md §3.2's
	/// Firestore-backed case); the server applies deltas instead of producing them.
	Firestore,
}

/// Which side of the wire is attempting a mutation. Used only to check authority; it
/// has no bearing on wire representation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Actor {
	Server,
	Client,
}

/// The lifecycle a subscribed handle moves through (spec.md §3.1).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DObjectState {
	/// Subscribed, awaiting the server's Sync.
	Resolving,
	/// The subscribe was rejected or the path could not be resolved.
	Failed,
	/// Sync received; fields reflect live state and fire listeners on further deltas.
	Active,
	/// The connection dropped; fields retain their last-known values but deltas stop
	/// arriving until a reconnect re-subscribes and resyncs.
	Disconnected,
	/// The handle was released and will not be reused.
	Disposed,
}

/// Panics if `actor` is not permitted to directly mutate a `backing`-authoritative
/// object. This is a programming-error guard, not a recoverable condition: only the
/// authoritative side ever calls field setters directly (spec.md §3.2) - the other
/// side's local state is driven exclusively through [`DObject::apply_delta`].
pub fn check_mutation_authority(backing: Backing, actor: Actor) {
	let permitted = match backing {
		Backing::Server => actor == Actor::Server,
		Backing::Firestore => actor == Actor::Client,
	};
	assert!(
		permitted,
		"authority violation: {actor:?} may not directly mutate a {backing:?}-backed object"
	);
}

/// Panics if `actor` is not the client - only the client ever posts to a `Queue`
/// (spec.md §3.4 "Queue<Up,Down>"); the server only ever receives.
pub fn check_queue_post_authority(actor: Actor) {
	assert!(actor == Actor::Client, "authority violation: only the client may post to a queue");
}

/// A concrete replicated type: owns its fields, knows how to emit a full Sync, and how
/// to apply each incoming delta [`MessageType`] to the right field by id (spec.md
/// §4.2). Implementors are generated case-by-case rather than derived, the same way
/// [`crate::schema::Polymorphic`] types are - field tables differ enough in shape
/// (Value vs. Set vs. Map vs. Queue) that a single declarative macro would need as much
/// per-field special-casing as hand code.
pub trait DObject: Sized {
	/// Constructs an empty instance ready to be populated by a `Sync`, or to be
	/// mutated directly if `backing` makes the local side authoritative.
	fn new(backing: Backing) -> Self;

	/// Where this object is authoritative.
	fn backing(&self) -> Backing;

	/// Encodes a full Sync body: one `(field-id-wire-type, value)` pair per field,
	/// concatenated in field-id order, with no outer `MessageType` (the caller prefixes
	/// that once via [`crate::message::MessageType::Sync`]).
	fn encode_sync_body(&self) -> Bytes;

	/// Applies one already-dequeued delta message to this object's fields. `body` is
	/// the frame with the leading `MessageType` varint already consumed.
	fn apply_delta(&mut self, message_type: MessageType, body: Bytes) -> Result<(), CodecError>;

	/// Opaque handle returned by [`Self::subscribe_deltas`], passed back to
	/// [`Self::unsubscribe_deltas`] to detach exactly that one subscriber's listeners -
	/// a server-backed object is shared by every session subscribed to it, so
	/// `UnsubscribeFromObject` (spec.md §4.4) must be able to tear down one session's
	/// emitter without disturbing the others still attached.
	type DeltaSubscription: Send + 'static;

	/// Registers `emit` on every `Value`/`Set`/`Map` field so each mutation produces a
	/// framed delta message. `Queue` fields are excluded - a queue's downstream
	/// delivery is a routing decision the server makes explicitly, not an automatic
	/// broadcast (spec.md §3.4 "Queue<Up,Down>").
	fn subscribe_deltas(&mut self, emit: DeltaEmitter) -> Self::DeltaSubscription;

	/// Removes exactly the listeners `subscribe_deltas` installed for `token`.
	fn unsubscribe_deltas(&mut self, token: Self::DeltaSubscription);

	/// Dispatches a raw upstream `Queue::Post` frame (`(field-id-wire-type) ‖ payload`,
	/// with no `MessageType` of its own - spec.md §4.2) to the matching queue field's
	/// `on_post` listeners. Unknown field ids are skipped using the wire type alone.
	fn apply_queue_post(&self, body: Bytes) -> Result<(), CodecError>;
}
