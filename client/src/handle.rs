//! The id recycler and the live handle returned from [`crate::Client::resolve`]
//! (spec.md §4.3 "Handle table", "Id recycler").

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use replicate_common::dobj::{check_mutation_authority, Actor, DObject, DObjectState};
use replicate_common::message::MessageType;
use replicate_common::error::CodecError;

use crate::Client;

/// A min-heap of freed ids, so allocation always returns the smallest free id (or a
/// fresh one if none are free). Keeps the id space dense, which matters because ids
/// are sent on every message (spec.md §4.3).
#[derive(Debug, Default)]
pub struct IdRecycler {
	next_id: u32,
	freed: BinaryHeap<Reverse<u32>>,
}

impl IdRecycler {
	/// Id `0` is reserved for the root object and is never handed out here; the root's
	/// handle-table entry is installed directly by the connection state machine.
	pub fn new() -> Self {
		Self { next_id: 1, freed: BinaryHeap::new() }
	}

	pub fn alloc(&mut self) -> u32 {
		match self.freed.pop() {
			Some(Reverse(id)) => id,
			None => {
				let id = self.next_id;
				self.next_id += 1;
				id
			}
		}
	}

	pub fn free(&mut self, id: u32) {
		self.freed.push(Reverse(id));
	}
}

/// Type-erased delta application, so the handle table can hold objects of differing
/// concrete `DObject` types behind one map (spec.md §4.3 "Inbound dispatch"). `as_any`
/// lets [`crate::Client::resolve`] safely recover the concrete
/// [`TypedSubscription<T>`] when deduplicating a `Resolve` against a live handle.
pub trait Subscription: Send + Sync {
	fn apply_delta(&self, message_type: MessageType, body: Bytes) -> Result<(), CodecError>;
	fn set_state(&self, state: DObjectState);
	fn as_any(&self) -> &dyn std::any::Any;
}

pub(crate) struct TypedSubscription<T> {
	pub object: Arc<Mutex<T>>,
	pub state: Arc<Mutex<DObjectState>>,
}

impl<T: DObject + Send + 'static> Subscription for TypedSubscription<T> {
	fn apply_delta(&self, message_type: MessageType, body: Bytes) -> Result<(), CodecError> {
		self.object.lock().unwrap().apply_delta(message_type, body)
	}

	fn set_state(&self, state: DObjectState) {
		*self.state.lock().unwrap() = state;
	}

	fn as_any(&self) -> &dyn std::any::Any {
		self
	}
}

/// A live reference to a subscribed (or about-to-be-subscribed) `DObject`. Dropping
/// the last handle for a non-root object unmaps it from the handle table and recycles
/// its id (spec.md §4.3 "`Resolve` ... installs a dispose hook").
pub struct Handle<T> {
	pub(crate) object_id: u32,
	pub(crate) object: Arc<Mutex<T>>,
	pub(crate) state: Arc<Mutex<DObjectState>>,
	pub(crate) client: Client,
}

impl<T: DObject> Handle<T> {
	pub fn id(&self) -> u32 {
		self.object_id
	}

	pub fn state(&self) -> DObjectState {
		*self.state.lock().unwrap()
	}

	/// Reads the object under lock. Field listeners registered via `with_mut` on the
	/// authoritative side, or installed once at construction time, still fire as
	/// deltas are applied by the connection task.
	pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
		f(&self.object.lock().unwrap())
	}

	/// Mutates the object directly. Only valid on the authoritative side (spec.md
	/// §3.2) - panics otherwise, since only the authoritative side may originate
	/// changes rather than apply them.
	pub fn with_mut<R>(&self, actor: Actor, f: impl FnOnce(&mut T) -> R) -> R {
		let mut guard = self.object.lock().unwrap();
		check_mutation_authority(guard.backing(), actor);
		f(&mut guard)
	}

	/// Registers field listeners. Unlike [`Self::with_mut`], this is never gated by
	/// authority - either side may always observe changes, authoritative or applied.
	pub fn listen(&self, f: impl FnOnce(&mut T)) {
		f(&mut self.object.lock().unwrap())
	}

	/// Posts a raw `Queue::Post` frame - field tag plus payload, as built by e.g.
	/// `Room::encode_chat_post` - to this object on the server (spec.md §3.4/§4.2).
	pub fn post_queue(&self, payload: Bytes) {
		self.client.post_queue(self.object_id, payload);
	}
}

impl<T> Clone for Handle<T> {
	fn clone(&self) -> Self {
		Self {
			object_id: self.object_id,
			object: self.object.clone(),
			state: self.state.clone(),
			client: self.client.clone(),
		}
	}
}

impl<T> Drop for Handle<T> {
	fn drop(&mut self) {
		// The client's handle table keeps one strong `Arc` into `object` for the life
		// of the subscription (inside `TypedSubscription`), so that inbound deltas
		// still have somewhere to land even when no `Handle` is currently held.
		// strong_count 2 here is "this handle, plus the table's own" - i.e. this was
		// the last caller-held handle.
		if Arc::strong_count(&self.object) == 2 && self.object_id != 0 {
			self.client.dispose(self.object_id);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn recycler_reuses_smallest_freed_id_first() {
		let mut recycler = IdRecycler::new();
		let a = recycler.alloc();
		let b = recycler.alloc();
		let c = recycler.alloc();
		assert_eq!((a, b, c), (1, 2, 3));
		recycler.free(b);
		recycler.free(a);
		assert_eq!(recycler.alloc(), 1);
		assert_eq!(recycler.alloc(), 2);
		assert_eq!(recycler.alloc(), 4);
	}
}
