//! The field variants every DObject is built from (spec.md §3.4).
//!
//! Each field owns its own listener list and fires listeners in registration order.
//! Listener callbacks never propagate errors — per the Design Notes (spec.md §9), a
//! panicking/erroring listener is a programming error in user code, not something the
//! field machinery recovers from; we simply don't call back into fallible user code
//! from here at all (callbacks are infallible `Fn`).
//!
//! Listeners are individually removable via the [`ListenerId`] returned from
//! registration. A single client handle never needs this (the whole object is dropped
//! together), but a server-backed object is shared by every session subscribed to it,
//! so `UnsubscribeFromObject` (spec.md §4.4) must be able to detach exactly one
//! session's emitter without disturbing the others.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Identifies one registered listener so it can later be removed on its own, without
/// disturbing the others sharing the same field.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

struct ListenerSet<F: ?Sized> {
	next_id: u64,
	entries: Vec<(u64, Box<F>)>,
}

impl<F: ?Sized> ListenerSet<F> {
	fn new() -> Self {
		Self { next_id: 0, entries: Vec::new() }
	}

	fn push(&mut self, f: Box<F>) -> ListenerId {
		let id = self.next_id;
		self.next_id += 1;
		self.entries.push((id, f));
		ListenerId(id)
	}

	fn remove(&mut self, id: ListenerId) {
		self.entries.retain(|(i, _)| *i != id.0);
	}

	fn iter(&self) -> impl Iterator<Item = &F> {
		self.entries.iter().map(|(_, f)| f.as_ref())
	}
}

type Listener<T> = dyn Fn(&T) + Send + Sync;
type Listener2<A, B> = dyn Fn(&A, &B) + Send + Sync;

/// A single scalar/record value, replicated whole on every change (spec.md §3.4
/// "Value<T>"). There is no partial-field patching - the entire new value is sent.
pub struct ValueField<T> {
	current: T,
	on_change: ListenerSet<Listener<T>>,
}

impl<T: Clone> ValueField<T> {
	pub fn new(initial: T) -> Self {
		Self { current: initial, on_change: ListenerSet::new() }
	}

	pub fn current(&self) -> &T {
		&self.current
	}

	pub fn on_change(&mut self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
		self.on_change.push(Box::new(listener))
	}

	pub fn off_change(&mut self, id: ListenerId) {
		self.on_change.remove(id);
	}

	/// Authoritatively sets the value (server, or the client of a Firestore-backed
	/// object) and fires `on_change` listeners.
	pub fn set(&mut self, value: T) {
		self.current = value;
		for listener in self.on_change.iter() {
			listener(&self.current);
		}
	}

	/// Applies a `ValueChange` received from the wire. Identical to [`Self::set`] -
	/// values are always resent whole, so there's no diff to skip (spec.md §3.4).
	pub fn apply(&mut self, value: T) {
		self.set(value);
	}
}

/// An unordered, unique collection (spec.md §3.4 "Set<T>"). `add`/`remove` are no-ops
/// (no listener fires) when the element is already in the expected state.
pub struct SetField<T: Eq + Hash + Clone> {
	items: HashSet<T>,
	on_add: ListenerSet<Listener<T>>,
	on_remove: ListenerSet<Listener<T>>,
}

impl<T: Eq + Hash + Clone> SetField<T> {
	pub fn new() -> Self {
		Self { items: HashSet::new(), on_add: ListenerSet::new(), on_remove: ListenerSet::new() }
	}

	pub fn items(&self) -> &HashSet<T> {
		&self.items
	}

	pub fn on_add(&mut self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
		self.on_add.push(Box::new(listener))
	}

	pub fn off_add(&mut self, id: ListenerId) {
		self.on_add.remove(id);
	}

	pub fn on_remove(&mut self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
		self.on_remove.push(Box::new(listener))
	}

	pub fn off_remove(&mut self, id: ListenerId) {
		self.on_remove.remove(id);
	}

	/// Returns `true` if the element was newly added (and listeners fired).
	pub fn add(&mut self, item: T) -> bool {
		if self.items.insert(item.clone()) {
			for listener in self.on_add.iter() {
				listener(&item);
			}
			true
		} else {
			false
		}
	}

	/// Returns `true` if the element was present and removed (and listeners fired).
	pub fn remove(&mut self, item: &T) -> bool {
		if self.items.remove(item) {
			for listener in self.on_remove.iter() {
				listener(item);
			}
			true
		} else {
			false
		}
	}

	/// Converges this set to `new_state`, firing `removed` for entries absent from it
	/// and `added` for entries new to it, with no event for entries already equal
	/// (spec.md §4.2 "Full-state Sync ... performs a diff").
	pub fn sync_from(&mut self, new_state: HashSet<T>) {
		let removed: Vec<T> =
			self.items.iter().filter(|i| !new_state.contains(*i)).cloned().collect();
		for item in removed {
			self.remove(&item);
		}
		let added: Vec<T> =
			new_state.iter().filter(|i| !self.items.contains(*i)).cloned().collect();
		for item in added {
			self.add(item);
		}
	}
}

impl<T: Eq + Hash + Clone> Default for SetField<T> {
	fn default() -> Self {
		Self::new()
	}
}

/// A key-unique mapping (spec.md §3.4 "Map<K,V>"). `set` to the current value is a
/// no-op; `remove` of an absent key is a no-op.
pub struct MapField<K: Eq + Hash + Clone, V: PartialEq + Clone> {
	entries: HashMap<K, V>,
	on_set: ListenerSet<Listener2<K, V>>,
	on_remove: ListenerSet<Listener<K>>,
}

impl<K: Eq + Hash + Clone, V: PartialEq + Clone> MapField<K, V> {
	pub fn new() -> Self {
		Self { entries: HashMap::new(), on_set: ListenerSet::new(), on_remove: ListenerSet::new() }
	}

	pub fn entries(&self) -> &HashMap<K, V> {
		&self.entries
	}

	pub fn on_set(&mut self, listener: impl Fn(&K, &V) + Send + Sync + 'static) -> ListenerId {
		self.on_set.push(Box::new(listener))
	}

	pub fn off_set(&mut self, id: ListenerId) {
		self.on_set.remove(id);
	}

	pub fn on_remove(&mut self, listener: impl Fn(&K) + Send + Sync + 'static) -> ListenerId {
		self.on_remove.push(Box::new(listener))
	}

	pub fn off_remove(&mut self, id: ListenerId) {
		self.on_remove.remove(id);
	}

	/// Returns `true` if the value actually changed (and listeners fired).
	pub fn set(&mut self, key: K, value: V) -> bool {
		if self.entries.get(&key) == Some(&value) {
			return false;
		}
		self.entries.insert(key.clone(), value.clone());
		for listener in self.on_set.iter() {
			listener(&key, &value);
		}
		true
	}

	/// Returns `true` if the key was present and removed (and listeners fired).
	pub fn remove(&mut self, key: &K) -> bool {
		if self.entries.remove(key).is_some() {
			for listener in self.on_remove.iter() {
				listener(key);
			}
			true
		} else {
			false
		}
	}

	/// Converges this map to `new_state`: removes entries absent from it, and
	/// sets entries that are new or changed. No event fires for unchanged entries.
	pub fn sync_from(&mut self, new_state: HashMap<K, V>) {
		let removed: Vec<K> =
			self.entries.keys().filter(|k| !new_state.contains_key(*k)).cloned().collect();
		for key in removed {
			self.remove(&key);
		}
		for (key, value) in new_state {
			self.set(key, value);
		}
	}
}

impl<K: Eq + Hash + Clone, V: PartialEq + Clone> Default for MapField<K, V> {
	fn default() -> Self {
		Self::new()
	}
}

/// A bidirectional message channel (spec.md §3.4 "Queue<Up,Down>"). Queues never
/// retain messages - there is no stored state here, only listener lists.
pub struct QueueField<Up, Down> {
	on_post: ListenerSet<Listener<Up>>,
	on_receive: ListenerSet<Listener<Down>>,
}

impl<Up, Down> QueueField<Up, Down> {
	pub fn new() -> Self {
		Self { on_post: ListenerSet::new(), on_receive: ListenerSet::new() }
	}

	/// Server-side: fires when the client posts an upstream message.
	pub fn on_post(&mut self, listener: impl Fn(&Up) + Send + Sync + 'static) -> ListenerId {
		self.on_post.push(Box::new(listener))
	}

	pub fn off_post(&mut self, id: ListenerId) {
		self.on_post.remove(id);
	}

	/// Client-side: fires when a downstream message is received.
	pub fn on_receive(&mut self, listener: impl Fn(&Down) + Send + Sync + 'static) -> ListenerId {
		self.on_receive.push(Box::new(listener))
	}

	pub fn off_receive(&mut self, id: ListenerId) {
		self.on_receive.remove(id);
	}

	pub fn dispatch_post(&self, msg: &Up) {
		for listener in self.on_post.iter() {
			listener(msg);
		}
	}

	pub fn dispatch_receive(&self, msg: &Down) {
		for listener in self.on_receive.iter() {
			listener(msg);
		}
	}
}

impl<Up, Down> Default for QueueField<Up, Down> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{Arc, Mutex};

	#[test]
	fn set_add_remove_is_ordered_and_deduped() {
		let events = Arc::new(Mutex::new(Vec::new()));
		let mut field: SetField<String> = SetField::new();
		{
			let events = events.clone();
			field.on_add(move |i| events.lock().unwrap().push(format!("added {i}")));
		}
		{
			let events = events.clone();
			field.on_remove(move |i| events.lock().unwrap().push(format!("removed {i}")));
		}

		assert!(field.add("alice".into()));
		assert!(field.add("bob".into()));
		assert!(!field.add("alice".into())); // no-op: already present
		assert!(field.remove(&"alice".to_string()));
		assert!(!field.remove(&"alice".to_string())); // no-op: already gone

		assert_eq!(
			*events.lock().unwrap(),
			vec!["added alice", "added bob", "removed alice"]
		);
		assert_eq!(field.items(), &HashSet::from(["bob".to_string()]));
	}

	#[test]
	fn map_set_to_same_value_is_noop() {
		let set_count = Arc::new(Mutex::new(0));
		let mut field: MapField<String, i32> = MapField::new();
		{
			let set_count = set_count.clone();
			field.on_set(move |_, _| *set_count.lock().unwrap() += 1);
		}
		assert!(field.set("alice".into(), 7));
		assert!(!field.set("alice".into(), 7));
		assert_eq!(*set_count.lock().unwrap(), 1);
	}

	#[test]
	fn sync_from_fires_only_changed_entries() {
		let mut field: SetField<String> = SetField::new();
		field.add("alice".into());
		field.add("bob".into());

		let added = Arc::new(Mutex::new(Vec::new()));
		let removed = Arc::new(Mutex::new(Vec::new()));
		{
			let added = added.clone();
			field.on_add(move |i| added.lock().unwrap().push(i.clone()));
		}
		{
			let removed = removed.clone();
			field.on_remove(move |i| removed.lock().unwrap().push(i.clone()));
		}

		field.sync_from(HashSet::from(["bob".to_string(), "carol".to_string()]));
		assert_eq!(*removed.lock().unwrap(), vec!["alice".to_string()]);
		assert_eq!(*added.lock().unwrap(), vec!["carol".to_string()]);
	}

	#[test]
	fn removed_listener_stops_firing() {
		let calls = Arc::new(Mutex::new(0));
		let mut field: ValueField<i32> = ValueField::new(0);
		let id = {
			let calls = calls.clone();
			field.on_change(move |_| *calls.lock().unwrap() += 1)
		};
		field.set(1);
		field.off_change(id);
		field.set(2);
		assert_eq!(*calls.lock().unwrap(), 1);
	}
}
