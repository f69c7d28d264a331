//! The path resolver and root collection (spec.md §4.5).
//!
//! Only one `Collection<T>` field exists in this schema: the root's `rooms` field,
//! keyed by room name. `Resolve` therefore has exactly one hop to make - walk past the
//! root, consult `rooms` for the requested key, and either return its memoised child or
//! materialise a new one. Deeper schemas would chain more [`RoomCollection`]-shaped
//! types, one per `Collection<T>` field, each doing the same can_access/populate/memo
//! dance before recursing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use replicate_common::dobj::{Backing, Room};
use replicate_common::error::FriendlyError;
use replicate_common::path::Path;
use tokio::sync::OnceCell;

/// The static field id of the root's `rooms` collection (spec.md §3.3 "Paths").
pub const FIELD_ROOMS: u32 = 1;

type AccessCheck = Arc<dyn Fn(&str) -> BoxFuture<'static, Result<(), FriendlyError>> + Send + Sync>;
type Populate = Arc<dyn Fn(&mut Room) -> BoxFuture<'static, ()> + Send + Sync>;
type RoomSlot = Arc<OnceCell<Result<Arc<StdMutex<Room>>, FriendlyError>>>;

/// Per-key memoised resolution of `Collection<Room>` (spec.md §4.5): concurrent
/// subscribers to the same key share one `OnceCell`, so the key is constructed and
/// populated at most once regardless of how many sessions resolve it concurrently.
pub struct RoomCollection {
	rooms: StdMutex<HashMap<String, RoomSlot>>,
	can_access: AccessCheck,
	populate: Populate,
}

impl RoomCollection {
	pub fn new() -> Self {
		Self {
			rooms: StdMutex::new(HashMap::new()),
			can_access: Arc::new(|key| {
				let key = key.to_string();
				Box::pin(async move {
					if key == "private" {
						Err(FriendlyError::new("Access denied."))
					} else {
						Ok(())
					}
				})
			}),
			populate: Arc::new(|_room| Box::pin(async {})),
		}
	}

	/// Resolves `key`, constructing and populating a fresh [`Room`] the first time it's
	/// requested and sharing that in-flight construction across concurrent resolvers
	/// (spec.md §4.5 "Memoisation ... a map from key → pending-or-resolved future").
	pub async fn resolve(&self, key: &str) -> Result<Arc<StdMutex<Room>>, FriendlyError> {
		let cell = {
			let mut rooms = self.rooms.lock().unwrap();
			rooms.entry(key.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
		};
		cell.get_or_init(|| async move {
			(self.can_access)(key).await?;
			let mut room = Room::new(Backing::Server, key);
			(self.populate)(&mut room).await;
			Ok(Arc::new(StdMutex::new(room)))
		})
		.await
		.clone()
	}
}

impl Default for RoomCollection {
	fn default() -> Self {
		Self::new()
	}
}

/// What a resolved path refers to: the root (id always `0`, meta queue only) or a
/// [`Room`] under the `rooms` collection.
pub enum Resolved {
	Root,
	Room(Arc<StdMutex<Room>>),
}

impl std::fmt::Debug for Resolved {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Resolved::Root => f.write_str("Resolved::Root"),
			Resolved::Room(_) => f.write_str("Resolved::Room(..)"),
		}
	}
}

/// Walks `path` from the root (spec.md §4.5 "Given `Resolve(session, path, index)`").
/// This schema's root has exactly one `Collection<T>` field, so there is exactly one
/// hop to make; an unrecognised collection id or a path longer than one segment means
/// the schema has no such field, which is itself an access failure from the client's
/// point of view.
pub async fn resolve(rooms: &RoomCollection, path: &Path) -> Result<Resolved, FriendlyError> {
	if path.is_root() {
		return Ok(Resolved::Root);
	}
	let segments = path.segments();
	if segments.len() != 1 || segments[0].collection_id != FIELD_ROOMS {
		return Err(FriendlyError::new(format!("no such path: {path}")));
	}
	let room = rooms.resolve(&segments[0].key).await?;
	Ok(Resolved::Room(room))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn resolves_and_memoises_by_key() {
		let rooms = RoomCollection::new();
		let path = Path::root().child(FIELD_ROOMS, "lobby");
		let first = match resolve(&rooms, &path).await.unwrap() {
			Resolved::Room(r) => r,
			Resolved::Root => panic!("expected a room"),
		};
		let second = match resolve(&rooms, &path).await.unwrap() {
			Resolved::Room(r) => r,
			Resolved::Root => panic!("expected a room"),
		};
		assert!(Arc::ptr_eq(&first, &second));
	}

	#[tokio::test]
	async fn root_path_resolves_to_root() {
		let rooms = RoomCollection::new();
		assert!(matches!(resolve(&rooms, &Path::root()).await.unwrap(), Resolved::Root));
	}

	#[tokio::test]
	async fn access_denied_surfaces_as_friendly_error() {
		let rooms = RoomCollection::new();
		let path = Path::root().child(FIELD_ROOMS, "private");
		let err = resolve(&rooms, &path).await.unwrap_err();
		assert_eq!(err.message, "Access denied.");
	}

	#[tokio::test]
	async fn concurrent_resolvers_share_one_materialisation() {
		let rooms = Arc::new(RoomCollection::new());
		let path = Path::root().child(FIELD_ROOMS, "lobby");
		let a = {
			let rooms = rooms.clone();
			let path = path.clone();
			tokio::spawn(async move { resolve(&rooms, &path).await.ok() })
		};
		let b = {
			let rooms = rooms.clone();
			let path = path.clone();
			tokio::spawn(async move { resolve(&rooms, &path).await.ok() })
		};
		let (a, b) = (a.await.unwrap(), b.await.unwrap());
		let (Some(Resolved::Room(a)), Some(Resolved::Room(b))) = (a, b) else {
			panic!("expected both to resolve to a room");
		};
		assert!(Arc::ptr_eq(&a, &b));
	}
}
