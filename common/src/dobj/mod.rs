//! The DObject model: field building blocks, lifecycle/authority, and the worked
//! `Room` example (spec.md §3, §4.2, §8).

pub mod field;
pub mod object;
pub mod room;

pub use field::{MapField, QueueField, SetField, ValueField};
pub use object::{
	check_mutation_authority, check_queue_post_authority, Actor, Backing, DObject, DObjectState,
	DeltaEmitter,
};
pub use room::{ChatDelivered, ChatPost, Room, RoomDeltaSubscription};
