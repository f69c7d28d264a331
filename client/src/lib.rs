pub mod client;
pub mod connection;
pub mod handle;

pub use client::Client;
pub use connection::{Backoff, ConnectionState};
pub use handle::{Handle, IdRecycler};
