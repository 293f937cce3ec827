//! High-level store API.
//!
//! A [`Store`] is one storage root holding many datasets. It hands out
//! [`Dataset`](crate::storage::Dataset) handles and owns the operations that
//! span datasets: listing, deletion, the reverse file index and garbage
//! collection.

mod api;

pub use api::{Store, StoreConfig, DEFAULT_STATE_DIR};
