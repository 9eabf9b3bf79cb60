//! Generic caching primitives shared by the browser's small key/value stores.

pub mod favorites;
pub mod write_behind;

pub use favorites::FavoritesCache;
pub use write_behind::{BackingStore, WriteBehindCache};
