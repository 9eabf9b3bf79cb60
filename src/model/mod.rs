//! Data model shared by the index, codec, and manager.

pub mod types;
