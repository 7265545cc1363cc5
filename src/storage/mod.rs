//! Storage backends
//!
//! ## Table of Contents
//! - **state**: Small mutable key-value state (task ledger)
//! - **object**: Durable, create-if-absent object storage (experiments, partial results)
//! - **s3**: S3-compatible object store (feature `s3`)

pub mod object;
pub mod s3;
pub mod state;

pub use object::{join_path, BoxedObjectStore, LocalObjectStore, MemoryObjectStore, ObjectStore};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;
pub use s3::S3Config;
pub use state::{
    memory_store, store_get_json, store_set_json, BoxedStateStore, FileStore, MemoryStore,
    StateStore,
};
