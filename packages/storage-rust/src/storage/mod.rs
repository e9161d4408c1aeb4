//! Durable storage layer.
//!
//! - [`StorageBackend`]: the capability interface every medium implements
//! - [`backends`]: file, relational, key-value, document and memory media
//! - [`IslandIndexCache`]: island lookup cache for backends without a native index
//! - [`BackendFactory`]: maps a configured [`BackendKind`](crate::config::BackendKind)
//!   to a concrete backend

pub mod backend;
pub mod backends;
pub mod factory;
pub mod index_cache;

pub use backend::StorageBackend;
pub use factory::BackendFactory;
pub use index_cache::IslandIndexCache;
