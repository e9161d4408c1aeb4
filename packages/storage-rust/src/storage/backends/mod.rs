//! Concrete [`StorageBackend`](crate::storage::StorageBackend) implementations.
//!
//! Driver-backed media are behind cargo features; when a feature is off the
//! factory substitutes [`DisabledBackend`].

pub mod disabled;
pub mod file;
pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;
#[cfg(feature = "redb")]
pub mod redb;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(any(feature = "sqlite", feature = "mysql", feature = "postgres"))]
pub mod sql;

pub use disabled::DisabledBackend;
pub use file::{FileBackend, FileDocument, FileFormat, Json, JsonFileBackend, Yaml, YamlFileBackend};
pub use memory::MemoryBackend;
#[cfg(feature = "mongodb")]
pub use mongo::MongoBackend;
#[cfg(feature = "redb")]
pub use self::redb::RedbBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;
#[cfg(any(feature = "sqlite", feature = "mysql", feature = "postgres"))]
pub use sql::{SqlBackend, SqlDialect};
