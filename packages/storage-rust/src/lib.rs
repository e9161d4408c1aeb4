//! Skyhold Storage: pluggable player-record backends, timestamp lock
//! protocol, online cache with batch flushing and cross-process handoff.

pub mod config;
pub mod error;
pub mod handoff;
pub mod keyed_lock;
pub mod manager;
pub mod storage;

pub use config::{
    BackendKind, ConnectionConfig, HandoffConfig, IndexCacheConfig, ManagerConfig, PoolConfig,
    SkyholdConfig, StorageConfig,
};
pub use error::{StorageError, StorageResult};
pub use handoff::{ControlKind, ControlMessage, HandoffChannel, MemoryHandoffChannel};
pub use manager::{
    ActivationOutcome, DeactivationOutcome, OnlineHandle, RecordSource, StorageManager,
};
pub use storage::{BackendFactory, IslandIndexCache, StorageBackend};
