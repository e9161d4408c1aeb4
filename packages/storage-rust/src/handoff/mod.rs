//! Cross-process handoff of online records.
//!
//! - [`HandoffChannel`]: transfer-pending token, read-once payload, control stream
//! - [`MemoryHandoffChannel`]: in-process implementation
//! - [`RedisHandoffChannel`]: shared Redis implementation (feature `redis`)
//! - [`ControlMessage`]: start, stop and invalidation notices for the server group

pub mod channel;
#[cfg(feature = "redis")]
pub mod connector;
pub mod memory;
pub mod message;
#[cfg(feature = "redis")]
pub mod redis;

pub use channel::{HandoffChannel, Subscribers};
#[cfg(feature = "redis")]
pub use connector::{RedisConnector, RedisEndpoint};
pub use memory::MemoryHandoffChannel;
pub use message::{ControlKind, ControlMessage};
#[cfg(feature = "redis")]
pub use self::redis::{HandoffKeys, RedisHandoffChannel};
