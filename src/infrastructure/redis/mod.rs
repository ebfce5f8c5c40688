//! Redis infrastructure
//!
//! - `pool`: shared multiplexed connection for commands
//! - `ReconnectBackoff`: delays between Pub/Sub reconnect attempts

mod backoff;
pub mod pool;

pub use backoff::ReconnectBackoff;
pub use pool::{PoolError, RedisPool};
