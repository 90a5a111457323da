//! Resilient supervision for long-lived engine processes.
//!
//! - [`EngineWrapper`] keeps one engine process alive: state machine,
//!   automatic recovery with exponential backoff, circuit breaker, periodic
//!   health probes and a bounded queue for commands issued while recovering.
//! - [`EnginePool`] hands out wrappers keyed by `(purpose, game_id)` with
//!   capacity eviction, idle reuse and use-count-based recreation.
//!
//! Engine processes plug in through [`EngineProcess`] and [`EngineFactory`].

mod config;
mod error;
mod events;
mod pool;
mod process;
mod wrapper;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{KeeperConfig, PoolConfig, WrapperConfig, load_config};
pub use error::{ConfigError, EngineError};
pub use events::{EngineEvent, EngineState, Subscription};
pub use pool::{AllocationInfo, EnginePool, PoolKey, PoolStats};
pub use process::{EngineFactory, EngineProcess};
pub use wrapper::EngineWrapper;
