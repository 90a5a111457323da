use std::time::Duration;

use thiserror::Error;

/// Failure of a wrapper or pool operation.
///
/// `Clone` so that one in-flight initialization result can be handed to every
/// caller that coalesced onto it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine initialization failed: {0}")]
    Init(String),

    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("command failed: {0}")]
    Command(String),

    #[error("engine process closed its output")]
    ProcessExited,

    #[error("engine not initialized")]
    NotInitialized,

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("command queue full ({0} pending)")]
    QueueFull(usize),

    #[error("command expired while queued after {}ms", .0.as_millis())]
    QueueExpired(Duration),

    #[error("engine terminated")]
    Terminated,
}

impl EngineError {
    /// Returns true for the only error class that triggers automatic recovery.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
