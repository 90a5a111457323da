//! The boundary between a wrapper and the engine process it supervises.
//!
//! A wrapper only needs a text channel: it writes command lines, reads
//! response lines and matches them with a caller-supplied predicate. The
//! engine's own semantics stay with the caller.

use futures::future::BoxFuture;

use crate::error::EngineError;

/// One running engine process.
///
/// Implementations are owned exclusively by a single wrapper and are never
/// restarted: recovery discards the instance and asks the
/// [`EngineFactory`] for a fresh one. Dropping an instance must release the
/// underlying process.
pub trait EngineProcess: Send + Sync + 'static {
    /// Launch the process and resolve once it has reported ready.
    fn start(&self) -> BoxFuture<'_, Result<(), EngineError>>;

    /// Write one command line without waiting for a response.
    fn send(&self, command: &str) -> Result<(), EngineError>;

    /// Next response line, or `None` once the output is closed.
    fn recv(&self) -> BoxFuture<'_, Option<String>>;

    /// Drop response lines buffered from an abandoned exchange.
    fn discard_pending(&self) {}

    /// Tear the process down. Must not block.
    fn kill(&self);
}

/// Creates engine processes for a wrapper, once per (re)initialization.
pub trait EngineFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn EngineProcess>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Box<dyn EngineProcess> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn EngineProcess> {
        self()
    }
}

/// Send `commands` in order and read lines until `matcher` accepts one.
///
/// Not bounded in time; callers wrap it in a timeout.
pub(crate) async fn exchange<T, M>(
    process: &dyn EngineProcess,
    commands: &[String],
    matcher: &M,
) -> Result<T, EngineError>
where
    M: Fn(&str) -> Option<T> + ?Sized,
{
    process.discard_pending();
    for command in commands {
        process.send(command)?;
    }
    loop {
        let Some(line) = process.recv().await else {
            return Err(EngineError::ProcessExited);
        };
        if let Some(value) = matcher(&line) {
            return Ok(value);
        }
    }
}
