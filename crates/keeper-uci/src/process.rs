//! UCI engine as a child process.
//!
//! The child is spawned with piped stdin/stdout. A writer task drains an
//! unbounded channel into stdin and a reader task forwards stdout lines, so
//! `send` never blocks and `recv` sees lines in the order the engine wrote
//! them. `start` completes once the engine has answered both `uciok` and
//! `readyok`.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use keeper_core::{EngineError, EngineFactory, EngineProcess};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::matchers;

/// One UCI engine child process.
pub struct UciProcess {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
    input: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Handed to the reader task on start.
    output_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    output_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl fmt::Debug for UciProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UciProcess")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("pid", &self.child.lock().as_ref().and_then(Child::id))
            .finish()
    }
}

impl UciProcess {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            program: program.into(),
            args,
            child: Mutex::new(None),
            input: Mutex::new(None),
            output_tx: Mutex::new(Some(output_tx)),
            output_rx: tokio::sync::Mutex::new(output_rx),
        }
    }

    /// OS process id, once spawned and until reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(Child::id)
    }

    fn spawn(&self) -> Result<(), EngineError> {
        let output_tx = self
            .output_tx
            .lock()
            .take()
            .ok_or_else(|| EngineError::Init("engine process already started".to_owned()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Init(format!("failed to spawn {}: {e}", self.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Init("engine stdin not captured".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Init("engine stdout not captured".to_owned()))?;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(stdin, input_rx));
        tokio::spawn(read_lines(stdout, output_tx));

        debug!(program = %self.program, pid = child.id(), "engine process spawned");
        *self.child.lock() = Some(child);
        *self.input.lock() = Some(input_tx);
        Ok(())
    }

    /// Send `command` and read until `done` accepts a line.
    async fn await_line(&self, command: &str, done: fn(&str) -> bool) -> Result<(), EngineError> {
        let exited = || EngineError::Init(format!("engine exited before answering `{command}`"));
        self.send(command).map_err(|_| exited())?;
        loop {
            match self.recv().await {
                Some(line) if done(&line) => return Ok(()),
                Some(_) => {}
                None => return Err(exited()),
            }
        }
    }
}

impl EngineProcess for UciProcess {
    fn start(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            self.spawn()?;
            self.await_line("uci", |line| line.trim() == "uciok").await?;
            self.await_line("isready", |line| matchers::ready_ok(line).is_some())
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn send(&self, command: &str) -> Result<(), EngineError> {
        let input = self.input.lock();
        let input = input.as_ref().ok_or(EngineError::ProcessExited)?;
        trace!(command, "to engine");
        input
            .send(command.to_owned())
            .map_err(|_| EngineError::ProcessExited)
    }

    fn recv(&self) -> BoxFuture<'_, Option<String>> {
        async move { self.output_rx.lock().await.recv().await }.boxed()
    }

    fn discard_pending(&self) {
        if let Ok(mut rx) = self.output_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }

    fn kill(&self) {
        self.input.lock().take();
        self.output_tx.lock().take();
        if let Some(child) = self.child.lock().as_mut()
            && let Err(error) = child.start_kill()
        {
            debug!(%error, "engine process already gone");
        }
    }
}

async fn write_lines(mut stdin: ChildStdin, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        if let Err(error) = stdin.write_all(&bytes).await {
            debug!(%error, "engine stdin closed");
            return;
        }
        if stdin.flush().await.is_err() {
            return;
        }
    }
}

async fn read_lines(stdout: ChildStdout, output: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                trace!(line, "from engine");
                if output.send(line).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(error) => {
                debug!(%error, "engine stdout read failed");
                return;
            }
        }
    }
}

/// Spawns [`UciProcess`]es running `program args...`.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use keeper_core::{EngineWrapper, WrapperConfig};
/// use keeper_uci::UciFactory;
///
/// let factory = UciFactory::new("stockfish");
/// let wrapper = EngineWrapper::new(WrapperConfig::default(), Arc::new(factory));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UciFactory {
    program: String,
    args: Vec<String>,
}

impl UciFactory {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append command-line arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn into_shared(self) -> Arc<dyn EngineFactory> {
        Arc::new(self)
    }
}

impl EngineFactory for UciFactory {
    fn create(&self) -> Box<dyn EngineProcess> {
        Box::new(UciProcess::new(self.program.clone(), self.args.clone()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use keeper_core::{EngineWrapper, WrapperConfig};

    use super::*;
    use crate::commands::{self, SearchLimits};
    use crate::matchers::{BestMove, best_move};

    const FAKE_ENGINE: &str = r#"
while read -r line; do
  case "$line" in
    uci) echo "id name fake"; echo "uciok" ;;
    isready) echo "readyok" ;;
    go*) echo "info depth 1 score cp 13 pv e2e4"; echo "bestmove e2e4 ponder e7e5" ;;
    quit) exit 0 ;;
  esac
done
"#;

    fn fake_factory() -> UciFactory {
        UciFactory::new("sh").args(["-c", FAKE_ENGINE])
    }

    #[tokio::test]
    async fn test_should_complete_handshake_and_search() {
        let engine = fake_factory().create();
        engine.start().await.expect("should start");

        engine.send("go depth 1").expect("should send");
        assert_eq!(
            engine.recv().await.as_deref(),
            Some("info depth 1 score cp 13 pv e2e4")
        );
        assert_eq!(
            engine.recv().await.as_deref(),
            Some("bestmove e2e4 ponder e7e5")
        );
        engine.kill();
    }

    #[tokio::test]
    async fn test_should_fail_to_start_missing_program() {
        let engine = UciFactory::new("/nonexistent/keeper-engine").create();

        let result = engine.start().await;

        assert!(matches!(result, Err(EngineError::Init(_))));
    }

    #[tokio::test]
    async fn test_should_fail_start_when_engine_exits_during_handshake() {
        let engine = UciFactory::new("sh").args(["-c", "exit 0"]).create();

        let result = engine.start().await;

        assert!(matches!(result, Err(EngineError::Init(_))));
    }

    #[tokio::test]
    async fn test_should_close_output_after_kill() {
        let engine = fake_factory().create();
        engine.start().await.expect("should start");

        engine.kill();

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while engine.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "output should close after kill");
        assert!(matches!(engine.send("isready"), Err(EngineError::ProcessExited)));
    }

    #[tokio::test]
    async fn test_should_serve_wrapper_commands() {
        let config = WrapperConfig::builder().health_check_interval_ms(0).build();
        let wrapper = EngineWrapper::new(config, fake_factory().into_shared());
        wrapper
            .apply_config([commands::set_option("Hash", 16)])
            .await
            .expect("should store config");

        let best = wrapper
            .send_command(
                [commands::position(None, &[]), commands::go(&SearchLimits::depth(1))],
                best_move,
                Duration::from_secs(5),
            )
            .await
            .expect("should search");

        assert_eq!(
            best,
            BestMove {
                mv: "e2e4".to_owned(),
                ponder: Some("e7e5".to_owned()),
            }
        );
        wrapper.reset_for_new_game().await.expect("should reset");
        wrapper.terminate();
    }
}
