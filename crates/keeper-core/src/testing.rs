//! Scriptable in-memory engine for tests.
//!
//! An [`EngineScript`] is shared by every [`ScriptedEngine`] its factory
//! creates, so a test can flip behavior (hang, fail to start) between the
//! original process and its recovered replacement, and inspect what each
//! process was sent.
//!
//! Built-in responses:
//!
//! | command     | response                                  |
//! |-------------|-------------------------------------------|
//! | `uci`       | `id name scripted`, `uciok`               |
//! | `isready`   | `readyok`                                 |
//! | `go ...`    | `info depth 1 score cp 20`, `bestmove e2e4` |
//! | `echo TEXT` | `TEXT`                                    |
//! | `quit`      | closes the output                         |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::process::{EngineFactory, EngineProcess};

/// Shared behavior and recordings for scripted engines.
#[derive(Debug, Default)]
pub struct EngineScript {
    fail_starts: AtomicBool,
    hanging: AtomicBool,
    created: AtomicU32,
    killed: AtomicU32,
    sent: Mutex<Vec<(u32, String)>>,
}

impl EngineScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Factory producing engines bound to this script.
    pub fn factory(self: &Arc<Self>) -> Arc<dyn EngineFactory> {
        let script = Arc::clone(self);
        Arc::new(move || -> Box<dyn EngineProcess> { Box::new(ScriptedEngine::new(Arc::clone(&script))) })
    }

    /// Make every subsequent `start()` fail.
    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Make every engine stop answering commands.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    /// Number of engines created so far.
    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of `kill()` calls received across all engines.
    pub fn killed(&self) -> u32 {
        self.killed.load(Ordering::SeqCst)
    }

    /// Commands sent to the engine with the given 1-based creation index.
    pub fn sent_to(&self, engine: u32) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(index, _)| *index == engine)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Commands sent to any engine, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, command)| command.clone()).collect()
    }
}

/// An in-memory engine answering a fixed command table.
#[derive(Debug)]
pub struct ScriptedEngine {
    index: u32,
    script: Arc<EngineScript>,
    output_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    output_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ScriptedEngine {
    pub fn new(script: Arc<EngineScript>) -> Self {
        let index = script.created.fetch_add(1, Ordering::SeqCst) + 1;
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            index,
            script,
            output_tx: Mutex::new(Some(output_tx)),
            output_rx: tokio::sync::Mutex::new(output_rx),
        }
    }

    fn reply(&self, lines: &[&str]) {
        if let Some(tx) = self.output_tx.lock().as_ref() {
            for line in lines {
                let _ = tx.send((*line).to_owned());
            }
        }
    }
}

impl EngineProcess for ScriptedEngine {
    fn start(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        let result = if self.script.fail_starts.load(Ordering::SeqCst) {
            Err(EngineError::Init("scripted start failure".to_owned()))
        } else {
            Ok(())
        };
        futures::future::ready(result).boxed()
    }

    fn send(&self, command: &str) -> Result<(), EngineError> {
        if self.output_tx.lock().is_none() {
            return Err(EngineError::ProcessExited);
        }
        self.script.sent.lock().push((self.index, command.to_owned()));

        if self.script.hanging.load(Ordering::SeqCst) {
            return Ok(());
        }
        match command {
            "uci" => self.reply(&["id name scripted", "uciok"]),
            "isready" => self.reply(&["readyok"]),
            "quit" => {
                self.output_tx.lock().take();
            }
            _ if command.starts_with("go") => {
                self.reply(&["info depth 1 score cp 20", "bestmove e2e4"]);
            }
            _ => {
                if let Some(text) = command.strip_prefix("echo ") {
                    self.reply(&[text]);
                }
            }
        }
        Ok(())
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
        self.script.killed.fetch_add(1, Ordering::SeqCst);
        self.output_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_should_answer_probe_and_search() {
        let script = EngineScript::new();
        let engine = script.factory().create();
        engine.start().await.expect("should start");

        engine.send("isready").expect("should send");
        assert_eq!(engine.recv().await.as_deref(), Some("readyok"));

        engine.send("go depth 1").expect("should send");
        assert_eq!(engine.recv().await.as_deref(), Some("info depth 1 score cp 20"));
        assert_eq!(engine.recv().await.as_deref(), Some("bestmove e2e4"));
        assert_eq!(script.sent_to(1), vec!["isready", "go depth 1"]);
    }

    #[tokio::test]
    async fn test_should_close_output_on_quit() {
        let script = EngineScript::new();
        let engine = script.factory().create();

        engine.send("quit").expect("should send");
        assert!(engine.recv().await.is_none());
        assert!(matches!(engine.send("isready"), Err(EngineError::ProcessExited)));
    }

    #[tokio::test]
    async fn test_should_fail_start_when_scripted() {
        let script = EngineScript::new();
        script.set_fail_starts(true);
        let engine = script.factory().create();

        assert!(matches!(engine.start().await, Err(EngineError::Init(_))));
    }
}
