//! Wrapper state and observability events.
//!
//! [`EngineState`] is the wrapper's single source of truth for which
//! operations are legal. [`EngineEvent`]s are published to subscribers
//! registered through [`EngineWrapper::on_event`](crate::EngineWrapper::on_event);
//! they are informational only and never influence the state machine.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ── Engine State ─────────────────────────────────────────────

/// Lifecycle state of an engine wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineState {
    /// Created, no process started yet.
    Uninitialized,
    /// Process is being started.
    Initializing,
    /// Process is idle and accepts commands.
    Ready,
    /// A command exchange is in progress.
    Busy,
    /// The process is being replaced after a failure.
    Recovering,
    /// Recovery is disabled or exhausted; the circuit may be open.
    Failed,
    /// Torn down. Terminal.
    Terminated,
}

impl EngineState {
    /// Returns true when commands can be dispatched without initialization.
    pub fn is_initialized(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Recovering => "recovering",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

// ── Engine Events ────────────────────────────────────────────

/// Events emitted by a wrapper over its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    InitStart,
    InitSuccess,
    InitFail {
        error: String,
    },
    CommandStart {
        /// First command line of the exchange.
        command: String,
    },
    CommandSuccess {
        elapsed_ms: u64,
    },
    CommandFail {
        error: String,
    },
    CommandTimeout {
        timeout_ms: u64,
    },
    HealthCheck,
    HealthFail {
        /// Consecutive failed probes including this one.
        consecutive: u32,
        error: String,
    },
    RecoveryStart {
        attempt: u32,
        delay_ms: u64,
    },
    RecoverySuccess {
        attempt: u32,
    },
    RecoveryFail {
        attempt: u32,
        error: String,
    },
    CircuitOpen,
    CircuitClose,
    StateChanged {
        old: EngineState,
        new: EngineState,
    },
}

impl EngineEvent {
    /// Returns the `family:verb` name of the event, e.g. `recovery:start`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitStart => "init:start",
            Self::InitSuccess => "init:success",
            Self::InitFail { .. } => "init:fail",
            Self::CommandStart { .. } => "command:start",
            Self::CommandSuccess { .. } => "command:success",
            Self::CommandFail { .. } => "command:fail",
            Self::CommandTimeout { .. } => "command:timeout",
            Self::HealthCheck => "health:check",
            Self::HealthFail { .. } => "health:fail",
            Self::RecoveryStart { .. } => "recovery:start",
            Self::RecoverySuccess { .. } => "recovery:success",
            Self::RecoveryFail { .. } => "recovery:fail",
            Self::CircuitOpen => "circuit:open",
            Self::CircuitClose => "circuit:close",
            Self::StateChanged { .. } => "state:changed",
        }
    }
}

// ── Event Bus ────────────────────────────────────────────────

type Handler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Fan-out of events to subscriber callbacks.
///
/// Each handler runs in isolation: a panicking handler is caught and logged,
/// and the remaining handlers still receive the event.
#[derive(Default)]
pub(crate) struct EventBus {
    handlers: RwLock<Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl EventBus {
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        handler: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().push((id, Arc::new(handler)));
        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    pub(crate) fn emit(&self, event: &EngineEvent) {
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(event = event.name(), "event handler panicked");
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.handlers.write().retain(|(handler_id, _)| *handler_id != id);
    }
}

/// Handle returned by [`EngineWrapper::on_event`](crate::EngineWrapper::on_event).
///
/// Dropping it keeps the handler registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Remove the handler. A no-op once the wrapper is gone.
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_should_name_events_by_family_and_verb() {
        assert_eq!(EngineEvent::InitStart.name(), "init:start");
        assert_eq!(
            EngineEvent::RecoveryStart {
                attempt: 1,
                delay_ms: 10
            }
            .name(),
            "recovery:start"
        );
        assert_eq!(EngineEvent::CircuitOpen.name(), "circuit:open");
    }

    #[test]
    fn test_should_serialize_event_with_type_tag() {
        let event = EngineEvent::StateChanged {
            old: EngineState::Ready,
            new: EngineState::Busy,
        };

        let json = serde_json::to_value(&event).expect("should serialize");
        assert_eq!(json["type"], "stateChanged");
        assert_eq!(json["old"], "ready");
        assert_eq!(json["new"], "busy");

        let json = serde_json::to_value(EngineEvent::CommandTimeout { timeout_ms: 50 })
            .expect("should serialize");
        assert_eq!(json["timeoutMs"], 50);
    }

    #[test]
    fn test_should_isolate_panicking_handler() {
        let bus = Arc::new(EventBus::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _first = bus.subscribe(|_| panic!("handler failure"));
        let sink = Arc::clone(&seen);
        let _second = bus.subscribe(move |event| sink.lock().push(event.name()));

        bus.emit(&EngineEvent::InitStart);
        bus.emit(&EngineEvent::InitSuccess);

        assert_eq!(*seen.lock(), vec!["init:start", "init:success"]);
    }

    #[test]
    fn test_should_stop_delivery_after_unsubscribe() {
        let bus = Arc::new(EventBus::default());
        let count = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&count);
        let subscription = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&EngineEvent::HealthCheck);
        subscription.unsubscribe();
        bus.emit(&EngineEvent::HealthCheck);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_should_report_initialized_states() {
        assert!(EngineState::Ready.is_initialized());
        assert!(EngineState::Busy.is_initialized());
        assert!(!EngineState::Recovering.is_initialized());
        assert!(!EngineState::Failed.is_initialized());
    }
}
