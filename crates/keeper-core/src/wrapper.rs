//! Resilient supervisor around one engine process.
//!
//! An [`EngineWrapper`] owns exactly one [`EngineProcess`] at a time and adds
//! a state machine on top of it:
//!
//! ```text
//! uninitialized ─init─▶ initializing ─ok─▶ ready ◀──▶ busy
//!                            │               ▲          │ timeout / health
//!                            └────fail──▶ recovering ◀──┘
//!                                          │ exhausted
//!                                          ▼
//!                 failed (circuit open) ─init after reset window─▶ initializing
//! ```
//!
//! Any non-terminal state moves to `terminated` on [`EngineWrapper::terminate`].
//!
//! Only timeouts trigger recovery. Recovery waits with exponential backoff,
//! replaces the process wholesale, replays the persistent configuration and
//! then drains the commands queued meanwhile in FIFO order. Every background
//! task (init, recovery, health probing, queue draining) observes the
//! wrapper's cancellation token and is aborted as a set on terminate.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::WrapperConfig;
use crate::error::EngineError;
use crate::events::{EngineEvent, EngineState, EventBus, Subscription};
use crate::process::{EngineFactory, EngineProcess, exchange};

/// Consecutive failed health probes that trigger recovery.
const HEALTH_FAILURE_THRESHOLD: u32 = 2;

static NEXT_WRAPPER_ID: AtomicU64 = AtomicU64::new(1);

type InitFuture = Shared<BoxFuture<'static, Result<(), EngineError>>>;

/// Held by a queued caller while its command runs; dropping it lets the
/// drain loop move on to the next entry.
type Turn = oneshot::Sender<()>;

/// A command issued while recovering, waiting for its turn.
struct QueuedCommand {
    id: u64,
    enqueued_at: Instant,
    timeout: Duration,
    turn: oneshot::Sender<Result<Turn, EngineError>>,
}

/// Bookkeeping guarded by a single lock.
struct Status {
    state: EngineState,
    /// Setup commands replayed after every (re)initialization.
    persistent_config: Vec<String>,
    recovery_attempts: u32,
    circuit_open: bool,
    last_failure: Option<Instant>,
    health_failures: u32,
    queue: VecDeque<QueuedCommand>,
    next_ticket: u64,
    init_in_flight: Option<InitFuture>,
    init_task: Option<AbortHandle>,
    recovery_task: Option<AbortHandle>,
    health_task: Option<AbortHandle>,
}

struct Inner {
    id: u64,
    config: WrapperConfig,
    factory: Arc<dyn EngineFactory>,
    status: Mutex<Status>,
    state_tx: watch::Sender<EngineState>,
    process: RwLock<Option<Arc<dyn EngineProcess>>>,
    /// Serializes command exchanges, probes and process replacement.
    exchange: tokio::sync::Mutex<()>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
}

/// How `send_command` proceeds from the current state.
enum Route {
    Init,
    Execute,
    Queued {
        id: u64,
        since: Instant,
        ticket: oneshot::Receiver<Result<Turn, EngineError>>,
    },
}

/// Outcome of one dispatch attempt.
enum Dispatch<T> {
    Done(T),
    /// The state changed while waiting for the exchange lock.
    Retry,
}

/// Shared handle to a supervised engine process.
///
/// Cloning is cheap; all clones drive the same state machine.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use keeper_core::{EngineFactory, EngineWrapper, WrapperConfig};
///
/// # async fn example(factory: Arc<dyn EngineFactory>) -> Result<(), keeper_core::EngineError> {
/// let wrapper = EngineWrapper::new(WrapperConfig::default(), factory);
/// wrapper.apply_config(["setoption name Threads value 2"]).await?;
/// let best = wrapper
///     .send_command(
///         ["position startpos", "go movetime 500"],
///         |line: &str| line.strip_prefix("bestmove ").map(str::to_owned),
///         Duration::from_secs(2),
///     )
///     .await?;
/// # let _ = best;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EngineWrapper {
    inner: Arc<Inner>,
}

impl fmt::Debug for EngineWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineWrapper")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl EngineWrapper {
    /// Create an uninitialized wrapper. No process is started until
    /// [`init`](Self::init) or the first command.
    pub fn new(config: WrapperConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Uninitialized);
        let inner = Inner {
            id: NEXT_WRAPPER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            factory,
            status: Mutex::new(Status {
                state: EngineState::Uninitialized,
                persistent_config: Vec::new(),
                recovery_attempts: 0,
                circuit_open: false,
                last_failure: None,
                health_failures: 0,
                queue: VecDeque::new(),
                next_ticket: 0,
                init_in_flight: None,
                init_task: None,
                recovery_task: None,
                health_task: None,
            }),
            state_tx,
            process: RwLock::new(None),
            exchange: tokio::sync::Mutex::new(()),
            events: Arc::new(EventBus::default()),
            cancel: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Process-unique identifier of this wrapper.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.inner.config
    }

    /// Returns true if both handles drive the same wrapper.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── State accessors ──────────────────────────────────────

    pub fn state(&self) -> EngineState {
        self.inner.status.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    /// Ready or busy: commands dispatch without an implicit init.
    pub fn is_initialized(&self) -> bool {
        self.state().is_initialized()
    }

    pub fn is_failed(&self) -> bool {
        self.state() == EngineState::Failed
    }

    pub fn is_recovering(&self) -> bool {
        self.state() == EngineState::Recovering
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == EngineState::Terminated
    }

    pub fn is_circuit_open(&self) -> bool {
        self.inner.status.lock().circuit_open
    }

    /// Number of commands waiting for recovery to finish.
    pub fn queue_length(&self) -> usize {
        self.inner.status.lock().queue.len()
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.inner.status.lock().recovery_attempts
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state_tx.subscribe()
    }

    /// Register an event handler.
    pub fn on_event(&self, handler: impl Fn(&EngineEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.subscribe(handler)
    }

    // ── Operations ───────────────────────────────────────────

    /// Start the engine process.
    ///
    /// Concurrent calls while initializing share the in-flight attempt.
    /// Returns immediately when already ready or busy.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::CircuitOpen` while the circuit breaker is open
    /// and its reset window has not elapsed, `EngineError::Terminated` after
    /// [`terminate`](Self::terminate), `EngineError::NotInitialized` while
    /// recovering, and `EngineError::Init` when the process fails to start.
    #[instrument(skip(self), fields(wrapper = self.inner.id))]
    pub async fn init(&self) -> Result<(), EngineError> {
        let pending = self.inner.update(|s, ev| self.inner.begin_init(s, ev))?;
        match pending {
            Some(pending) => pending.await,
            None => Ok(()),
        }
    }

    /// Send `commands` and wait for the first response line `matcher` accepts.
    ///
    /// While recovering, the command is queued (if enabled) and runs once
    /// recovery succeeds. Before initialization, an implicit
    /// [`init`](Self::init) runs first.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Timeout` if no line matched within `timeout`;
    /// this also starts recovery. Other failures (`ProcessExited`,
    /// `Command`) are returned without touching recovery state. Queueing
    /// fails with `QueueFull` or `QueueExpired`.
    #[instrument(skip_all, fields(wrapper = self.inner.id))]
    pub async fn send_command<I, S, T, M>(
        &self,
        commands: I,
        matcher: M,
        timeout: Duration,
    ) -> Result<T, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        M: Fn(&str) -> Option<T> + Send + Sync,
        T: Send,
    {
        let commands: Vec<String> = commands.into_iter().map(Into::into).collect();
        // Set when a queued command lost its turn and must keep its place.
        let mut requeue = None;

        loop {
            let route = self.inner.update(|s, _| self.inner.route(s, timeout, requeue.take()))?;
            match route {
                Route::Init => self.init().await?,
                Route::Execute => {
                    if let Dispatch::Done(value) = self.execute(&commands, &matcher, timeout).await? {
                        return Ok(value);
                    }
                }
                Route::Queued { id, since, ticket } => {
                    let turn = match tokio::time::timeout_at(since + timeout, ticket).await {
                        Ok(Ok(Ok(turn))) => turn,
                        Ok(Ok(Err(error))) => return Err(error),
                        Ok(Err(_)) => return Err(EngineError::Terminated),
                        Err(_) => {
                            self.inner.withdraw(id);
                            return Err(EngineError::QueueExpired(timeout));
                        }
                    };
                    let outcome = self.execute(&commands, &matcher, timeout).await;
                    drop(turn);
                    match outcome? {
                        Dispatch::Done(value) => return Ok(value),
                        Dispatch::Retry => requeue = Some(since),
                    }
                }
            }
        }
    }

    /// Replace the persistent configuration and apply it if initialized.
    ///
    /// The commands are replayed, in order, after every initialization and
    /// every successful recovery.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Terminated` after terminate, or the error of
    /// the acknowledgment exchange when applied to a live process.
    #[instrument(skip_all, fields(wrapper = self.inner.id))]
    pub async fn apply_config<I, S>(&self, commands: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands: Vec<String> = commands.into_iter().map(Into::into).collect();
        let live = self.inner.update(|s, _| {
            if s.state == EngineState::Terminated {
                return Err(EngineError::Terminated);
            }
            s.persistent_config = commands.clone();
            Ok(s.state.is_initialized())
        })?;
        if !live {
            return Ok(());
        }

        let mut exchange = commands;
        exchange.push(self.inner.config.probe_command.clone());
        self.send_command(exchange, self.inner.ack_matcher(), self.inner.config.command_timeout())
            .await
    }

    /// Send the new-game directive and wait for acknowledgment.
    ///
    /// A no-op unless initialized.
    #[instrument(skip(self), fields(wrapper = self.inner.id))]
    pub async fn reset_for_new_game(&self) -> Result<(), EngineError> {
        if !self.is_initialized() {
            return Ok(());
        }
        let commands = [
            self.inner.config.new_game_command.clone(),
            self.inner.config.probe_command.clone(),
        ];
        self.send_command(commands, self.inner.ack_matcher(), self.inner.config.command_timeout())
            .await
    }

    /// Write a command to the current process without waiting.
    ///
    /// Bypasses the exchange lock, so it reaches an engine in the middle of
    /// a command (e.g. `stop` during a search).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotInitialized` unless ready or busy.
    pub fn post_message(&self, command: &str) -> Result<(), EngineError> {
        if !self.is_initialized() {
            return Err(EngineError::NotInitialized);
        }
        let process = self.inner.process.read().clone();
        process.ok_or(EngineError::NotInitialized)?.send(command)
    }

    /// Wait until the wrapper is ready, initializing it if needed and
    /// waiting through an ongoing recovery.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Timeout` when `timeout` elapses first,
    /// `EngineError::Terminated` after terminate, and the `init` error when
    /// initialization fails without recovery in progress.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut states = self.watch_state();
        let wait = async {
            loop {
                let state = *states.borrow_and_update();
                match state {
                    EngineState::Ready | EngineState::Busy => return Ok(()),
                    EngineState::Terminated => return Err(EngineError::Terminated),
                    EngineState::Uninitialized | EngineState::Failed => {
                        if let Err(error) = self.init().await
                            && !self.is_recovering()
                        {
                            return Err(error);
                        }
                    }
                    EngineState::Initializing | EngineState::Recovering => {}
                }
                if states.changed().await.is_err() {
                    return Err(EngineError::Terminated);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(EngineError::Timeout(timeout)))
    }

    /// Tear the wrapper down.
    ///
    /// Stops every background task, rejects queued commands with
    /// `EngineError::Terminated` and kills the process before returning.
    /// Terminal: later operations fail with `EngineError::Terminated`.
    pub fn terminate(&self) {
        let inner = &self.inner;
        let queued = inner.update(|s, ev| {
            if s.state == EngineState::Terminated {
                return None;
            }
            inner.set_state(s, ev, EngineState::Terminated);
            let tasks = [s.init_task.take(), s.recovery_task.take(), s.health_task.take()];
            for task in tasks.into_iter().flatten() {
                task.abort();
            }
            s.init_in_flight = None;
            Some(std::mem::take(&mut s.queue))
        });
        let Some(queued) = queued else {
            return;
        };

        inner.cancel.cancel();
        for entry in queued {
            let _ = entry.turn.send(Err(EngineError::Terminated));
        }
        inner.discard_process();
        info!(wrapper = inner.id, "engine terminated");
    }

    /// Run one exchange on the current process.
    async fn execute<T, M>(
        &self,
        commands: &[String],
        matcher: &M,
        timeout: Duration,
    ) -> Result<Dispatch<T>, EngineError>
    where
        M: Fn(&str) -> Option<T> + Send + Sync,
        T: Send,
    {
        let inner = &self.inner;
        let _exchange = inner.exchange.lock().await;
        let admitted = inner.update(|s, ev| match s.state {
            EngineState::Ready => {
                inner.set_state(s, ev, EngineState::Busy);
                ev.push(EngineEvent::CommandStart {
                    command: commands.first().cloned().unwrap_or_default(),
                });
                Ok(true)
            }
            EngineState::Terminated => Err(EngineError::Terminated),
            _ => Ok(false),
        })?;
        if !admitted {
            return Ok(Dispatch::Retry);
        }

        let started = Instant::now();
        let process = inner.process.read().clone();
        let outcome = match process {
            Some(process) => tokio::select! {
                () = inner.cancel.cancelled() => Err(EngineError::Terminated),
                result = tokio::time::timeout(timeout, exchange(&*process, commands, matcher)) => {
                    result.unwrap_or(Err(EngineError::Timeout(timeout)))
                }
            },
            None => Err(EngineError::NotInitialized),
        };

        inner.update(|s, ev| match &outcome {
            Ok(_) => {
                if s.state == EngineState::Busy {
                    inner.set_state(s, ev, EngineState::Ready);
                }
                ev.push(EngineEvent::CommandSuccess {
                    elapsed_ms: millis(started.elapsed()),
                });
            }
            Err(EngineError::Terminated) => {}
            Err(error) if error.is_timeout() => {
                warn!(wrapper = inner.id, timeout_ms = millis(timeout), "command timed out");
                ev.push(EngineEvent::CommandTimeout {
                    timeout_ms: millis(timeout),
                });
                inner.on_failure(s, ev, error);
            }
            Err(error) => {
                debug!(wrapper = inner.id, %error, "command failed");
                if s.state == EngineState::Busy {
                    inner.set_state(s, ev, EngineState::Ready);
                }
                ev.push(EngineEvent::CommandFail {
                    error: error.to_string(),
                });
            }
        });

        outcome.map(Dispatch::Done)
    }
}

impl Inner {
    /// Mutate status under the lock, then publish the collected events
    /// with the lock released so handlers may call back into the wrapper.
    fn update<R>(&self, f: impl FnOnce(&mut Status, &mut Vec<EngineEvent>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut status = self.status.lock();
            f(&mut status, &mut events)
        };
        for event in &events {
            self.events.emit(event);
        }
        result
    }

    fn set_state(&self, s: &mut Status, ev: &mut Vec<EngineEvent>, new: EngineState) {
        let old = s.state;
        if old == new || old == EngineState::Terminated {
            return;
        }
        s.state = new;
        self.state_tx.send_replace(new);
        debug!(wrapper = self.id, %old, %new, "state changed");
        ev.push(EngineEvent::StateChanged { old, new });
    }

    fn ack_matcher(&self) -> impl Fn(&str) -> Option<()> + Send + Sync + '_ {
        move |line: &str| (line.trim() == self.config.probe_ack).then_some(())
    }

    /// Decide how a command proceeds. `requeue` carries the original enqueue
    /// time of a command that already held a queue slot; it goes back to the
    /// front without a capacity check.
    fn route(&self, s: &mut Status, timeout: Duration, requeue: Option<Instant>) -> Result<Route, EngineError> {
        match s.state {
            EngineState::Terminated => Err(EngineError::Terminated),
            EngineState::Uninitialized | EngineState::Initializing | EngineState::Failed => Ok(Route::Init),
            EngineState::Ready | EngineState::Busy => Ok(Route::Execute),
            EngineState::Recovering => {
                if !self.config.queue_during_recovery {
                    return Err(EngineError::NotInitialized);
                }
                // Callers that gave up no longer hold a slot.
                s.queue.retain(|entry| !entry.turn.is_closed());
                if requeue.is_none() && s.queue.len() >= self.config.max_queue_size {
                    return Err(EngineError::QueueFull(s.queue.len()));
                }

                let (turn, ticket) = oneshot::channel();
                s.next_ticket += 1;
                let entry = QueuedCommand {
                    id: s.next_ticket,
                    enqueued_at: requeue.unwrap_or_else(Instant::now),
                    timeout,
                    turn,
                };
                let (id, since) = (entry.id, entry.enqueued_at);
                match requeue {
                    Some(_) => s.queue.push_front(entry),
                    None => s.queue.push_back(entry),
                }
                debug!(wrapper = self.id, queued = s.queue.len(), "command queued during recovery");
                Ok(Route::Queued { id, since, ticket })
            }
        }
    }

    /// Give up a queue slot whose caller stopped waiting.
    fn withdraw(&self, id: u64) {
        self.status.lock().queue.retain(|entry| entry.id != id);
    }

    // ── Initialization ───────────────────────────────────────

    /// Returns the in-flight initialization to await, or `None` when
    /// already initialized.
    fn begin_init(
        self: &Arc<Self>,
        s: &mut Status,
        ev: &mut Vec<EngineEvent>,
    ) -> Result<Option<InitFuture>, EngineError> {
        match s.state {
            EngineState::Terminated => return Err(EngineError::Terminated),
            EngineState::Ready | EngineState::Busy => return Ok(None),
            EngineState::Recovering => return Err(EngineError::NotInitialized),
            EngineState::Initializing => {
                return s
                    .init_in_flight
                    .clone()
                    .map(Some)
                    .ok_or(EngineError::NotInitialized);
            }
            EngineState::Uninitialized | EngineState::Failed => {}
        }

        if s.circuit_open {
            let cooling = s
                .last_failure
                .is_some_and(|at| at.elapsed() < self.config.circuit_reset());
            if cooling {
                return Err(EngineError::CircuitOpen);
            }
            s.circuit_open = false;
            s.recovery_attempts = 0;
            info!(wrapper = self.id, "circuit breaker closed");
            ev.push(EngineEvent::CircuitClose);
        }

        self.set_state(s, ev, EngineState::Initializing);
        ev.push(EngineEvent::InitStart);

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.run_init().await });
        s.init_task = Some(task.abort_handle());
        let pending = async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(EngineError::Terminated),
                Err(e) => Err(EngineError::Init(e.to_string())),
            }
        }
        .boxed()
        .shared();
        s.init_in_flight = Some(pending.clone());
        Ok(Some(pending))
    }

    async fn run_init(self: Arc<Self>) -> Result<(), EngineError> {
        let started = self.replace_process().await;
        self.update(|s, ev| {
            s.init_in_flight = None;
            s.init_task = None;
            if s.state == EngineState::Terminated {
                self.discard_process();
                return Err(EngineError::Terminated);
            }
            match started {
                Ok(()) => {
                    s.recovery_attempts = 0;
                    s.health_failures = 0;
                    self.set_state(s, ev, EngineState::Ready);
                    ev.push(EngineEvent::InitSuccess);
                    self.start_health(s);
                    info!(wrapper = self.id, "engine ready");
                    Ok(())
                }
                Err(error) => {
                    warn!(wrapper = self.id, %error, "engine initialization failed");
                    ev.push(EngineEvent::InitFail {
                        error: error.to_string(),
                    });
                    self.on_failure(s, ev, &error);
                    Err(match error {
                        EngineError::Init(_) => error,
                        other => EngineError::Init(other.to_string()),
                    })
                }
            }
        })
    }

    /// Swap in a freshly started process with the persistent configuration
    /// applied. The previous process is killed first.
    async fn replace_process(&self) -> Result<(), EngineError> {
        let _exchange = self.exchange.lock().await;
        self.discard_process();

        let fresh: Arc<dyn EngineProcess> = Arc::from(self.factory.create());
        // Installed before booting so terminate kills a half-started process.
        *self.process.write() = Some(Arc::clone(&fresh));
        if self.cancel.is_cancelled() {
            self.discard_process();
            return Err(EngineError::Terminated);
        }
        if let Err(error) = self.boot(&*fresh).await {
            self.discard_process();
            return Err(error);
        }
        Ok(())
    }

    async fn boot(&self, process: &dyn EngineProcess) -> Result<(), EngineError> {
        let limit = self.config.init_timeout();
        let mut setup = self.status.lock().persistent_config.clone();
        let ack = self.ack_matcher();
        let boot = async {
            process.start().await?;
            if !setup.is_empty() {
                setup.push(self.config.probe_command.clone());
                exchange(process, &setup, &ack).await?;
            }
            Ok(())
        };
        tokio::time::timeout(limit, boot)
            .await
            .unwrap_or(Err(EngineError::Timeout(limit)))
    }

    fn discard_process(&self) {
        let previous = self.process.write().take();
        if let Some(process) = previous {
            process.kill();
        }
    }

    // ── Failure handling and recovery ────────────────────────

    /// Record a failure and either fail outright or start recovering.
    fn on_failure(self: &Arc<Self>, s: &mut Status, ev: &mut Vec<EngineEvent>, error: &EngineError) {
        if matches!(
            s.state,
            EngineState::Terminated | EngineState::Recovering | EngineState::Failed
        ) {
            return;
        }
        s.last_failure = Some(Instant::now());
        self.stop_health(s);

        if !self.config.auto_recover {
            warn!(wrapper = self.id, %error, "engine failed, auto-recovery disabled");
            self.set_state(s, ev, EngineState::Failed);
            return;
        }
        if let Some(attempt) = self.begin_attempt(s, ev) {
            let inner = Arc::clone(self);
            let task = tokio::spawn(async move { inner.recover(attempt).await });
            s.recovery_task = Some(task.abort_handle());
        }
    }

    /// Count a recovery attempt. Returns `None` once attempts are exhausted,
    /// after opening the circuit.
    fn begin_attempt(&self, s: &mut Status, ev: &mut Vec<EngineEvent>) -> Option<u32> {
        s.recovery_attempts += 1;
        let attempt = s.recovery_attempts;
        if attempt > self.config.max_recovery_attempts {
            self.open_circuit(s, ev);
            return None;
        }

        let delay_ms = millis(self.config.recovery_delay(attempt));
        self.set_state(s, ev, EngineState::Recovering);
        info!(wrapper = self.id, attempt, delay_ms, "starting recovery");
        ev.push(EngineEvent::RecoveryStart { attempt, delay_ms });
        Some(attempt)
    }

    fn open_circuit(&self, s: &mut Status, ev: &mut Vec<EngineEvent>) {
        s.circuit_open = true;
        s.recovery_task = None;
        self.set_state(s, ev, EngineState::Failed);
        warn!(
            wrapper = self.id,
            max_attempts = self.config.max_recovery_attempts,
            "recovery exhausted, circuit breaker open"
        );
        ev.push(EngineEvent::CircuitOpen);
        for entry in s.queue.drain(..) {
            let _ = entry.turn.send(Err(EngineError::CircuitOpen));
        }
    }

    async fn recover(self: Arc<Self>, mut attempt: u32) {
        loop {
            let delay = self.config.recovery_delay(attempt);
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            match self.replace_process().await {
                Ok(()) => {
                    let resumed = self.update(|s, ev| {
                        s.recovery_task = None;
                        if s.state != EngineState::Recovering {
                            self.discard_process();
                            return false;
                        }
                        s.recovery_attempts = 0;
                        s.health_failures = 0;
                        self.set_state(s, ev, EngineState::Ready);
                        info!(wrapper = self.id, attempt, "recovery succeeded");
                        ev.push(EngineEvent::RecoverySuccess { attempt });
                        self.start_health(s);
                        true
                    });
                    if resumed {
                        self.drain_queue().await;
                    }
                    return;
                }
                Err(error) => {
                    let next = self.update(|s, ev| {
                        if s.state != EngineState::Recovering {
                            s.recovery_task = None;
                            return None;
                        }
                        warn!(wrapper = self.id, attempt, %error, "recovery attempt failed");
                        s.last_failure = Some(Instant::now());
                        ev.push(EngineEvent::RecoveryFail {
                            attempt,
                            error: error.to_string(),
                        });
                        self.begin_attempt(s, ev)
                    });
                    match next {
                        Some(next) => attempt = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Hand queued commands their turn, one at a time, in FIFO order.
    async fn drain_queue(&self) {
        loop {
            let next = self.update(|s, _| {
                if s.state.is_initialized() {
                    s.queue.pop_front()
                } else {
                    None
                }
            });
            let Some(entry) = next else {
                return;
            };

            let waited = entry.enqueued_at.elapsed();
            if waited > entry.timeout {
                debug!(wrapper = self.id, waited_ms = millis(waited), "queued command expired");
                let _ = entry.turn.send(Err(EngineError::QueueExpired(waited)));
                continue;
            }

            let (done_tx, done_rx) = oneshot::channel::<()>();
            if entry.turn.send(Ok(done_tx)).is_err() {
                continue;
            }
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = done_rx => {}
            }
        }
    }

    // ── Health checks ────────────────────────────────────────

    fn start_health(self: &Arc<Self>, s: &mut Status) {
        self.stop_health(s);
        let Some(every) = self.config.health_check_interval() else {
            return;
        };
        let task = tokio::spawn(health_loop(Arc::downgrade(self), every, self.cancel.clone()));
        s.health_task = Some(task.abort_handle());
    }

    fn stop_health(&self, s: &mut Status) {
        if let Some(task) = s.health_task.take() {
            task.abort();
        }
    }

    async fn health_check(self: &Arc<Self>) {
        // A command in flight proves liveness better than a probe.
        let Ok(_exchange) = self.exchange.try_lock() else {
            return;
        };
        let due = self.update(|s, ev| {
            if s.state != EngineState::Ready {
                return false;
            }
            ev.push(EngineEvent::HealthCheck);
            true
        });
        if !due {
            return;
        }
        let process = self.process.read().clone();
        let Some(process) = process else {
            return;
        };

        let limit = self.config.health_check_timeout();
        let probe = [self.config.probe_command.clone()];
        let result = tokio::time::timeout(limit, exchange(&*process, &probe, &self.ack_matcher()))
            .await
            .unwrap_or(Err(EngineError::Timeout(limit)));

        self.update(|s, ev| match result {
            Ok(()) => s.health_failures = 0,
            Err(error) => {
                s.health_failures += 1;
                warn!(
                    wrapper = self.id,
                    consecutive = s.health_failures,
                    %error,
                    "health check failed"
                );
                ev.push(EngineEvent::HealthFail {
                    consecutive: s.health_failures,
                    error: error.to_string(),
                });
                if s.health_failures >= HEALTH_FAILURE_THRESHOLD && s.state == EngineState::Ready {
                    self.on_failure(s, ev, &error);
                }
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(process) = self.process.get_mut().take() {
            process.kill();
        }
    }
}

async fn health_loop(inner: Weak<Inner>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.health_check().await;
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
