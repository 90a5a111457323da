//! Keyed pool of engine wrappers.
//!
//! Allocations are keyed by `(purpose, game_id)`. Releasing an allocation
//! parks its wrapper as idle under its purpose so a later game with the same
//! purpose can reuse the warm process. Three policies bound resource use:
//!
//! - **Capacity**: at most `max_engines` allocations; acquiring past that
//!   evicts the oldest allocation.
//! - **Idle timeout**: an idle wrapper not reused within `idle_timeout_ms`
//!   is terminated.
//! - **Use count**: a wrapper used more than `max_uses_before_recreate`
//!   times is terminated on release instead of idled.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{PoolConfig, WrapperConfig};
use crate::error::EngineError;
use crate::events::EngineState;
use crate::process::EngineFactory;
use crate::wrapper::EngineWrapper;

// ── Keys and Reports ─────────────────────────────────────────

/// Identity of one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub purpose: String,
    pub game_id: String,
}

impl PoolKey {
    pub fn new(purpose: impl Into<String>, game_id: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            game_id: game_id.into(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.purpose, self.game_id)
    }
}

/// Snapshot of one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationInfo {
    pub purpose: String,
    pub game_id: String,
    pub wrapper_id: u64,
    pub use_count: u32,
    pub age_ms: u64,
    pub state: EngineState,
}

/// Pool occupancy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub allocated: usize,
    pub idle: usize,
    pub total: usize,
    /// Wrappers created over the pool's lifetime.
    pub total_created: u64,
}

// ── Bookkeeping ──────────────────────────────────────────────

struct Allocation {
    wrapper: EngineWrapper,
    use_count: u32,
    allocated_at: Instant,
    /// Tie-breaker for eviction order.
    sequence: u64,
}

struct IdleEntry {
    id: u64,
    wrapper: EngineWrapper,
    purpose: String,
    /// Use count carried over to the next allocation.
    uses: u32,
    idle_since: Instant,
    timer: AbortHandle,
}

#[derive(Default)]
struct Slots {
    allocations: HashMap<PoolKey, Allocation>,
    idle: Vec<IdleEntry>,
    total_created: u64,
    next_id: u64,
}

impl Slots {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Pop the oldest reusable idle wrapper for `purpose`. Failed or
    /// terminated entries found on the way are removed and terminated.
    fn take_idle(&mut self, purpose: &str) -> Option<(EngineWrapper, u32)> {
        while let Some(index) = self.idle.iter().position(|entry| entry.purpose == purpose) {
            let entry = self.idle.remove(index);
            entry.timer.abort();
            if entry.wrapper.is_failed() || entry.wrapper.is_terminated() {
                debug!(wrapper = entry.wrapper.id(), purpose, "discarding unusable idle engine");
                entry.wrapper.terminate();
                continue;
            }
            debug!(
                wrapper = entry.wrapper.id(),
                purpose,
                idle_ms = entry.idle_since.elapsed().as_millis() as u64,
                "reusing idle engine"
            );
            return Some((entry.wrapper, entry.uses));
        }
        None
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .allocations
            .iter()
            .min_by_key(|(_, allocation)| (allocation.allocated_at, allocation.sequence))
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest
            && let Some(allocation) = self.allocations.remove(&key)
        {
            info!(key = %key, wrapper = allocation.wrapper.id(), "pool at capacity, evicting oldest allocation");
            allocation.wrapper.terminate();
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    wrapper_config: WrapperConfig,
    factory: Arc<dyn EngineFactory>,
    slots: Mutex<Slots>,
    cancel: CancellationToken,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        for entry in self.slots.get_mut().idle.drain(..) {
            entry.wrapper.terminate();
        }
    }
}

/// How [`EnginePool::acquire`] obtained its wrapper.
enum Origin {
    Existing,
    Reused,
    Created,
}

// ── Engine Pool ──────────────────────────────────────────────

/// Pool of engine wrappers keyed by purpose and game.
///
/// Cloning is cheap; clones share the same pool. Removing an allocation and
/// terminating its wrapper happen under the pool lock, so a concurrent
/// `acquire` never observes an evicted wrapper.
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnginePool").field("stats", &self.stats()).finish()
    }
}

impl EnginePool {
    /// Create an empty pool. Every wrapper it creates uses `wrapper_config`
    /// and gets its processes from `factory`.
    pub fn new(config: PoolConfig, wrapper_config: WrapperConfig, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                wrapper_config,
                factory,
                slots: Mutex::new(Slots::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the wrapper allocated to `(purpose, game_id)`.
    ///
    /// Returns the existing allocation if there is one, otherwise reuses an
    /// idle wrapper with the same purpose, otherwise creates and initializes
    /// a new one. At capacity, the oldest allocation is evicted first.
    ///
    /// # Errors
    ///
    /// Returns the initialization error of a newly created wrapper; the
    /// allocation is not kept in that case. A concurrent caller for the same
    /// key waits for that initialization and gets the same error.
    #[instrument(skip(self))]
    pub async fn acquire(&self, purpose: &str, game_id: &str) -> Result<EngineWrapper, EngineError> {
        let key = PoolKey::new(purpose, game_id);
        let (wrapper, origin) = self.checkout(&key);

        match origin {
            Origin::Existing => {
                // Join the first caller's initialization and share its outcome.
                if matches!(wrapper.state(), EngineState::Uninitialized | EngineState::Initializing) {
                    wrapper.init().await?;
                }
            }
            Origin::Reused => {
                if self.inner.config.reset_on_reuse
                    && let Err(error) = wrapper.reset_for_new_game().await
                {
                    warn!(key = %key, %error, "new-game reset failed on reused engine");
                }
            }
            Origin::Created => {
                if let Err(error) = wrapper.init().await {
                    warn!(key = %key, %error, "new engine failed to initialize");
                    self.abandon(&key, &wrapper);
                    return Err(error);
                }
            }
        }
        Ok(wrapper)
    }

    /// Reserve the key with a wrapper, all under one lock.
    fn checkout(&self, key: &PoolKey) -> (EngineWrapper, Origin) {
        let mut slots = self.inner.slots.lock();
        if let Some(allocation) = slots.allocations.get_mut(key) {
            allocation.use_count += 1;
            debug!(key = %key, use_count = allocation.use_count, "reusing allocation");
            return (allocation.wrapper.clone(), Origin::Existing);
        }

        let reused = slots.take_idle(&key.purpose);
        if reused.is_none() && slots.allocations.len() >= self.inner.config.max_engines {
            slots.evict_oldest();
        }
        let (wrapper, uses, origin) = match reused {
            Some((wrapper, uses)) => (wrapper, uses + 1, Origin::Reused),
            None => {
                slots.total_created += 1;
                let wrapper = EngineWrapper::new(self.inner.wrapper_config.clone(), Arc::clone(&self.inner.factory));
                info!(key = %key, wrapper = wrapper.id(), "creating engine");
                (wrapper, 1, Origin::Created)
            }
        };
        let sequence = slots.next_id();
        slots.allocations.insert(
            key.clone(),
            Allocation {
                wrapper: wrapper.clone(),
                use_count: uses,
                allocated_at: Instant::now(),
                sequence,
            },
        );
        (wrapper, origin)
    }

    /// Drop a reservation whose wrapper failed to initialize.
    fn abandon(&self, key: &PoolKey, wrapper: &EngineWrapper) {
        let mut slots = self.inner.slots.lock();
        if slots
            .allocations
            .get(key)
            .is_some_and(|allocation| allocation.wrapper.ptr_eq(wrapper))
        {
            slots.allocations.remove(key);
        }
        wrapper.terminate();
    }

    /// Release the allocation for `(purpose, game_id)`.
    ///
    /// The wrapper is terminated if `terminate` is set, if it is failed or
    /// terminated, or if it exceeded the use limit. Otherwise it becomes idle
    /// and is terminated after the idle timeout unless reused first.
    /// Releasing an unknown key is a no-op.
    #[instrument(skip(self))]
    pub fn release(&self, purpose: &str, game_id: &str, terminate: bool) {
        let key = PoolKey::new(purpose, game_id);
        let mut slots = self.inner.slots.lock();
        let Some(allocation) = slots.allocations.remove(&key) else {
            debug!(key = %key, "release of unknown allocation ignored");
            return;
        };

        let wrapper = allocation.wrapper;
        let worn_out = allocation.use_count > self.inner.config.max_uses_before_recreate;
        if terminate || worn_out || wrapper.is_failed() || wrapper.is_terminated() {
            debug!(key = %key, wrapper = wrapper.id(), worn_out, "terminating released engine");
            wrapper.terminate();
            return;
        }

        let id = slots.next_id();
        let timer = self.spawn_idle_timer(id);
        debug!(key = %key, wrapper = wrapper.id(), "engine idle");
        slots.idle.push(IdleEntry {
            id,
            wrapper,
            purpose: key.purpose,
            uses: allocation.use_count,
            idle_since: Instant::now(),
            timer,
        });
    }

    fn spawn_idle_timer(&self, id: u64) -> AbortHandle {
        let pool = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let after = self.inner.config.idle_timeout();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(after) => {}
            }
            let Some(pool) = pool.upgrade() else {
                return;
            };
            let mut slots = pool.slots.lock();
            let position = slots.idle.iter().position(|entry| entry.id == id);
            if let Some(index) = position {
                let entry = slots.idle.remove(index);
                debug!(wrapper = entry.wrapper.id(), purpose = %entry.purpose, "idle engine expired");
                entry.wrapper.terminate();
            }
        })
        .abort_handle()
    }

    /// Release every allocation belonging to `game_id`.
    pub fn release_game(&self, game_id: &str) {
        let keys: Vec<PoolKey> = self
            .inner
            .slots
            .lock()
            .allocations
            .keys()
            .filter(|key| key.game_id == game_id)
            .cloned()
            .collect();
        for key in keys {
            self.release(&key.purpose, &key.game_id, false);
        }
    }

    /// Terminate all allocated and idle wrappers and clear the pool.
    pub fn terminate_all(&self) {
        let mut guard = self.inner.slots.lock();
        let slots = &mut *guard;
        let allocated = slots.allocations.len();
        let idle = slots.idle.len();

        for (_, allocation) in slots.allocations.drain() {
            allocation.wrapper.terminate();
        }
        for entry in slots.idle.drain(..) {
            entry.timer.abort();
            entry.wrapper.terminate();
        }
        info!(allocated, idle, "pool terminated");
    }

    // ── Introspection ────────────────────────────────────────

    pub fn has_allocation(&self, purpose: &str, game_id: &str) -> bool {
        self.inner
            .slots
            .lock()
            .allocations
            .contains_key(&PoolKey::new(purpose, game_id))
    }

    pub fn allocation_info(&self, purpose: &str, game_id: &str) -> Option<AllocationInfo> {
        let key = PoolKey::new(purpose, game_id);
        let slots = self.inner.slots.lock();
        let allocation = slots.allocations.get(&key)?;
        Some(AllocationInfo {
            wrapper_id: allocation.wrapper.id(),
            use_count: allocation.use_count,
            age_ms: u64::try_from(allocation.allocated_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            state: allocation.wrapper.state(),
            purpose: key.purpose,
            game_id: key.game_id,
        })
    }

    pub fn allocated_count(&self) -> usize {
        self.inner.slots.lock().allocations.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.slots.lock().idle.len()
    }

    /// Allocated plus idle wrappers.
    pub fn total_count(&self) -> usize {
        let slots = self.inner.slots.lock();
        slots.allocations.len() + slots.idle.len()
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.inner.slots.lock();
        PoolStats {
            allocated: slots.allocations.len(),
            idle: slots.idle.len(),
            total: slots.allocations.len() + slots.idle.len(),
            total_created: slots.total_created,
        }
    }
}
