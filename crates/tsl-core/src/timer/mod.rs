//! Keyed one-shot timeouts with ticket validation.
//!
//! Timer expiry is delivered from a background task while the key's owner keeps mutating its
//! own state elsewhere, so a delivered timeout may already be stale when it is looked at.
//! Every registration gets a fresh [`Ticket`]; the owner asks [`TimerService::is_valid`]
//! before acting on an expiry.
use std::{collections::HashMap, fmt, hash::Hash, sync::Arc, time::Duration};

use tokio::{runtime::Handle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::TimerError;

/// One-time token identifying a single timeout registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(Uuid);

impl Ticket {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives expired timeouts. Called from timer tasks, never from the owner context.
pub trait TimeoutListener<K>: Send + Sync + 'static {
    fn notify_timeout(&self, key: K, ticket: Ticket);
}

struct Pending {
    ticket: Ticket,
    deadline: Instant,
    cancel: CancellationToken,
}

struct Running<K> {
    listener: Arc<dyn TimeoutListener<K>>,
    executor: Handle,
}

/// Timeout registry keyed by `K`.
///
/// Explicitly constructed and started; several independent instances may coexist.
/// An expired entry stays registered (its ticket keeps validating) until it is unregistered
/// or replaced, so the owner can still confirm the expiry it is about to act on.
pub struct TimerService<K> {
    timeouts: HashMap<K, Pending>,
    running: Option<Running<K>>,
    shutdown: CancellationToken,
}

impl<K> TimerService<K>
where
    K: Clone + Eq + Hash + fmt::Display + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            timeouts: HashMap::new(),
            running: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Binds the listener and the runtime timers are spawned on.
    pub fn start(
        &mut self,
        listener: Arc<dyn TimeoutListener<K>>,
        executor: Handle,
    ) -> Result<(), TimerError> {
        if self.shutdown.is_cancelled() {
            return Err(TimerError::Stopped);
        }
        if self.running.is_some() {
            return Err(TimerError::AlreadyStarted);
        }
        self.running = Some(Running { listener, executor });
        Ok(())
    }

    /// Cancels every pending timeout; the service cannot be restarted.
    pub fn stop(&mut self) {
        self.shutdown.cancel();
        self.timeouts.clear();
    }

    /// Token cancelled when the service stops.
    ///
    /// Cancelling it from another task stops every pending timer as well, for owners that
    /// finish shutting down off the owner context.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.is_some() && !self.shutdown.is_cancelled()
    }

    /// Registers a timeout for `key`, replacing (and invalidating) any previous one.
    pub fn register_timeout(&mut self, key: K, delay: Duration) -> Result<Ticket, TimerError> {
        if self.shutdown.is_cancelled() {
            return Err(TimerError::Stopped);
        }
        let Some(running) = &self.running else {
            return Err(TimerError::NotStarted);
        };

        let ticket = Ticket::new();
        let deadline = Instant::now() + delay;
        let cancel = self.shutdown.child_token();

        let listener = Arc::clone(&running.listener);
        let token = cancel.clone();
        let expired = key.clone();
        running.executor.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    listener.notify_timeout(expired, ticket);
                }
            }
        });

        debug!(%key, ?delay, %ticket, "timeout registered");
        if let Some(previous) = self.timeouts.insert(
            key,
            Pending {
                ticket,
                deadline,
                cancel,
            },
        ) {
            previous.cancel.cancel();
        }
        Ok(ticket)
    }

    /// Cancels the pending timeout of `key`; no-op if there is none.
    pub fn unregister_timeout(&mut self, key: &K) {
        if let Some(pending) = self.timeouts.remove(key) {
            pending.cancel.cancel();
            trace!(%key, ticket = %pending.ticket, "timeout unregistered");
        }
    }

    /// `true` if `ticket` belongs to the current registration of `key`.
    pub fn is_valid(&self, key: &K, ticket: Ticket) -> bool {
        !self.shutdown.is_cancelled()
            && self
                .timeouts
                .get(key)
                .is_some_and(|pending| pending.ticket == ticket)
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.timeouts.get(key).map(|pending| pending.deadline)
    }

    pub fn len(&self) -> usize {
        self.timeouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }
}

impl<K> Default for TimerService<K>
where
    K: Clone + Eq + Hash + fmt::Display + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for TimerService<K> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
