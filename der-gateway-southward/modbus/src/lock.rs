use der_gateway_sdk::{DriverError, DriverResult};
use std::{
    fmt,
    marker::PhantomData,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    holds: usize,
}

/// Reentrant, bounded-wait lock serializing access to one physical transport.
///
/// The owning thread may acquire again without blocking; every acquisition hands out a
/// [`ConnectionLockGuard`] and the lock is free once all guards of the owner are gone.
/// Waiters are woken in no particular order.
pub struct ConnectionLock {
    description: String,
    state: Mutex<LockState>,
    available: Condvar,
}

impl ConnectionLock {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            state: Mutex::new(LockState::default()),
            available: Condvar::new(),
        }
    }

    /// Transport description used in timeout errors.
    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the lock is free or `timeout` elapses.
    ///
    /// Succeeds immediately when the calling thread already holds the lock.
    pub fn acquire(&self, timeout: Duration) -> DriverResult<ConnectionLockGuard<'_>> {
        let me = thread::current().id();
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.holds = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    state.holds += 1;
                    break;
                }
                Some(_) => {
                    let remaining = match deadline {
                        Some(d) => d.saturating_duration_since(Instant::now()),
                        None => Duration::MAX,
                    };
                    if remaining.is_zero() {
                        tracing::debug!(transport = %self.description, timeout_ms = timeout.as_millis() as u64, "Transport lock wait timed out");
                        return Err(DriverError::LockTimeout(self.description.clone()));
                    }
                    state = self
                        .available
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        let depth = state.holds;
        drop(state);
        tracing::trace!(transport = %self.description, depth, "Transport lock acquired");
        Ok(ConnectionLockGuard {
            lock: self,
            depth,
            released: false,
            _not_send: PhantomData,
        })
    }

    // only reachable through a guard, which releases at most once
    fn release_hold(&self) {
        let me = thread::current().id();
        let mut state = self.state();
        if state.owner != Some(me) || state.holds == 0 {
            return;
        }
        state.holds -= 1;
        if state.holds == 0 {
            state.owner = None;
            drop(state);
            self.available.notify_all();
            tracing::trace!(transport = %self.description, "Transport lock released");
        }
    }

    /// Whether the calling thread currently holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state().owner == Some(thread::current().id())
    }

    pub fn is_locked(&self) -> bool {
        self.state().owner.is_some()
    }
}

impl fmt::Debug for ConnectionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("ConnectionLock")
            .field("description", &self.description)
            .field("locked", &state.owner.is_some())
            .field("holds", &state.holds)
            .finish()
    }
}

/// Scoped hold on a [`ConnectionLock`]; dropping it releases the hold.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ConnectionLockGuard<'a> {
    lock: &'a ConnectionLock,
    depth: usize,
    released: bool,
    // holds are per thread
    _not_send: PhantomData<*const ()>,
}

impl ConnectionLockGuard<'_> {
    /// Whether this guard is the first, non-nested acquisition on its thread.
    #[inline]
    pub fn is_outermost(&self) -> bool {
        self.depth == 1
    }

    pub fn description(&self) -> &str {
        self.lock.description()
    }

    /// Release now. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.lock.release_hold();
        }
    }
}

impl Drop for ConnectionLockGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for ConnectionLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLockGuard")
            .field("transport", &self.lock.description)
            .field("depth", &self.depth)
            .finish()
    }
}
