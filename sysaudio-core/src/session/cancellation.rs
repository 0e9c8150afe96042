use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::models::state::StopReason;

#[derive(Default)]
struct TokenInner {
    reason: Mutex<Option<StopReason>>,
    cond: Condvar,
}

/// One-shot stop trigger shared between the session, signal handlers and
/// any other thread that may end a recording.
///
/// The first `cancel` wins; later triggers are ignored and report `false`,
/// so duplicate signals converge on a single teardown.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the token. Returns `true` only for the first trigger.
    pub fn cancel(&self, reason: StopReason) -> bool {
        let mut current = self.inner.reason.lock();
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        self.inner.cond.notify_all();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.inner.reason.lock()
    }

    /// Block until the token is triggered or `deadline` passes.
    ///
    /// Reaching the deadline triggers the token with `DurationElapsed`.
    /// With no deadline this waits for a trigger indefinitely.
    pub fn wait_until(&self, deadline: Option<Instant>) -> StopReason {
        let mut current = self.inner.reason.lock();
        loop {
            if let Some(reason) = *current {
                return reason;
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut current, deadline).timed_out() && current.is_none() {
                        *current = Some(StopReason::DurationElapsed);
                        self.inner.cond.notify_all();
                    }
                }
                None => self.inner.cond.wait(&mut current),
            }
        }
    }

    /// Block for at most `timeout`. Returns the reason if triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<StopReason> {
        let deadline = Instant::now() + timeout;
        let mut current = self.inner.reason.lock();
        while current.is_none() {
            if self.inner.cond.wait_until(&mut current, deadline).timed_out() {
                break;
            }
        }
        *current
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}
