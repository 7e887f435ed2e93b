//! Wait/wake facility for threads blocked on stale descriptors.
//!
//! The cache itself never detects deadlocks; it funnels every blocking wait
//! through a [`WaitQueue`] so the embedding engine can wire the wait into its
//! lock manager. [`LocalWaitQueue`] is the plain condition-variable
//! implementation used in tests and by engines without a deadlock detector.

use std::{fmt::Debug, sync::Arc, time::Duration, time::Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of a blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited event happened.
    Granted,
    /// The timeout expired first.
    Timeout,
    /// The deadlock detector chose this waiter as a victim.
    Deadlock,
    /// The waiting thread was killed while blocked.
    Killed,
}

/// Weight of a wait for deadlock detection. Heavier waits make better victims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DeadlockPriority(pub u32);

/// One registration of a blocked thread.
///
/// A ticket fires exactly once: the first outcome wins and later calls to
/// [`fire`](Self::fire) are no-ops. The thread that destroys a stale descriptor
/// fires every ticket parked on it with [`WaitOutcome::Granted`].
#[derive(Debug, Default)]
pub struct WaitTicket {
    state: Mutex<Option<WaitOutcome>>,
    wakeup: Condvar,
}

impl WaitTicket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fire the ticket with `outcome`, unblocking its waiter.
    pub fn fire(&self, outcome: WaitOutcome) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(outcome);
            self.wakeup.notify_all();
        }
    }

    /// The outcome, if the ticket has already fired.
    pub fn outcome(&self) -> Option<WaitOutcome> {
        *self.state.lock()
    }

    pub(crate) fn block(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = *state {
                return outcome;
            }
            if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                return match *state {
                    Some(outcome) => outcome,
                    None => WaitOutcome::Timeout,
                };
            }
        }
    }
}

/// Pluggable blocking facility.
pub trait WaitQueue: Debug + Send + Sync {
    /// Block the calling thread until `ticket` fires or `timeout` elapses.
    ///
    /// `priority` is the caller's weight for deadlock detection; implementations
    /// without a detector ignore it. A killed thread is unblocked with
    /// [`WaitOutcome::Killed`] rather than left hanging.
    fn wait(
        &self,
        ticket: &Arc<WaitTicket>,
        timeout: Duration,
        priority: DeadlockPriority,
    ) -> WaitOutcome;

    /// Fire `ticket` with [`WaitOutcome::Granted`].
    fn wake(&self, ticket: &Arc<WaitTicket>) {
        ticket.fire(WaitOutcome::Granted);
    }
}

/// Condition-variable [`WaitQueue`] with no deadlock detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWaitQueue;

impl WaitQueue for LocalWaitQueue {
    fn wait(
        &self,
        ticket: &Arc<WaitTicket>,
        timeout: Duration,
        _priority: DeadlockPriority,
    ) -> WaitOutcome {
        ticket.block(timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn fired_ticket_returns_immediately() {
        let ticket = WaitTicket::new();
        ticket.fire(WaitOutcome::Granted);
        assert_eq!(
            LocalWaitQueue.wait(&ticket, Duration::from_secs(10), DeadlockPriority::default()),
            WaitOutcome::Granted
        );
    }

    #[test]
    fn first_outcome_wins() {
        let ticket = WaitTicket::new();
        ticket.fire(WaitOutcome::Killed);
        ticket.fire(WaitOutcome::Granted);
        assert_eq!(ticket.outcome(), Some(WaitOutcome::Killed));
    }

    #[test]
    fn wait_times_out() {
        let ticket = WaitTicket::new();
        assert_eq!(
            LocalWaitQueue.wait(&ticket, Duration::from_millis(10), DeadlockPriority::default()),
            WaitOutcome::Timeout
        );
    }

    #[test]
    fn cross_thread_wake() {
        let ticket = WaitTicket::new();
        let waker = Arc::clone(&ticket);
        let handle = thread::spawn(move || {
            waker.fire(WaitOutcome::Granted);
        });
        assert_eq!(
            LocalWaitQueue.wait(&ticket, Duration::from_secs(10), DeadlockPriority::default()),
            WaitOutcome::Granted
        );
        handle.join().unwrap();
    }
}
