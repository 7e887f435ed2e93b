//! Rendezvous barrier tracking in-flight instance closes.

use parking_lot::{Condvar, Mutex};

/// Counts external close calls that are still running after the cache's data
/// locks were dropped.
///
/// A thread about to call into the storage engine's close path takes
/// [`enter`](Self::enter) and holds the guard across the (possibly blocking)
/// close. A thread that must guarantee no close is still in flight, such as a
/// DDL removal reporting completion, calls [`wait_idle`](Self::wait_idle) with
/// no cache locks held. This is pure synchronization; the barrier protects no
/// data.
#[derive(Debug, Default)]
pub(crate) struct FlushBarrier {
    in_flight: Mutex<usize>,
    drained: Condvar,
}

impl FlushBarrier {
    /// Record one in-flight close. The returned guard must be held until the
    /// close has finished.
    pub(crate) fn enter(&self) -> FlushGuard<'_> {
        *self.in_flight.lock() += 1;
        FlushGuard { barrier: self }
    }

    /// Block until every in-flight close has finished.
    pub(crate) fn wait_idle(&self) {
        let mut in_flight = self.in_flight.lock();
        while *in_flight > 0 {
            self.drained.wait(&mut in_flight);
        }
    }
}

#[derive(Debug)]
pub(crate) struct FlushGuard<'a> {
    barrier: &'a FlushBarrier,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.barrier.in_flight.lock();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.barrier.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, sync::mpsc, thread, time::Duration};

    use super::*;

    #[test]
    fn idle_barrier_does_not_block() {
        let barrier = FlushBarrier::default();
        barrier.wait_idle();
    }

    #[test]
    fn wait_idle_blocks_until_guards_drop() {
        let barrier = Arc::new(FlushBarrier::default());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let closing = Arc::clone(&barrier);
        let closer = thread::spawn(move || {
            let _guard = closing.enter();
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });

        entered_rx.recv().unwrap();

        let (idle_tx, idle_rx) = mpsc::channel();
        let waiting = Arc::clone(&barrier);
        let waiter = thread::spawn(move || {
            waiting.wait_idle();
            idle_tx.send(()).unwrap();
        });

        assert!(idle_rx.recv_timeout(Duration::from_millis(100)).is_err());
        release_tx.send(()).unwrap();
        idle_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        closer.join().unwrap();
        waiter.join().unwrap();
    }
}
