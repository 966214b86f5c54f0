use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Shutdown broadcast plus a wait group for background workers.
///
/// Workers call [`add_running`](Closer::add_running) before they start,
/// poll [`wait_timeout`](Closer::wait_timeout) between ticks and call
/// [`done`](Closer::done) on exit. [`signal_and_wait`](Closer::signal_and_wait)
/// fires the broadcast once and blocks until every worker has checked out.
#[derive(Debug, Default)]
pub(crate) struct Closer {
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct State {
    closed: bool,
    running: usize,
}

impl Closer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_running(&self, n: usize) {
        self.state.lock().running += n;
    }

    pub(crate) fn done(&self) {
        let mut state = self.state.lock();
        state.running = state.running.saturating_sub(1);
        if state.running == 0 {
            self.cond.notify_all();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Sleeps up to `timeout`; returns `true` once shutdown was signalled.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.closed {
            self.cond.wait_for(&mut state, timeout);
        }
        state.closed
    }

    /// Signals shutdown and waits for all workers. Later calls return at once.
    pub(crate) fn signal_and_wait(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
        while state.running > 0 {
            self.cond.wait(&mut state);
        }
    }
}
