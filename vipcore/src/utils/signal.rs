use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A binary signal with an optional timeout on wait.
///
/// An auto-reset signal wakes a single waiter and clears itself, which is what
/// the worker threads block on to learn that new work was queued. A
/// manual-reset signal stays set until `reset` is called; the task control
/// blocks use it to broadcast completion to any number of waiters.
#[derive(Debug)]
pub(crate) struct Signal {
    state: Mutex<bool>,
    cond: Condvar,
    manual_reset: bool,
}

impl Signal {
    pub(crate) fn auto_reset() -> Self {
        Self::new(false)
    }

    pub(crate) fn manual_reset() -> Self {
        Self::new(true)
    }

    fn new(manual_reset: bool) -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
            manual_reset,
        }
    }

    pub(crate) fn set(&self) {
        let mut state = self.state.lock();
        *state = true;

        if self.manual_reset {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    pub(crate) fn reset(&self) {
        *self.state.lock() = false;
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Blocks until the signal is set or `timeout` elapses. `None` waits
    /// forever. Returns whether the signal was observed.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        // Loop to absorb spurious wakeups.
        while !*state {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }

        let observed = *state;
        if observed && !self.manual_reset {
            *state = false;
        }

        observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::thread;

    assert_impl_all!(Signal: Send, Sync);

    #[test]
    fn test_auto_reset_consumes_signal() {
        let signal = Signal::auto_reset();
        signal.set();

        assert!(signal.wait(Some(Duration::from_millis(1))));
        assert!(!signal.is_set());
        assert!(!signal.wait(Some(Duration::from_millis(5))));
    }

    #[test]
    fn test_manual_reset_stays_set() {
        let signal = Signal::manual_reset();
        signal.set();

        assert!(signal.wait(None));
        assert!(signal.wait(Some(Duration::ZERO)));

        signal.reset();
        assert!(!signal.is_set());
    }

    #[test]
    fn test_wait_times_out() {
        let signal = Signal::auto_reset();

        let start = Instant::now();
        assert!(!signal.wait(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wakes_waiter_across_threads() {
        let signal = Arc::new(Signal::auto_reset());

        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait(Some(Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(10));
        signal.set();

        assert!(waiter.join().unwrap());
    }
}
