use std::marker::PhantomData;

/// Runs a closure when dropped.
///
/// Worker threads use it to hand claimed hardware cores back to the daemon on
/// every exit path, including a panic while the hardware was being driven.
pub(crate) struct ScopeGuard<'a, F: FnOnce()> {
    // Option so `drop` can take the closure by value.
    closure: Option<F>,

    _p: PhantomData<&'a ()>,
}

impl<'a, F: FnOnce()> ScopeGuard<'a, F> {
    /// Creates a guard running `closure` on drop.
    ///
    /// ```ignore
    /// let released = Cell::new(false);
    /// {
    ///     let _guard = ScopeGuard::new(|| released.set(true));
    ///     assert!(!released.get());
    /// }
    /// assert!(released.get());
    /// ```
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
            _p: PhantomData,
        }
    }
}

impl<'a, F: FnOnce()> Drop for ScopeGuard<'a, F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_runs_on_drop() {
        let count = Cell::new(0);
        {
            let _guard = ScopeGuard::new(|| count.set(count.get() + 1));
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_runs_on_panic() {
        let count = std::sync::atomic::AtomicUsize::new(0);

        let res = std::panic::catch_unwind(|| {
            let _guard = ScopeGuard::new(|| {
                count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            });
            panic!("boom");
        });

        assert!(res.is_err());
        assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
