use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct State {
    /// Threads currently running interpreted code.
    managed: usize,
    requested: bool,
}

/// Stop-the-world coordination between mutators and the collector.
///
/// A thread is *managed* while it runs bytecode and may touch heap objects.
/// Managed threads poll [`Safepoint::is_requested`] at every instruction
/// boundary and park when a stop is pending. Blocking native waits leave
/// the managed state so they never hold up a collection.
#[derive(Debug, Default)]
pub struct Safepoint {
    state: Mutex<State>,
    changed: Condvar,
    requested: AtomicBool,
}

/// Held by the collecting thread; resumes the world when dropped.
#[must_use]
#[derive(Debug)]
pub struct WorldStopped<'a> {
    safepoint: &'a Safepoint,
}

impl Safepoint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Becomes managed, waiting out any stop in progress.
    pub fn enter(&self) {
        let mut state = self.state.lock();
        while state.requested {
            self.changed.wait(&mut state);
        }
        state.managed += 1;
    }

    pub fn leave(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.managed > 0, "leaving an unmanaged thread");
        state.managed = state.managed.saturating_sub(1);
        if state.requested {
            drop(state);
            self.changed.notify_all();
        }
    }

    /// Parks a managed thread until the pending stop is over.
    pub fn park(&self) {
        let mut state = self.state.lock();
        if !state.requested {
            return;
        }
        state.managed = state.managed.saturating_sub(1);
        self.changed.notify_all();
        while state.requested {
            self.changed.wait(&mut state);
        }
        state.managed += 1;
    }

    /// Stops every other managed thread.
    ///
    /// Returns `None` when another thread is already stopping the world;
    /// the caller then waits (parked, if managed) until that stop is over.
    pub fn stop_the_world(
        &self,
        caller_managed: bool,
    ) -> Option<WorldStopped<'_>> {
        let mut state = self.state.lock();
        if state.requested {
            if caller_managed {
                state.managed = state.managed.saturating_sub(1);
                self.changed.notify_all();
            }
            while state.requested {
                self.changed.wait(&mut state);
            }
            if caller_managed {
                state.managed += 1;
            }
            return None;
        }

        state.requested = true;
        self.requested.store(true, Ordering::Release);
        let own = usize::from(caller_managed);
        while state.managed > own {
            self.changed.wait(&mut state);
        }
        Some(WorldStopped { safepoint: self })
    }

    pub fn managed_threads(&self) -> usize {
        self.state.lock().managed
    }
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        let mut state = self.safepoint.state.lock();
        state.requested = false;
        self.safepoint.requested.store(false, Ordering::Release);
        drop(state);
        self.safepoint.changed.notify_all();
    }
}
