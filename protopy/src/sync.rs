//! Blocking primitives behind the `_thread` handles.
//!
//! These never touch the safepoint themselves: the interpreter wraps every
//! potentially blocking call so the waiting thread counts as parked for
//! the collector.
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::{ExcType, ObjRef, ObjectData, RunError};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    #[error("release unlocked lock")]
    ReleaseUnlocked,
    #[error("cannot release un-acquired lock")]
    NotOwner,
    #[error("cannot wait on un-acquired lock")]
    WaitUnowned,
    #[error("cannot notify on un-acquired lock")]
    NotifyUnowned,
    #[error("Semaphore released too many times")]
    TooManyReleases,
}

impl From<SyncError> for RunError {
    fn from(err: SyncError) -> Self {
        let kind = match err {
            SyncError::TooManyReleases => ExcType::ValueError,
            _ => ExcType::RuntimeError,
        };
        RunError::new(kind, err.to_string())
    }
}

#[inline]
fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|timeout| Instant::now() + timeout)
}

/// Non-reentrant mutex. Any thread may release it.
#[derive(Debug, Default)]
pub struct Lock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl Lock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> bool {
        let mut locked = self.locked.lock();
        !std::mem::replace(&mut *locked, true)
    }

    /// Blocks until acquired or until `timeout` elapses.
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let deadline = deadline(timeout);
        let mut locked = self.locked.lock();
        while *locked {
            match deadline {
                Some(at) => {
                    if self.released.wait_until(&mut locked, at).timed_out()
                        && *locked
                    {
                        return false;
                    }
                }
                None => self.released.wait(&mut locked),
            }
        }
        *locked = true;
        true
    }

    pub fn release(&self) -> Result<(), SyncError> {
        let mut locked = self.locked.lock();
        if !*locked {
            return Err(SyncError::ReleaseUnlocked);
        }
        *locked = false;
        drop(locked);
        self.released.notify_one();
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }
}

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<u64>,
    count: usize,
}

/// Reentrant mutex owned by one thread ident at a time.
#[derive(Debug, Default)]
pub struct RLock {
    state: Mutex<Ownership>,
    released: Condvar,
}

impl RLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, ident: u64, timeout: Option<Duration>) -> bool {
        self.acquire_count(ident, 1, timeout)
    }

    pub fn try_acquire(&self, ident: u64) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner != ident => false,
            _ => {
                state.owner = Some(ident);
                state.count += 1;
                true
            }
        }
    }

    fn acquire_count(
        &self,
        ident: u64,
        count: usize,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = deadline(timeout);
        let mut state = self.state.lock();
        loop {
            match state.owner {
                Some(owner) if owner == ident => {
                    state.count += count;
                    return true;
                }
                None => {
                    state.owner = Some(ident);
                    state.count = count;
                    return true;
                }
                Some(_) => (),
            }
            match deadline {
                Some(at) => {
                    if self.released.wait_until(&mut state, at).timed_out()
                        && state.owner.is_some_and(|owner| owner != ident)
                    {
                        return false;
                    }
                }
                None => self.released.wait(&mut state),
            }
        }
    }

    pub fn release(&self, ident: u64) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        if state.owner != Some(ident) {
            return Err(SyncError::NotOwner);
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
        Ok(())
    }

    pub fn is_owned_by(&self, ident: u64) -> bool {
        self.state.lock().owner == Some(ident)
    }

    /// Recursion level held by the current owner.
    pub fn count(&self) -> usize {
        self.state.lock().count
    }
}

/// The lock a [`Condition`] waits with.
pub trait ConditionLock {
    /// Releases the lock completely, returning what `acquire_restore`
    /// needs to take it back.
    fn release_save(&self, ident: u64) -> Result<usize, SyncError>;
    fn acquire_restore(&self, ident: u64, saved: usize);
    fn is_owned(&self, ident: u64) -> bool;
}

impl ConditionLock for Lock {
    fn release_save(&self, _ident: u64) -> Result<usize, SyncError> {
        self.release()?;
        Ok(1)
    }

    fn acquire_restore(&self, _ident: u64, _saved: usize) {
        self.acquire(None);
    }

    // plain locks have no owner; held is the best available answer
    fn is_owned(&self, _ident: u64) -> bool {
        self.is_locked()
    }
}

impl ConditionLock for RLock {
    fn release_save(&self, ident: u64) -> Result<usize, SyncError> {
        let mut state = self.state.lock();
        if state.owner != Some(ident) {
            return Err(SyncError::NotOwner);
        }
        let saved = std::mem::take(&mut state.count);
        state.owner = None;
        drop(state);
        self.released.notify_one();
        Ok(saved)
    }

    fn acquire_restore(&self, ident: u64, saved: usize) {
        self.acquire_count(ident, saved, None);
    }

    fn is_owned(&self, ident: u64) -> bool {
        self.is_owned_by(ident)
    }
}

/// The lock of a `Condition` object, if `object` is a lock.
pub fn condition_lock(object: &ObjRef) -> Option<&dyn ConditionLock> {
    match &object.data {
        ObjectData::Lock(lock) => Some(lock),
        ObjectData::RLock(lock) => Some(lock),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Waiters {
    waiting: usize,
    wakeups: usize,
}

/// Condition variable over an external [`ConditionLock`].
#[derive(Debug, Default)]
pub struct Condition {
    waiters: Mutex<Waiters>,
    signal: Condvar,
}

impl Condition {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Releases `lock`, waits for a notification and reacquires `lock`
    /// with its previous recursion level. False on timeout.
    pub fn wait(
        &self,
        lock: &dyn ConditionLock,
        ident: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, SyncError> {
        if !lock.is_owned(ident) {
            return Err(SyncError::WaitUnowned);
        }
        let deadline = deadline(timeout);
        let mut waiters = self.waiters.lock();
        // registered before the lock is released, so no notify is missed
        waiters.waiting += 1;
        let saved = match lock.release_save(ident) {
            Ok(saved) => saved,
            Err(err) => {
                waiters.waiting -= 1;
                return Err(err);
            }
        };

        let notified = loop {
            if waiters.wakeups > 0 {
                waiters.wakeups -= 1;
                break true;
            }
            match deadline {
                Some(at) => {
                    if self.signal.wait_until(&mut waiters, at).timed_out()
                        && waiters.wakeups == 0
                    {
                        break false;
                    }
                }
                None => self.signal.wait(&mut waiters),
            }
        };
        waiters.waiting -= 1;
        drop(waiters);

        lock.acquire_restore(ident, saved);
        Ok(notified)
    }

    /// Wakes up to `count` waiters. Returns how many were woken.
    pub fn notify(
        &self,
        lock: &dyn ConditionLock,
        ident: u64,
        count: usize,
    ) -> Result<usize, SyncError> {
        if !lock.is_owned(ident) {
            return Err(SyncError::NotifyUnowned);
        }
        let mut waiters = self.waiters.lock();
        let idle = waiters.waiting.saturating_sub(waiters.wakeups);
        let woken = count.min(idle);
        waiters.wakeups += woken;
        drop(waiters);
        if woken > 0 {
            self.signal.notify_all();
        }
        Ok(woken)
    }

    pub fn notify_all(
        &self,
        lock: &dyn ConditionLock,
        ident: u64,
    ) -> Result<usize, SyncError> {
        self.notify(lock, ident, usize::MAX)
    }
}

/// Condition object: the shared lock plus the wait queue.
#[derive(Debug)]
pub struct ConditionObject {
    pub lock: ObjRef,
    pub condition: Condition,
}

#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    changed: Condvar,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.flag.lock() = true;
        self.changed.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Returns the flag once it is set or the timeout elapsed.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = deadline(timeout);
        let mut flag = self.flag.lock();
        while !*flag {
            match deadline {
                Some(at) => {
                    if self.changed.wait_until(&mut flag, at).timed_out() {
                        break;
                    }
                }
                None => self.changed.wait(&mut flag),
            }
        }
        *flag
    }
}

/// Counting semaphore; `bound` turns it into a bounded one.
#[derive(Debug)]
pub struct Semaphore {
    value: Mutex<usize>,
    available: Condvar,
    bound: Option<usize>,
}

impl Semaphore {
    #[must_use]
    pub fn new(value: usize) -> Self {
        Self {
            value: Mutex::new(value),
            available: Condvar::new(),
            bound: None,
        }
    }

    #[must_use]
    pub fn bounded(value: usize) -> Self {
        Self {
            bound: Some(value),
            ..Self::new(value)
        }
    }

    #[inline]
    pub fn is_bounded(&self) -> bool {
        self.bound.is_some()
    }

    pub fn value(&self) -> usize {
        *self.value.lock()
    }

    pub fn try_acquire(&self) -> bool {
        let mut value = self.value.lock();
        if *value == 0 {
            return false;
        }
        *value -= 1;
        true
    }

    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let deadline = deadline(timeout);
        let mut value = self.value.lock();
        while *value == 0 {
            match deadline {
                Some(at) => {
                    if self.available.wait_until(&mut value, at).timed_out()
                        && *value == 0
                    {
                        return false;
                    }
                }
                None => self.available.wait(&mut value),
            }
        }
        *value -= 1;
        true
    }

    pub fn release(&self, count: usize) -> Result<(), SyncError> {
        let mut value = self.value.lock();
        let next = value.saturating_add(count);
        if self.bound.is_some_and(|bound| next > bound) {
            return Err(SyncError::TooManyReleases);
        }
        *value = next;
        drop(value);
        for _ in 0..count {
            self.available.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn lock_acquire_times_out() {
        let lock = Lock::new();
        assert!(lock.acquire(None));
        let start = Instant::now();
        assert!(!lock.acquire(Some(SHORT)));
        assert!(start.elapsed() >= SHORT);
        lock.release().unwrap();
        assert_eq!(lock.release(), Err(SyncError::ReleaseUnlocked));
    }

    #[test]
    fn lock_guards_a_counter() {
        let lock = Arc::new(Lock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..10)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        lock.acquire(None);
                        let seen = counter.load(Ordering::Relaxed);
                        counter.store(seen + 1, Ordering::Relaxed);
                        lock.release().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn rlock_counts_and_checks_the_owner() {
        let lock = RLock::new();
        assert!(lock.acquire(1, None));
        assert!(lock.acquire(1, None));
        assert_eq!(lock.count(), 2);
        assert!(!lock.acquire(2, Some(SHORT)));
        assert_eq!(lock.release(2), Err(SyncError::NotOwner));
        lock.release(1).unwrap();
        lock.release(1).unwrap();
        assert!(lock.acquire(2, Some(SHORT)));
    }

    #[test]
    fn condition_wait_restores_the_recursion_level() {
        let lock = Arc::new(RLock::new());
        let condition = Arc::new(Condition::new());

        lock.acquire(1, None);
        lock.acquire(1, None);
        let notifier = {
            let lock = lock.clone();
            let condition = condition.clone();
            thread::spawn(move || {
                lock.acquire(2, None);
                while condition.notify(&*lock, 2, 1).unwrap() == 0 {
                    lock.release(2).unwrap();
                    thread::sleep(Duration::from_millis(1));
                    lock.acquire(2, None);
                }
                lock.release(2).unwrap();
            })
        };
        assert!(condition.wait(&*lock, 1, None).unwrap());
        notifier.join().unwrap();
        assert!(lock.is_owned_by(1));
        assert_eq!(lock.count(), 2);
    }

    #[test]
    fn condition_requires_the_lock() {
        let lock = Lock::new();
        let condition = Condition::new();
        assert_eq!(
            condition.wait(&lock, 1, Some(SHORT)),
            Err(SyncError::WaitUnowned)
        );
        lock.acquire(None);
        assert_eq!(condition.wait(&lock, 1, Some(SHORT)), Ok(false));
        assert!(lock.is_locked());
    }

    #[test]
    fn event_wait() {
        let event = Arc::new(Event::new());
        assert!(!event.wait(Some(SHORT)));
        let setter = {
            let event = event.clone();
            thread::spawn(move || event.set())
        };
        assert!(event.wait(None));
        setter.join().unwrap();
        event.clear();
        assert!(!event.is_set());
    }

    #[test]
    fn bounded_semaphore_rejects_extra_releases() {
        let sem = Semaphore::bounded(1);
        assert!(sem.is_bounded());
        assert!(sem.acquire(None));
        assert!(!sem.acquire(Some(SHORT)));
        sem.release(1).unwrap();
        assert_eq!(sem.release(1), Err(SyncError::TooManyReleases));

        let unbounded = Semaphore::new(0);
        unbounded.release(3).unwrap();
        assert_eq!(unbounded.value(), 3);
    }
}
