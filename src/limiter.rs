//! Limiter module.
//!
//! This module contains the counting semaphore used to bound
//! concurrency at every level (accounts, folders, message copies,
//! sessions), the registry of named semaphores, and the registry of
//! per-folder synchronization mutexes.

use log::trace;
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

fn recover<T>(err: PoisonError<T>) -> T {
    err.into_inner()
}

#[derive(Debug, Default)]
struct SemaphoreState {
    available: usize,
    in_use: usize,
    peak: usize,
}

/// Represents a counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    name: String,
    permits: usize,
    state: Mutex<SemaphoreState>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new<N: ToString>(name: N, permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            name: name.to_string(),
            permits,
            state: Mutex::new(SemaphoreState {
                available: permits,
                ..Default::default()
            }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the maximum number of permits.
    pub fn permits(&self) -> usize {
        self.permits
    }

    fn state(&self) -> MutexGuard<SemaphoreState> {
        self.state.lock().unwrap_or_else(recover)
    }

    /// Blocks until a permit is available, then takes it.
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        let mut state = self.state();
        while state.available == 0 {
            trace!("waiting for a permit of semaphore {}", self.name);
            state = self.cond.wait(state).unwrap_or_else(recover);
        }
        state.available -= 1;
        state.in_use += 1;
        state.peak = state.peak.max(state.in_use);
        SemaphorePermit { semaphore: self }
    }

    /// Takes a permit if one is available, without blocking.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut state = self.state();
        if state.available == 0 {
            return None;
        }
        state.available -= 1;
        state.in_use += 1;
        state.peak = state.peak.max(state.in_use);
        Some(SemaphorePermit { semaphore: self })
    }

    /// Blocks until every permit has been given back, then takes them
    /// all at once.
    pub fn acquire_all(&self) -> SemaphorePermits<'_> {
        let mut state = self.state();
        while state.available < self.permits {
            state = self.cond.wait(state).unwrap_or_else(recover);
        }
        state.available = 0;
        state.in_use = self.permits;
        state.peak = state.peak.max(state.in_use);
        SemaphorePermits { semaphore: self }
    }

    /// Blocks until at least one permit is available, without taking
    /// it. Returns `false` if the timeout elapsed first.
    pub fn wait_available(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state();
        match timeout {
            None => {
                while state.available == 0 {
                    state = self.cond.wait(state).unwrap_or_else(recover);
                }
                true
            }
            Some(timeout) => {
                let (state, res) = self
                    .cond
                    .wait_timeout_while(state, timeout, |state| state.available == 0)
                    .unwrap_or_else(recover);
                drop(state);
                !res.timed_out()
            }
        }
    }

    pub fn available(&self) -> usize {
        self.state().available
    }

    pub fn in_use(&self) -> usize {
        self.state().in_use
    }

    /// Returns the highest number of permits simultaneously taken
    /// since the creation of the semaphore.
    pub fn peak(&self) -> usize {
        self.state().peak
    }

    fn release(&self, n: usize) {
        let mut state = self.state();
        state.available += n;
        state.in_use -= n;
        drop(state);
        self.cond.notify_all();
    }
}

/// Represents one permit taken from a [`Semaphore`]. The permit is
/// given back when dropped.
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release(1)
    }
}

/// Represents all the permits of a [`Semaphore`].
#[derive(Debug)]
pub struct SemaphorePermits<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermits<'_> {
    fn drop(&mut self) {
        self.semaphore.release(self.semaphore.permits)
    }
}

/// Represents the registry of named semaphores.
///
/// Semaphores are lazily created the first time their name is
/// requested, with the given number of permits. Later requests for
/// the same name return the same semaphore, whatever the requested
/// number of permits.
#[derive(Debug, Default)]
pub struct Limiters {
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Limiters {
    pub const ACCOUNTS: &'static str = "accounts";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<N: AsRef<str>>(&self, name: N, permits: usize) -> Arc<Semaphore> {
        let name = name.as_ref();
        self.semaphores
            .lock()
            .unwrap_or_else(recover)
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(name, permits)))
            .clone()
    }

    /// Returns the semaphore bounding concurrent account syncs.
    pub fn accounts(&self, permits: usize) -> Arc<Semaphore> {
        self.get(Self::ACCOUNTS, permits)
    }

    /// Returns the semaphore bounding concurrent folder syncs of the
    /// given remote store.
    pub fn folders<S: AsRef<str>>(&self, store: S, permits: usize) -> Arc<Semaphore> {
        self.get(format!("folders:{}", store.as_ref()), permits)
    }

    /// Returns the semaphore bounding concurrent message copies of
    /// the given remote store.
    pub fn copies<S: AsRef<str>>(&self, store: S, permits: usize) -> Arc<Semaphore> {
        self.get(format!("copies:{}", store.as_ref()), permits)
    }
}

/// Represents the registry of per-folder synchronization mutexes.
///
/// Guarantees at most one concurrent synchronization per (account,
/// local folder) pair. Entries are never removed.
#[derive(Debug, Default)]
pub struct SyncMutexes {
    mutexes: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl SyncMutexes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<A, F>(&self, account: A, folder: F) -> Arc<Mutex<()>>
    where
        A: ToString,
        F: ToString,
    {
        self.mutexes
            .lock()
            .unwrap_or_else(recover)
            .entry((account.to_string(), folder.to_string()))
            .or_default()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.mutexes.lock().unwrap_or_else(recover).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
