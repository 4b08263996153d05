//! Signals module.
//!
//! This module contains the process-wide operational signals, set by
//! the front end (usually from OS signal handlers) and polled by the
//! accounts and the synchronization passes.

use log::{error, info, warn};
use std::{
    process,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Represents the number of abort requests after which the process
/// exits without waiting for in-flight work.
pub const ABORTS_BEFORE_EXIT: usize = 3;

#[derive(Debug, Default)]
pub struct SyncSignals {
    skip_sleep: AtomicBool,
    stop_after_cycle: AtomicBool,
    abort_now: AtomicBool,
    aborts: AtomicUsize,
}

impl SyncSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the sleeping accounts to synchronize right away.
    pub fn skip_sleep(&self) {
        info!("synchronization requested");
        self.skip_sleep.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending skip sleep request.
    pub fn take_skip_sleep(&self) -> bool {
        self.skip_sleep.swap(false, Ordering::SeqCst)
    }

    pub fn is_sleep_skipped(&self) -> bool {
        self.skip_sleep.load(Ordering::SeqCst)
    }

    /// Asks the accounts to stop after their current cycle.
    pub fn stop_after_cycle(&self) {
        info!("stop requested after the current synchronization");
        self.stop_after_cycle.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_after_cycle.load(Ordering::SeqCst) || self.is_aborted()
    }

    /// Asks everything to stop as soon as possible. In-flight
    /// protocol calls complete. Repeated requests end the process.
    pub fn abort_now(&self) {
        let aborts = self.aborts.fetch_add(1, Ordering::SeqCst) + 1;
        self.abort_now.store(true, Ordering::SeqCst);
        if aborts >= ABORTS_BEFORE_EXIT {
            error!("abort requested {} times, exiting now", aborts);
            process::exit(1);
        }
        warn!("abort requested, stopping as soon as possible");
    }

    /// Asks everything to stop after a fatal failure. Unlike
    /// [`SyncSignals::abort_now`], never ends the process.
    pub fn abort(&self) {
        self.abort_now.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_now.load(Ordering::SeqCst)
    }

    /// Returns `true` if the sleep between two cycles must end.
    pub fn interrupts_sleep(&self) -> bool {
        self.is_sleep_skipped() || self.is_stop_requested()
    }
}
