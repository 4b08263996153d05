//! Scheduler module.
//!
//! This module contains the scheduler running the synchronization of
//! several accounts at the same time, and the context they share.

use log::{debug, error, info};
use std::{sync::Arc, thread};

use super::{Account, Error, Result, SyncSignals};
use crate::{
    backend::StoreBuilder, AccountConfig, HasSeverity, Limiters, Severity, SyncMutexes,
    SyncReport,
};

pub const DEFAULT_MAX_SYNC_ACCOUNTS: usize = 1;

/// Represents the state shared by every account of a process.
#[derive(Debug, Default)]
pub struct SyncContext {
    pub limiters: Limiters,
    pub mutexes: SyncMutexes,
    pub signals: SyncSignals,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Represents the outcome of the synchronization of one account.
#[derive(Debug)]
pub struct AccountOutcome {
    pub account: String,
    pub result: Result<SyncReport>,
}

/// Runs the synchronization of several accounts, each one in its own
/// thread.
#[derive(Debug)]
pub struct Scheduler {
    context: Arc<SyncContext>,
    builder: StoreBuilder,
    max_sync_accounts: usize,
}

impl Scheduler {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self {
            context,
            builder: StoreBuilder::default(),
            max_sync_accounts: DEFAULT_MAX_SYNC_ACCOUNTS,
        }
    }

    pub fn store_builder(mut self, builder: StoreBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn max_sync_accounts(mut self, max: usize) -> Self {
        self.max_sync_accounts = max.max(1);
        self
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.context
    }

    /// Synchronizes the given accounts and waits for all of them.
    ///
    /// The failure of one account does not affect the others, unless
    /// it is fatal: then every account is asked to stop.
    pub fn run(&self, accounts: Vec<AccountConfig>) -> Vec<AccountOutcome> {
        let accounts_limiter = self.context.limiters.accounts(self.max_sync_accounts);
        info!(
            "synchronizing {} account(s), {} at a time",
            accounts.len(),
            accounts_limiter.permits()
        );

        let limiter = &*accounts_limiter;
        thread::scope(|scope| {
            let workers: Vec<_> = accounts
                .into_iter()
                .map(|config| {
                    let name = config.name.clone();
                    let worker = scope.spawn(move || {
                        let _permit = limiter.acquire();
                        self.run_account(config)
                    });
                    (name, worker)
                })
                .collect();

            workers
                .into_iter()
                .map(|(account, worker)| {
                    let result = worker
                        .join()
                        .unwrap_or_else(|_| Err(Error::AbortedError(account.clone())));
                    AccountOutcome { account, result }
                })
                .collect()
        })
    }

    fn run_account(&self, config: AccountConfig) -> Result<SyncReport> {
        let name = config.name.clone();
        if self.context.signals.is_aborted() {
            debug!("account {} not started, synchronization aborted", name);
            return Err(Error::AbortedError(name));
        }

        let res = Account::new(config, &self.builder, self.context.clone())
            .and_then(|account| account.run());

        if let Err(err) = &res {
            if err.severity() == Severity::Fatal {
                error!("fatal error in account {}, stopping everything: {}", name, err);
                self.context.signals.abort();
            } else {
                error!("synchronization of account {} failed: {}", name, err);
            }
        }

        res
    }
}
