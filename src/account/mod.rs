//! Account module.
//!
//! This module contains the orchestration of the synchronization of
//! one account: locking, folder structure synchronization, dispatch
//! of the folder pairs, retries and the autorefresh loop.

pub mod folders;
pub use folders::{sync_structure, FolderPair, NameMapper};

pub mod scheduler;
pub use scheduler::{Scheduler, SyncContext};

pub mod signals;
pub use signals::*;

use advisory_lock::{AdvisoryFileLock, FileLockError, FileLockMode};
use log::{debug, error, info, trace, warn};
use std::{
    fmt,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    result,
    sync::{atomic::AtomicBool, atomic::Ordering, Arc, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::{
    backend::{self, Store, StoreBuilder, StoreSide},
    config, folder, status,
    sync::{self, FolderReport, FolderSync, SyncOptions},
    AccountConfig, HasSeverity, Semaphore, Severity, StatusFolder, SyncReport,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open lock file {1}")]
    OpenLockFileError(#[source] io::Error, PathBuf),
    #[error("account {0} is already being synchronized (lock file {1} held)")]
    LockHeldError(String, PathBuf),
    #[error("cannot lock file {1}")]
    LockFileError(#[source] FileLockError, PathBuf),
    #[error("cannot create folder {1} from folder {0}: its name would not translate back, leading to infinite folder creation")]
    InfiniteFolderCreationError(String, String),
    #[error("synchronization of folder {0} panicked")]
    FolderWorkerError(String),
    #[error("synchronization of account {0} aborted")]
    AbortedError(String),

    #[error(transparent)]
    ConfigError(#[from] config::account::Error),
    #[error(transparent)]
    StoreError(#[from] backend::Error),
    #[error(transparent)]
    FolderError(#[from] folder::Error),
    #[error(transparent)]
    SyncError(#[from] sync::Error),
}

impl HasSeverity for Error {
    fn severity(&self) -> Severity {
        match self {
            Self::OpenLockFileError(..) => Severity::Store,
            Self::LockHeldError(..) => Severity::Store,
            Self::LockFileError(..) => Severity::Store,
            Self::InfiniteFolderCreationError(..) => Severity::Store,
            Self::FolderWorkerError(_) => Severity::Folder,
            Self::AbortedError(_) => Severity::Store,
            Self::ConfigError(err) => err.severity(),
            Self::StoreError(err) => err.severity(),
            Self::FolderError(err) => err.severity(),
            Self::SyncError(err) => err.severity(),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the state of an account.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccountState {
    Idle,
    Locking,
    Syncing,
    Sleeping,
    Stopped,
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Locking => write!(f, "locking"),
            Self::Syncing => write!(f, "syncing"),
            Self::Sleeping => write!(f, "sleeping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Represents the exclusive lock of an account, released when
/// dropped.
#[derive(Debug)]
pub struct AccountLock {
    file: File,
    path: PathBuf,
}

impl AccountLock {
    /// Takes the lock file of the given account, without waiting
    /// when it is already held.
    pub fn acquire<P: AsRef<Path>>(sync_dir: P, account: &str) -> Result<Self> {
        let path = sync_dir.as_ref().join(format!("{}.lock", account));
        debug!("locking account {} with {:?}", account, path);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| Error::OpenLockFileError(err, path.clone()))?;
        AdvisoryFileLock::try_lock(&file, FileLockMode::Exclusive)
            .map_err(|err| match err {
                FileLockError::AlreadyLocked => Error::LockHeldError(account.to_owned(), path.clone()),
                err => Error::LockFileError(err, path.clone()),
            })?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AccountLock {
    fn drop(&mut self) {
        trace!("unlocking {:?}", self.path);
        if let Err(err) = AdvisoryFileLock::unlock(&self.file) {
            warn!("cannot unlock {:?}: {}", self.path, err);
        }
    }
}

/// Represents an account being synchronized.
pub struct Account {
    config: AccountConfig,
    remote: Box<dyn Store>,
    local: Box<dyn Store>,
    context: Arc<SyncContext>,
    state: Mutex<AccountState>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Account {
    /// Builds the stores of the given account.
    pub fn new(config: AccountConfig, builder: &StoreBuilder, context: Arc<SyncContext>) -> Result<Self> {
        config.validate()?;
        let remote = builder.build(&config, StoreSide::Remote)?;
        let local = builder.build(&config, StoreSide::Local)?;
        Ok(Self::from_stores(config, remote, local, context))
    }

    pub fn from_stores(
        config: AccountConfig,
        remote: Box<dyn Store>,
        local: Box<dyn Store>,
        context: Arc<SyncContext>,
    ) -> Self {
        Self {
            config,
            remote,
            local,
            context,
            state: Mutex::new(AccountState::Idle),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn state(&self) -> AccountState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: AccountState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        trace!("account {}: {} -> {}", self.config.name, *current, state);
        *current = state;
    }

    fn signals(&self) -> &SyncSignals {
        &self.context.signals
    }

    /// Synchronizes the account until no more cycle is expected:
    /// once without autorefresh, otherwise until a stop is
    /// requested. Returns the report of the last cycle.
    pub fn run(&self) -> Result<SyncReport> {
        let res = self.run_cycles();
        self.remote.close();
        self.local.close();
        self.set_state(AccountState::Stopped);
        res
    }

    fn run_cycles(&self) -> Result<SyncReport> {
        loop {
            if self.signals().is_aborted() {
                return Err(Error::AbortedError(self.config.name.clone()));
            }

            let report = self.sync_with_retry()?;
            info!(
                "account {} synchronized: to local: {}, to remote: {}",
                self.config.name,
                report.to_local(),
                report.to_remote()
            );

            if self.signals().is_stop_requested() {
                return Ok(report);
            }
            match self.config.autorefresh {
                Some(period) => self.sleep(period),
                None => return Ok(report),
            }
            if self.signals().is_stop_requested() {
                return Ok(report);
            }
        }
    }

    /// Runs one synchronization cycle, retried after store failures.
    pub fn sync_with_retry(&self) -> Result<SyncReport> {
        let retries = self.config.retry_count();
        let mut attempt = 0;
        loop {
            match self.sync_once() {
                Ok(report) => {
                    let hold = self.config.hold_connections_open();
                    self.remote.hold_connections(hold);
                    self.local.hold_connections(hold);
                    return Ok(report);
                }
                Err(err) => {
                    if err.severity() >= Severity::Store {
                        self.remote.drop_connections();
                        self.local.drop_connections();
                    }
                    let retryable = err.is_owned_by(Severity::Store)
                        && !matches!(err, Error::LockHeldError(..))
                        && !self.signals().is_aborted()
                        && !self.signals().is_stop_requested();
                    if !retryable || attempt >= retries {
                        error!("cannot synchronize account {}: {}", self.config.name, err);
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        "cannot synchronize account {}, retrying ({}/{}) in {:?}: {}",
                        self.config.name, attempt, retries, delay, err
                    );
                    if !self.wait_before_retry(delay) {
                        info!("retry of account {} cancelled", self.config.name);
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Waits for the given delay in short ticks. Returns `false` when
    /// a stop or an abort is requested meanwhile.
    fn wait_before_retry(&self, delay: Duration) -> bool {
        let tick = self.config.sleep_tick();
        let signals = self.signals();
        let start = Instant::now();
        loop {
            if signals.is_stop_requested() || signals.is_aborted() {
                return false;
            }
            let elapsed = start.elapsed();
            if elapsed >= delay {
                return true;
            }
            thread::sleep(tick.min(delay - elapsed));
        }
    }

    /// Runs one synchronization cycle.
    pub fn sync_once(&self) -> Result<SyncReport> {
        self.set_state(AccountState::Locking);
        let sync_dir = self.config.sync_dir()?;
        let lock = AccountLock::acquire(&sync_dir, &self.config.name);
        let _lock = match lock {
            Ok(lock) => lock,
            Err(err) => {
                self.set_state(AccountState::Idle);
                return Err(err);
            }
        };

        self.set_state(AccountState::Syncing);
        info!("synchronizing account {}", self.config.name);
        if self.config.dry_run() {
            info!("dry run activated, no change will be applied");
        }

        let mut report = SyncReport::new(&self.config.name);
        let res = sync_structure(&self.config, &*self.remote, &*self.local, &mut report)
            .and_then(|pairs| self.sync_folders(&sync_dir, &pairs, &mut report));
        self.set_state(AccountState::Idle);
        res.map(|()| report)
    }

    fn sync_folders(&self, sync_dir: &Path, pairs: &[FolderPair], report: &mut SyncReport) -> Result<()> {
        let folders = self
            .context
            .limiters
            .folders(self.remote.name(), self.config.max_sync_folders());
        let copies = self
            .context
            .limiters
            .copies(self.remote.name(), self.config.max_copy_workers());
        let status_dir = status::status_dir(sync_dir, &self.config.name, &self.config.status_backend);
        debug!(
            "synchronizing {} folder(s) of account {}, {} at a time",
            pairs.len(),
            self.config.name,
            folders.permits()
        );

        let (status_dir, copies) = (&status_dir, &*copies);
        let results = thread::scope(|scope| {
            let mut units = vec![];
            for pair in pairs {
                if self.signals().is_aborted() {
                    break;
                }
                let permit = folders.acquire();
                let unit = scope.spawn(move || {
                    let _permit = permit;
                    self.sync_folder(pair, status_dir, copies)
                });
                units.push((pair, unit));
            }

            units
                .into_iter()
                .map(|(pair, unit)| {
                    let res = unit
                        .join()
                        .unwrap_or_else(|_| Err(Error::FolderWorkerError(pair.remote.clone())));
                    (pair, res)
                })
                .collect::<Vec<_>>()
        });

        let mut failure: Option<Error> = None;
        for (pair, res) in results {
            match res {
                Ok(folder_report) => report.folders.push(folder_report),
                Err(err) if err.is_owned_by(Severity::Folder) => {
                    warn!("cannot synchronize folder {}: {}", pair.remote, err);
                    let mut folder_report = FolderReport::new(&pair.remote);
                    folder_report.error = Some(err.to_string());
                    report.folders.push(folder_report);
                }
                // keeps the most severe failure
                Err(err) => match &failure {
                    Some(prev) if err.severity() <= prev.severity() => (),
                    _ => failure = Some(err),
                },
            }
        }

        if self.signals().is_aborted() {
            return Err(Error::AbortedError(self.config.name.clone()));
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn sync_folder(&self, pair: &FolderPair, status_dir: &Path, copies: &Semaphore) -> Result<FolderReport> {
        let mutex = self.context.mutexes.get(&self.config.name, &pair.local);
        let _guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);

        let remote = self.remote.open_folder(&pair.remote)?;
        let local = self.local.open_folder(&pair.local)?;
        let status = StatusFolder::open(status_dir, &pair.remote, &self.config.status_backend);

        let sync = FolderSync::new(&*remote, &*local, status, self.signals())
            .options(SyncOptions::from(&self.config))
            .copies(copies);
        let res = sync.sync();

        remote.drop_message_list();
        local.drop_message_list();
        res.map_err(Error::from)
    }

    /// Sleeps for the given period, or until a signal interrupts the
    /// sleep. Held connections are kept alive meanwhile.
    fn sleep(&self, period: Duration) {
        self.set_state(AccountState::Sleeping);
        info!("next synchronization of account {} in {:?}", self.config.name, period);

        let tick = self.config.sleep_tick();
        let keepalive = self.config.keepalive.unwrap_or_default();
        let signals = self.signals();
        let stop = AtomicBool::new(false);

        thread::scope(|scope| {
            if self.config.hold_connections_open() {
                for store in [&self.remote, &self.local] {
                    let stop = &stop;
                    scope.spawn(move || {
                        store.keepalive(&keepalive, tick, stop, &|| signals.skip_sleep())
                    });
                }
            }

            let start = Instant::now();
            while !signals.interrupts_sleep() {
                let elapsed = start.elapsed();
                if elapsed >= period {
                    break;
                }
                thread::sleep(tick.min(period - elapsed));
            }
            stop.store(true, Ordering::SeqCst);
        });

        if signals.take_skip_sleep() {
            debug!("sleep of account {} interrupted", self.config.name);
        }
        self.set_state(AccountState::Idle);
    }
}
