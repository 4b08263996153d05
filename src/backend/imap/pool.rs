//! IMAP session pool module.
//!
//! This module contains the bounded pool of IMAP sessions shared by
//! every worker synchronizing folders of the same remote store.
//! Sessions are opened lazily, reused in priority by the worker that
//! used them last, and closed when the engine reports them broken.

use log::{debug, info, trace, warn};
use std::{
    mem,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use super::{
    protocol::{self, Connector, IdleEvent, ImapProtocol, MailboxState},
    Error, Result,
};
use crate::{ImapConfig, KeepaliveConfig, Semaphore, SemaphorePermit};

/// Represents the identity of a worker, used to give it back the
/// session it used last.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new<T: ToString>(id: T) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct Session {
    id: usize,
    proto: Box<dyn ImapProtocol>,
    owner: Option<WorkerId>,
    /// Represents the selected mailbox, and whether it was selected
    /// read-only.
    selected: Option<(String, bool)>,
}

impl Session {
    fn logout(mut self) {
        trace!("logging out of session {}", self.id);
        if let Err(err) = self.proto.logout() {
            debug!("cannot log out of session {}: {}", self.id, err);
        }
    }
}

/// Represents the bounded pool of sessions of one IMAP store.
pub struct SessionPool {
    name: String,
    config: ImapConfig,
    connector: Arc<dyn Connector>,
    semaphore: Semaphore,
    idle: Mutex<Vec<Session>>,
    hold: AtomicBool,
    next_id: AtomicUsize,
    passwd: OnceLock<String>,
    delimiter: OnceLock<char>,
    root: OnceLock<String>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("name", &self.name)
            .field("host", &self.config.host)
            .field("max_connections", &self.semaphore.permits())
            .finish()
    }
}

impl SessionPool {
    pub fn new<N: ToString>(name: N, config: ImapConfig, connector: Arc<dyn Connector>) -> Self {
        let name = name.to_string();
        Self {
            semaphore: Semaphore::new(format!("sessions:{}", name), config.max_connections()),
            name,
            config,
            connector,
            idle: Mutex::default(),
            hold: AtomicBool::new(false),
            next_id: AtomicUsize::new(0),
            passwd: OnceLock::new(),
            delimiter: OnceLock::new(),
            root: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ImapConfig {
        &self.config
    }

    pub fn max_connections(&self) -> usize {
        self.semaphore.permits()
    }

    /// Returns the number of sessions currently in use.
    pub fn in_use(&self) -> usize {
        self.semaphore.in_use()
    }

    /// Returns the number of open sessions waiting to be reused.
    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    /// Returns the number of sessions opened since the creation of
    /// the pool.
    pub fn opened_count(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    fn idle(&self) -> MutexGuard<Vec<Session>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn passwd(&self) -> Result<String> {
        if let Some(passwd) = self.passwd.get() {
            return Ok(passwd.clone());
        }
        let passwd = self.config.passwd()?;
        let _ = self.passwd.set(passwd.clone());
        Ok(passwd)
    }

    /// Authenticates with the first configured mechanism the server
    /// supports and accepts.
    fn authenticate(&self, proto: &mut dyn ImapProtocol) -> Result<()> {
        let host = &self.config.host;
        let caps = proto
            .capabilities()
            .map_err(|err| Error::ProtocolError(err, "get capabilities".into()))?;
        let has_cap = |cap: &str| caps.iter().any(|c| c.eq_ignore_ascii_case(cap));
        let passwd = self.passwd()?;

        let mut failures = Vec::new();
        for mechanism in self.config.auth_mechanisms() {
            let supported = match mechanism.capability() {
                Some(cap) => has_cap(cap),
                None => !has_cap("LOGINDISABLED"),
            };
            if !supported {
                trace!("skipping unsupported auth mechanism {}", mechanism);
                continue;
            }

            debug!("authenticating to {} using {}", host, mechanism);
            match proto.authenticate(mechanism, &self.config.login, &passwd) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("cannot authenticate to {} using {}: {}", host, mechanism, err);
                    let session_broken = err.kind == protocol::ProtocolErrorKind::SessionFatal;
                    failures.push(format!("{}: {}", mechanism, err.message));
                    if session_broken {
                        break;
                    }
                }
            }
        }

        if failures.is_empty() {
            Err(Error::NoAuthMechanismError(host.clone()))
        } else {
            Err(Error::AuthenticateError(host.clone(), failures.join("; ")))
        }
    }

    /// Discovers the hierarchy delimiter and the namespace root of
    /// the server, once.
    fn discover(&self, proto: &mut dyn ImapProtocol) {
        if self.delimiter.get().is_some() {
            return;
        }

        let namespace = match proto.namespace() {
            Ok(namespace) => namespace,
            Err(err) => {
                debug!("cannot get namespace of {}: {}", self.config.host, err);
                None
            }
        };

        let delimiter = namespace
            .as_ref()
            .and_then(|ns| ns.delimiter)
            .or_else(|| match proto.list("", "") {
                Ok(entries) => entries.first().and_then(|entry| entry.delimiter),
                Err(err) => {
                    debug!("cannot list root of {}: {}", self.config.host, err);
                    None
                }
            })
            .unwrap_or('/');
        let root = self
            .config
            .reference
            .clone()
            .or_else(|| namespace.map(|ns| ns.prefix))
            .unwrap_or_default();

        debug!("{}: delimiter {:?}, root {:?}", self.name, delimiter, root);
        let _ = self.delimiter.set(delimiter);
        let _ = self.root.set(root);
    }

    fn open(&self) -> Result<Session> {
        let host = &self.config.host;
        info!("opening new connection to {}", host);

        let mut proto = self
            .connector
            .connect(&self.config)
            .map_err(|err| Error::ConnectError(err, host.clone()))?;

        if let Err(err) = self.authenticate(proto.as_mut()) {
            let _ = proto.logout();
            return Err(err);
        }
        self.discover(proto.as_mut());

        Ok(Session {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            proto,
            owner: None,
            selected: None,
        })
    }

    /// Takes an idle session, preferring the one last used by the
    /// given worker.
    fn take_idle(&self, worker: &WorkerId) -> Option<Session> {
        let mut idle = self.idle();
        let pos = idle
            .iter()
            .position(|session| session.owner.as_ref() == Some(worker))
            .or_else(|| idle.len().checked_sub(1))?;
        Some(idle.swap_remove(pos))
    }

    fn checkout<'a>(
        &'a self,
        permit: SemaphorePermit<'a>,
        worker: &WorkerId,
    ) -> Result<SessionGuard<'a>> {
        let mut session = match self.take_idle(worker) {
            Some(session) => {
                trace!("reusing session {} for worker {}", session.id, worker.0);
                session
            }
            None => self.open()?,
        };
        session.owner = Some(worker.clone());
        Ok(SessionGuard {
            pool: self,
            session: Some(session),
            _permit: permit,
            drop_it: false,
        })
    }

    /// Blocks until a session slot is free, then returns an
    /// authenticated session.
    pub fn acquire(&self, worker: &WorkerId) -> Result<SessionGuard<'_>> {
        let permit = self.semaphore.acquire();
        self.checkout(permit, worker)
    }

    /// Returns an authenticated session if a slot is free, without
    /// blocking.
    pub fn try_acquire(&self, worker: &WorkerId) -> Result<Option<SessionGuard<'_>>> {
        match self.semaphore.try_acquire() {
            Some(permit) => self.checkout(permit, worker).map(Some),
            None => Ok(None),
        }
    }

    fn release(&self, session: Session, drop_it: bool) {
        if drop_it {
            debug!("closing session {} of {}", session.id, self.name);
            session.logout();
        } else {
            self.idle().push(session);
        }
    }

    /// Blocks until at least one session slot is free, without taking
    /// it.
    pub fn wait_for_slot(&self) {
        self.semaphore.wait_available(None);
    }

    /// Returns the hierarchy delimiter of the server, connecting if
    /// needed.
    pub fn delimiter(&self) -> Result<char> {
        if let Some(delimiter) = self.delimiter.get() {
            return Ok(*delimiter);
        }
        drop(self.acquire(&WorkerId::new("discovery"))?);
        Ok(self.delimiter.get().cloned().unwrap_or('/'))
    }

    /// Returns the namespace root of the server, connecting if
    /// needed.
    pub fn root(&self) -> Result<String> {
        if let Some(root) = self.root.get() {
            return Ok(root.clone());
        }
        drop(self.acquire(&WorkerId::new("discovery"))?);
        Ok(self.root.get().cloned().unwrap_or_default())
    }

    /// Closes every idle session. Sessions in use are not affected.
    pub fn drop_connections(&self) {
        let sessions = mem::take(&mut *self.idle());
        if !sessions.is_empty() {
            info!("dropping {} connection(s) to {}", sessions.len(), self.config.host);
        }
        for session in sessions {
            session.logout();
        }
    }

    /// Sets the policy applied at the end of a synchronization: idle
    /// sessions stay open only when held.
    pub fn hold_connections(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
        if !hold {
            self.drop_connections();
        }
    }

    pub fn holds_connections(&self) -> bool {
        self.hold.load(Ordering::SeqCst)
    }

    /// Waits for every session in use to be released, then closes
    /// them all.
    pub fn close(&self) {
        let _permits = self.semaphore.acquire_all();
        self.drop_connections();
    }

    /// Keeps the connections of the store alive until `stop` is set.
    ///
    /// Without idle folders, idle sessions receive a NOOP every
    /// keepalive interval. Otherwise one session per idle folder
    /// waits for new messages with IDLE, and `on_new_mail` is called
    /// as soon as one arrives.
    pub fn keepalive<F>(&self, config: &KeepaliveConfig, tick: Duration, stop: &AtomicBool, on_new_mail: F)
    where
        F: Fn() + Sync,
    {
        let folders = self.config.idle_folders();
        if folders.is_empty() {
            self.keepalive_noop(config.interval, tick, stop);
        } else {
            let timeout = config.idle_timeout.min(tick).max(Duration::from_millis(1));
            thread::scope(|scope| {
                for folder in &folders {
                    let on_new_mail = &on_new_mail;
                    scope.spawn(move || self.keepalive_idle(folder, timeout, stop, on_new_mail));
                }
            });
        }
    }

    fn keepalive_noop(&self, interval: Duration, tick: Duration, stop: &AtomicBool) {
        let mut last_round = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            thread::sleep(tick.min(interval));
            if last_round.elapsed() < interval {
                continue;
            }
            last_round = Instant::now();

            self.noop_idle_sessions();
        }
    }

    /// Sends a NOOP to every idle session, one at a time. A session
    /// out of the idle set always holds a permit, so the pool never
    /// opens more than its maximum meanwhile.
    fn noop_idle_sessions(&self) {
        let count = self.idle().len();
        trace!("sending noop to {} idle session(s)", count);
        for _ in 0..count {
            let _permit = match self.semaphore.try_acquire() {
                Some(permit) => permit,
                None => break,
            };
            let mut session = match self.idle().pop() {
                Some(session) => session,
                None => break,
            };
            match session.proto.noop() {
                Ok(()) => self.idle().insert(0, session),
                Err(err) => {
                    warn!("keepalive of session {} failed, closing it: {}", session.id, err);
                    session.logout();
                }
            }
        }
    }

    fn keepalive_idle(&self, folder: &str, timeout: Duration, stop: &AtomicBool, on_new_mail: &dyn Fn()) {
        let worker = WorkerId::new(format!("idle:{}", folder));
        let mut session = match self.try_acquire(&worker) {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!("no free connection to watch folder {}, skipping it", folder);
                return;
            }
            Err(err) => {
                warn!("cannot open connection to watch folder {}: {}", folder, err);
                return;
            }
        };

        if let Err(err) = session.select(folder, true) {
            warn!("cannot select folder {} to watch it: {}", folder, err);
            return;
        }

        while !stop.load(Ordering::SeqCst) {
            match session.run(|proto| proto.idle(timeout)) {
                Ok(IdleEvent::Timeout) => continue,
                Ok(IdleEvent::NewMail) => {
                    info!("new mail in folder {}", folder);
                    on_new_mail();
                    break;
                }
                Err(err) => {
                    warn!("cannot watch folder {}: {}", folder, err);
                    break;
                }
            }
        }
    }
}

/// Represents a session taken from the pool. The session goes back
/// to the pool when the guard is dropped, unless it was flagged
/// unusable.
pub struct SessionGuard<'a> {
    pool: &'a SessionPool,
    session: Option<Session>,
    _permit: SemaphorePermit<'a>,
    drop_it: bool,
}

impl SessionGuard<'_> {
    fn session(&mut self) -> &mut Session {
        // The session is only taken out of the guard on drop.
        match self.session.as_mut() {
            Some(session) => session,
            None => unreachable!("session guard used after release"),
        }
    }

    pub fn id(&self) -> usize {
        self.session.as_ref().map(|s| s.id).unwrap_or_default()
    }

    /// Flags the session so that it is closed instead of going back
    /// to the pool.
    pub fn drop_it(&mut self) {
        self.drop_it = true;
    }

    /// Runs a command on the session. A failure breaking the session
    /// flags it unusable.
    pub fn run<T, F>(&mut self, f: F) -> protocol::Result<T>
    where
        F: FnOnce(&mut dyn ImapProtocol) -> protocol::Result<T>,
    {
        let res = f(self.session().proto.as_mut());
        if let Err(ref err) = res {
            if err.breaks_session() {
                debug!("session {} is unusable: {}", self.id(), err);
                self.drop_it = true;
            }
        }
        res
    }

    /// Selects the given mailbox and returns its fresh state.
    pub fn select(&mut self, mailbox: &str, readonly: bool) -> protocol::Result<MailboxState> {
        self.session().selected = None;
        let state = self.run(|proto| proto.select(mailbox, readonly))?;
        self.session().selected = Some((mailbox.to_owned(), readonly || state.read_only));
        Ok(state)
    }

    /// Selects the given mailbox unless the session already has it
    /// selected with sufficient rights.
    pub fn ensure_selected(&mut self, mailbox: &str, readonly: bool) -> protocol::Result<()> {
        let reusable = match &self.session().selected {
            Some((selected, selected_readonly)) => {
                selected == mailbox && (readonly || !selected_readonly)
            }
            None => false,
        };
        if !reusable {
            self.select(mailbox, readonly)?;
        }
        Ok(())
    }

    /// Returns `true` if the selected mailbox is read-only.
    pub fn is_read_only(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|s| s.selected.as_ref())
            .map(|(_, readonly)| *readonly)
            .unwrap_or_default()
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, self.drop_it);
        }
    }
}
