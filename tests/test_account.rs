#[cfg(feature = "maildir-backend")]
use mailsync_lib::{
    account::Error, Account, AccountConfig, AccountLock, AccountState, Flags, Folder, HasSeverity,
    MaildirConfig, MaildirStore, NameTrans, Scheduler, Severity, StatusBackend, Store,
    StoreBuilder, StoreConfig, SyncContext,
};
#[cfg(feature = "maildir-backend")]
use std::{fs, path::Path, sync::Arc};
#[cfg(feature = "maildir-backend")]
use tempfile::tempdir;

#[cfg(feature = "maildir-backend")]
fn account(name: &str, dir: &Path) -> AccountConfig {
    let maildir = |root: &str| MaildirConfig {
        root_dir: dir.join(root),
        ..MaildirConfig::default()
    };
    AccountConfig {
        name: name.into(),
        sync_dir: Some(dir.join("sync")),
        remote: StoreConfig::Maildir(maildir("remote")),
        local: StoreConfig::Maildir(maildir("local")),
        retry_count: Some(0),
        ..AccountConfig::default()
    }
}

#[cfg(feature = "maildir-backend")]
fn seed_remote(dir: &Path, folder: &str, uids: &[i64]) {
    let store = MaildirStore::new(
        "remote",
        MaildirConfig {
            root_dir: dir.join("remote"),
            ..MaildirConfig::default()
        },
        false,
    );
    store.create_folder(folder).unwrap();
    let folder = store.open_folder(folder).unwrap();
    for uid in uids {
        let content = format!("Subject: {}\r\n\r\n", uid);
        folder
            .save_message(*uid, content.as_bytes(), &Flags::default(), None)
            .unwrap();
    }
}

#[test]
#[cfg(feature = "maildir-backend")]
fn test_lock_fails_fast() {
    let dir = tempdir().unwrap();
    seed_remote(dir.path(), "INBOX", &[1]);
    let config = account("account", dir.path());

    fs::create_dir_all(dir.path().join("sync")).unwrap();
    let lock = AccountLock::acquire(dir.path().join("sync"), "account").unwrap();

    let context = Arc::new(SyncContext::new());
    let account = Account::new(config, &StoreBuilder::new(), context).unwrap();
    let err = account.run().unwrap_err();
    assert!(matches!(err, Error::LockHeldError(..)));
    assert_eq!(err.severity(), Severity::Store);
    assert_eq!(account.state(), AccountState::Stopped);

    // the lock is released with its guard
    drop(lock);
    let report = account.run().unwrap();
    assert_eq!(report.to_local().copied, 1);
}

#[test]
#[cfg(feature = "maildir-backend")]
fn test_infinite_folder_creation() {
    let dir = tempdir().unwrap();
    seed_remote(dir.path(), "INBOX.Sent", &[]);
    let config = AccountConfig {
        remote_nametrans: NameTrans::new([("^INBOX\\.", "")]).unwrap(),
        ..account("account", dir.path())
    };

    let context = Arc::new(SyncContext::new());
    let account = Account::new(config, &StoreBuilder::new(), context).unwrap();
    let err = account.run().unwrap_err();
    assert!(matches!(err, Error::InfiniteFolderCreationError(..)));
    assert_eq!(err.severity(), Severity::Store);
}

#[test]
#[cfg(feature = "maildir-backend")]
fn test_name_translation() {
    let dir = tempdir().unwrap();
    seed_remote(dir.path(), "INBOX.Sent", &[1, 2]);
    let config = AccountConfig {
        remote_nametrans: NameTrans::new([("^INBOX\\.", "")]).unwrap(),
        local_nametrans: NameTrans::new([("^(.+)$", "INBOX.$1")]).unwrap(),
        ..account("account", dir.path())
    };

    let context = Arc::new(SyncContext::new());
    let account = Account::new(config, &StoreBuilder::new(), context).unwrap();
    let report = account.run().unwrap();
    assert_eq!(report.created_folders, vec!["Sent"]);
    assert_eq!(report.to_local().copied, 2);
}

#[test]
#[cfg(feature = "maildir-backend")]
fn test_scheduler() {
    let _ = env_logger::builder().is_test(true).try_init();
    let first = tempdir().unwrap();
    let second = tempdir().unwrap();
    seed_remote(first.path(), "INBOX", &[1, 2, 3]);
    seed_remote(second.path(), "INBOX", &[4]);

    let configs = vec![
        account("first", first.path()),
        AccountConfig {
            status_backend: StatusBackend::Sqlite,
            ..account("second", second.path())
        },
    ];

    let context = Arc::new(SyncContext::new());
    let scheduler = Scheduler::new(context.clone()).max_sync_accounts(2);
    let outcomes = scheduler.run(configs);

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].account, "first");
    let report = outcomes[0].result.as_ref().unwrap();
    assert_eq!(report.to_local().copied, 3);
    assert_eq!(outcomes[1].account, "second");
    let report = outcomes[1].result.as_ref().unwrap();
    assert_eq!(report.to_local().copied, 1);

    assert!(context.limiters.accounts(2).peak() <= 2);
    assert!(!context.signals.is_aborted());
    assert!(second
        .path()
        .join("sync")
        .join("status-sqlite")
        .join("second")
        .join("INBOX")
        .is_file());
}
