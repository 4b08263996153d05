//! Maildir store module.

use log::{debug, info};
use std::{
    fs,
    path::{Path, PathBuf},
};

use super::{Error, MaildirFolder, Result};
use crate::{
    backend::Store,
    folder::{self, Folder},
    MaildirConfig,
};

const SUBDIRS: [&str; 3] = ["cur", "new", "tmp"];

/// Represents a hierarchy of Maildir folders. Folder names are the
/// paths of the folders relative to the root directory, joined by
/// the configured separator.
#[derive(Debug)]
pub struct MaildirStore {
    name: String,
    config: MaildirConfig,
    readonly: bool,
}

impl MaildirStore {
    pub fn new<N: ToString>(name: N, config: MaildirConfig, readonly: bool) -> Self {
        Self {
            name: name.to_string(),
            config,
            readonly,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }

    /// Returns the directory of the given folder.
    pub fn folder_path(&self, name: &str) -> PathBuf {
        name.split(self.config.sep())
            .filter(|part| !part.is_empty())
            .fold(self.config.root_dir.clone(), |path, part| path.join(part))
    }

    fn is_maildir(path: &Path) -> bool {
        SUBDIRS.iter().all(|subdir| path.join(subdir).is_dir())
    }

    fn walk(&self, dir: &Path, parents: &[String], folders: &mut Vec<String>) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|err| Error::ReadDirError(err, dir.to_owned()))?;
        for entry in entries {
            let entry = entry.map_err(|err| Error::ReadDirError(err, dir.to_owned()))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !path.is_dir() || name.starts_with('.') {
                continue;
            }
            if SUBDIRS.contains(&name.as_str()) && Self::is_maildir(dir) {
                continue;
            }

            let mut parts = parents.to_vec();
            parts.push(name);
            if Self::is_maildir(&path) {
                folders.push(parts.join(&self.config.sep().to_string()));
            }
            self.walk(&path, &parts, folders)?;
        }
        Ok(())
    }
}

impl Store for MaildirStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn sep(&self) -> folder::Result<char> {
        Ok(self.config.sep())
    }

    fn list_folders(&self) -> folder::Result<Vec<String>> {
        let mut folders = vec![];
        if self.config.root_dir.is_dir() {
            self.walk(&self.config.root_dir, &[], &mut folders)?;
        }
        folders.sort();
        debug!("found {} folder(s) in {}", folders.len(), self.name);
        Ok(folders)
    }

    fn create_folder(&self, name: &str) -> folder::Result<()> {
        info!("creating folder {} in {}", name, self.name);
        let path = self.folder_path(name);
        for subdir in SUBDIRS {
            let dir = path.join(subdir);
            fs::create_dir_all(&dir).map_err(|err| Error::CreateDirError(err, dir.clone()))?;
        }
        Ok(())
    }

    fn open_folder(&self, name: &str) -> folder::Result<Box<dyn Folder>> {
        let path = self.folder_path(name);
        if !Self::is_maildir(&path) {
            return Err(Error::FolderNotFoundError(name.to_owned(), path).into());
        }
        Ok(Box::new(MaildirFolder::new(
            name,
            self.config.sep(),
            path,
            self.readonly,
            self.config.labels_header.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::MaildirStore;
    use crate::{backend::Store, HasSeverity, MaildirConfig, Severity};

    #[test]
    fn list_nested_folders() {
        let dir = tempdir().unwrap();
        let store = MaildirStore::new(
            "acc:local",
            MaildirConfig {
                root_dir: dir.path().to_owned(),
                sep: Some('/'),
                ..MaildirConfig::default()
            },
            false,
        );

        assert!(store.list_folders().unwrap().is_empty());
        store.create_folder("INBOX").unwrap();
        store.create_folder("Archive/2023").unwrap();
        store.create_folder("INBOX/Sub").unwrap();

        assert_eq!(
            store.list_folders().unwrap(),
            vec!["Archive/2023", "INBOX", "INBOX/Sub"]
        );
        assert_eq!(store.folder_path("Archive/2023"), dir.path().join("Archive").join("2023"));
        assert_eq!(store.sep().unwrap(), '/');
    }

    #[test]
    fn missing_folder_cannot_be_opened() {
        let dir = tempdir().unwrap();
        let store = MaildirStore::new(
            "acc:local",
            MaildirConfig {
                root_dir: dir.path().to_owned(),
                ..MaildirConfig::default()
            },
            false,
        );

        let err = store.open_folder("Missing").unwrap_err();
        assert_eq!(err.severity(), Severity::Folder);

        store.create_folder("Work.Projects").unwrap();
        assert_eq!(store.open_folder("Work.Projects").unwrap().sep(), '.');
    }
}
