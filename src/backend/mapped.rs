//! Mapped store module.
//!
//! This module contains the store decorator opening every folder of
//! the wrapped store as a [`MappedFolder`].

use std::{path::PathBuf, sync::atomic::AtomicBool, time::Duration};

use crate::{
    backend::Store,
    folder::{self, Folder, MappedFolder},
    KeepaliveConfig,
};

#[derive(Debug)]
pub struct MappedStore {
    inner: Box<dyn Store>,
    uid_maps_dir: PathBuf,
}

impl MappedStore {
    pub fn new<P: Into<PathBuf>>(inner: Box<dyn Store>, uid_maps_dir: P) -> Self {
        Self {
            inner,
            uid_maps_dir: uid_maps_dir.into(),
        }
    }

    /// Returns the path of the uid map of the given folder. Folder
    /// hierarchies are flattened.
    pub fn uid_map_path(&self, folder: &str) -> PathBuf {
        let file_name: String = folder
            .chars()
            .map(|c| match c {
                '/' | '\\' => '.',
                c => c,
            })
            .collect();
        self.uid_maps_dir.join(file_name)
    }
}

impl Store for MappedStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn sep(&self) -> folder::Result<char> {
        self.inner.sep()
    }

    fn list_folders(&self) -> folder::Result<Vec<String>> {
        self.inner.list_folders()
    }

    fn create_folder(&self, name: &str) -> folder::Result<()> {
        self.inner.create_folder(name)
    }

    fn open_folder(&self, name: &str) -> folder::Result<Box<dyn Folder>> {
        let inner = self.inner.open_folder(name)?;
        let folder = MappedFolder::new(inner, self.uid_map_path(name))?;
        Ok(Box::new(folder))
    }

    fn max_connections(&self) -> Option<usize> {
        self.inner.max_connections()
    }

    fn drop_connections(&self) {
        self.inner.drop_connections()
    }

    fn hold_connections(&self, hold: bool) {
        self.inner.hold_connections(hold)
    }

    fn close(&self) {
        self.inner.close()
    }

    fn keepalive(
        &self,
        config: &KeepaliveConfig,
        tick: Duration,
        stop: &AtomicBool,
        on_new_mail: &(dyn Fn() + Sync),
    ) {
        self.inner.keepalive(config, tick, stop, on_new_mail)
    }
}
