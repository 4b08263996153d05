//! Folder structure module.
//!
//! This module contains the synchronization of the folder structure
//! of an account: both stores are listed, folder names are translated
//! from one store to the other, missing folders are created, and the
//! resulting folder pairs are returned.

use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

use super::{Error, Result};
use crate::{backend::Store, AccountConfig, NameTrans, SyncReport};

/// Represents a remote folder and its local counterpart.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FolderPair {
    pub remote: String,
    pub local: String,
}

fn convert_sep(name: &str, from: char, to: char) -> String {
    if from == to {
        return name.to_owned();
    }
    name.chars()
        .map(|c| if c == from { to } else { c })
        .collect()
}

/// Translates folder names between the remote and the local store.
///
/// Both name translations work on names using the local separator:
/// remote names are converted to the local separator before being
/// translated, local names are translated before being converted
/// to the remote separator.
#[derive(Clone, Debug)]
pub struct NameMapper<'a> {
    remote_sep: char,
    local_sep: char,
    remote_nametrans: &'a NameTrans,
    local_nametrans: &'a NameTrans,
}

impl<'a> NameMapper<'a> {
    pub fn new(
        remote_sep: char,
        local_sep: char,
        remote_nametrans: &'a NameTrans,
        local_nametrans: &'a NameTrans,
    ) -> Self {
        Self {
            remote_sep,
            local_sep,
            remote_nametrans,
            local_nametrans,
        }
    }

    pub fn to_local(&self, remote: &str) -> String {
        let name = convert_sep(remote, self.remote_sep, self.local_sep);
        self.remote_nametrans.apply(name)
    }

    pub fn to_remote(&self, local: &str) -> String {
        let name = self.local_nametrans.apply(local);
        convert_sep(&name, self.local_sep, self.remote_sep)
    }
}

/// Synchronizes the folder structure of both stores and returns the
/// folder pairs to synchronize.
///
/// A folder missing on one side is created there when the account
/// allows it. Before creating it, the translation of its name is
/// checked to lead back to the original folder: otherwise every
/// synchronization would create one more folder.
pub fn sync_structure(
    config: &AccountConfig,
    remote: &dyn Store,
    local: &dyn Store,
    report: &mut SyncReport,
) -> Result<Vec<FolderPair>> {
    let mapper = NameMapper::new(
        remote.sep()?,
        local.sep()?,
        &config.remote_nametrans,
        &config.local_nametrans,
    );

    let remote_all: BTreeSet<String> = remote.list_folders()?.into_iter().collect();
    let local_all: BTreeSet<String> = local.list_folders()?.into_iter().collect();
    debug!(
        "found {} remote and {} local folder(s)",
        remote_all.len(),
        local_all.len()
    );

    let create_local = config.create_local_folders() && !config.local_readonly();
    let create_remote = config.create_remote_folders() && !config.remote_readonly();
    let dry_run = config.dry_run();

    let mut pairs: BTreeMap<String, String> = BTreeMap::new();

    for name in remote_all.iter().filter(|name| config.remote_filter.accepts(name)) {
        let local_name = mapper.to_local(name);
        if !local_all.contains(&local_name) {
            if !create_local {
                debug!("local folder {} missing, skipping {}", local_name, name);
                continue;
            }
            if mapper.to_remote(&local_name) != *name {
                return Err(Error::InfiniteFolderCreationError(
                    name.clone(),
                    local_name,
                ));
            }
            if dry_run {
                info!("would create local folder {}", local_name);
                report.created_folders.push(local_name);
                continue;
            }
            info!("creating local folder {}", local_name);
            local.create_folder(&local_name)?;
            report.created_folders.push(local_name.clone());
        } else if !config.local_filter.accepts(&local_name) {
            debug!("local folder {} excluded, skipping {}", local_name, name);
            continue;
        }
        pairs.insert(name.clone(), local_name);
    }

    for name in local_all.iter().filter(|name| config.local_filter.accepts(name)) {
        let remote_name = mapper.to_remote(name);
        if pairs.contains_key(&remote_name) {
            continue;
        }
        if remote_all.contains(&remote_name) {
            // the remote folder exists but was not paired: excluded
            debug!("remote folder {} excluded, skipping {}", remote_name, name);
            continue;
        }
        if !create_remote {
            debug!("remote folder {} missing, skipping {}", remote_name, name);
            continue;
        }
        if mapper.to_local(&remote_name) != *name {
            return Err(Error::InfiniteFolderCreationError(name.clone(), remote_name));
        }
        if dry_run {
            info!("would create remote folder {}", remote_name);
            report.created_folders.push(remote_name);
            continue;
        }
        info!("creating remote folder {}", remote_name);
        remote.create_folder(&remote_name)?;
        report.created_folders.push(remote_name.clone());
        pairs.insert(remote_name, name.clone());
    }

    Ok(pairs
        .into_iter()
        .map(|(remote, local)| FolderPair { remote, local })
        .collect())
}
