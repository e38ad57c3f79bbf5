// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Snapshots of the clone taken before a run changes it.
//!
//! A backup is a timestamped directory under one of several candidate roots.
//! It holds a custom-format database dump, a copy of the application server's
//! configuration tree, a copy of the search index configuration and a
//! `manifest.json` describing them. Backups are never modified after they are
//! written; the retention sweep deletes them whole.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RunConfiguration;
use crate::prompt::{self, InputRequest, Prompter};
use crate::services::LocalDatabase;
use crate::tree;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DIRECTORY_PREFIX: &str = "stagesync-backup-";
const DATABASE_DUMP: &str = "database.dump";
const APPSERVER_CONFIG: &str = "appserver-config";
const SEARCH_CONF: &str = "search-conf";

/// Backups older than this are purged by the retention sweep.
pub const RETENTION: TimeDelta = TimeDelta::days(7);

/// Returns the free space in bytes of the filesystem holding a path.
pub type FreeSpaceCheck = fn(&Path) -> io::Result<u64>;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("no backup location has {required} bytes free")]
    NoSpace { required: u64 },
    #[error("failed to back up the database")]
    Database(#[source] anyhow::Error),
    #[error("failed to write backup to {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read backup manifest {}", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("no backup found")]
    NotFound,
    #[error(transparent)]
    Prompt(anyhow::Error),
}

/// Describes one backup directory. Paths inside are relative to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    #[serde(skip)]
    directory: PathBuf,
    pub created_at: DateTime<Utc>,
    /// The host the backup was taken on.
    pub host: String,
    pub database: String,
    database_dump: String,
    appserver_config: String,
    search_conf: Option<String>,
}

impl BackupManifest {
    /// Reads the manifest of the backup in `directory`.
    pub fn load(directory: &Path) -> Result<BackupManifest, BackupError> {
        let path = directory.join(MANIFEST_FILE);
        let manifest_error = |source: anyhow::Error| BackupError::Manifest {
            path: path.clone(),
            source,
        };
        let text = std::fs::read_to_string(&path).map_err(|e| manifest_error(e.into()))?;
        let mut manifest: BackupManifest =
            serde_json::from_str(&text).map_err(|e| manifest_error(e.into()))?;
        manifest.directory = directory.to_path_buf();
        Ok(manifest)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn database_dump(&self) -> PathBuf {
        self.directory.join(&self.database_dump)
    }

    pub fn appserver_config(&self) -> PathBuf {
        self.directory.join(&self.appserver_config)
    }

    pub fn search_conf(&self) -> Option<PathBuf> {
        self.search_conf.as_ref().map(|dir| self.directory.join(dir))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > RETENTION
    }
}

/// The roots searched for space, in priority order.
pub fn candidate_roots(config: &RunConfiguration) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    roots.extend(config.backup_dir());
    roots.push(PathBuf::from("/var/backups/stagesync"));
    if let Some(home) = std::env::var_os("HOME") {
        roots.push(PathBuf::from(home).join("stagesync-backups"));
    }
    roots.push(PathBuf::from("/tmp"));
    roots
}

/// Free space of the filesystem that holds `path`, or would hold it once
/// created.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let existing = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));
    let stat = nix::sys::statvfs::statvfs(existing).map_err(io::Error::from)?;
    // `fsblkcnt_t` is a `u32` on macOS but a `u64` on Linux.
    #[allow(clippy::useless_conversion)]
    let blocks = u64::from(stat.blocks_available());
    Ok(blocks.saturating_mul(stat.fragment_size()))
}

/// The required space: the estimate plus a 20% margin.
pub fn with_margin(estimate: u64) -> u64 {
    estimate.saturating_add(estimate / 5)
}

pub struct BackupManager<'a> {
    config: &'a RunConfiguration,
    database: &'a dyn LocalDatabase,
    prompter: &'a dyn Prompter,
    roots: Vec<PathBuf>,
    free_space: FreeSpaceCheck,
}

impl<'a> BackupManager<'a> {
    pub fn new(
        config: &'a RunConfiguration,
        database: &'a dyn LocalDatabase,
        prompter: &'a dyn Prompter,
        roots: Vec<PathBuf>,
        free_space: FreeSpaceCheck,
    ) -> BackupManager<'a> {
        BackupManager {
            config,
            database,
            prompter,
            roots,
            free_space,
        }
    }

    /// Estimates the bytes a backup needs, margin included.
    pub async fn required_space(&self) -> Result<u64, BackupError> {
        let database = self
            .database
            .size_bytes()
            .await
            .map_err(BackupError::Database)?;
        let mut files = 0u64;
        for dir in [self.config.appserver_config_dir(), self.config.search_conf_dir()] {
            files = files.saturating_add(
                tree::tree_size(&dir).map_err(|source| BackupError::Write { path: dir, source })?,
            );
        }
        Ok(with_margin(database.saturating_add(files)))
    }

    /// Picks the first root with `required` bytes free, asking the operator
    /// for a directory if none has enough.
    pub fn choose_root(&self, required: u64) -> Result<PathBuf, BackupError> {
        for root in &self.roots {
            match (self.free_space)(root) {
                Ok(free) if free >= required => {
                    if std::fs::create_dir_all(root).is_ok() {
                        info!("backing up to {} ({free} bytes free)", root.display());
                        return Ok(root.clone());
                    }
                    debug!("{} has space but cannot be created", root.display());
                }
                Ok(free) => debug!("{}: only {free} of {required} bytes free", root.display()),
                Err(e) => debug!("{}: cannot determine free space: {e}", root.display()),
            }
        }

        let request = InputRequest::text("backup.directory", "Backup directory", None, true)
            .because(format!(
                "None of {} has {required} bytes free.",
                self.roots
                    .iter()
                    .map(|r| r.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        let Some(answer) = prompt::text(self.prompter, &request).map_err(BackupError::Prompt)? else {
            return Err(BackupError::NoSpace { required });
        };
        let root = PathBuf::from(answer);
        match (self.free_space)(&root) {
            Ok(free) if free >= required => {
                std::fs::create_dir_all(&root).map_err(|source| BackupError::Write {
                    path: root.clone(),
                    source,
                })?;
                Ok(root)
            }
            _ => Err(BackupError::NoSpace { required }),
        }
    }

    /// Takes a full backup.
    pub async fn create(&self, now: DateTime<Utc>) -> Result<BackupManifest, BackupError> {
        let required = self.required_space().await?;
        let root = self.choose_root(required)?;
        let directory = root.join(format!("{DIRECTORY_PREFIX}{}", now.format("%Y%m%d-%H%M%S")));
        let write_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| BackupError::Write { path, source }
        };
        std::fs::create_dir_all(&directory).map_err(write_error(&directory))?;

        let dump = directory.join(DATABASE_DUMP);
        info!("dumping local database to {}", dump.display());
        self.database
            .dump(&dump)
            .await
            .map_err(BackupError::Database)?;
        self.database
            .validate_dump(&dump)
            .await
            .context("backup dump failed validation")
            .map_err(BackupError::Database)?;

        let config_copy = directory.join(APPSERVER_CONFIG);
        let copied = tree::copy_tree(&self.config.appserver_config_dir(), &config_copy)
            .map_err(write_error(&config_copy))?;
        debug!("copied {copied} application server configuration files");

        let search_source = self.config.search_conf_dir();
        let search_conf = if search_source.is_dir() {
            let search_copy = directory.join(SEARCH_CONF);
            tree::copy_tree(&search_source, &search_copy).map_err(write_error(&search_copy))?;
            Some(SEARCH_CONF.to_string())
        } else {
            warn!(
                "search index configuration {} not found, not backed up",
                search_source.display()
            );
            None
        };

        let manifest = BackupManifest {
            directory: directory.clone(),
            created_at: now,
            host: self.config.local_server().to_string(),
            database: self.config.local_database().dbname,
            database_dump: DATABASE_DUMP.into(),
            appserver_config: APPSERVER_CONFIG.into(),
            search_conf,
        };
        let manifest_path = directory.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(&manifest).map_err(|e| BackupError::Manifest {
            path: manifest_path.clone(),
            source: e.into(),
        })?;
        std::fs::write(&manifest_path, json).map_err(write_error(&manifest_path))?;
        info!("backup complete: {}", directory.display());
        Ok(manifest)
    }
}

/// Every readable backup under `roots`, newest first.
pub fn list_backups(roots: &[PathBuf]) -> Vec<BackupManifest> {
    let mut backups = Vec::new();
    for root in roots {
        let Ok(entries) = std::fs::read_dir(root) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_backup = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(DIRECTORY_PREFIX));
            if !is_backup || !path.is_dir() {
                continue;
            }
            match BackupManifest::load(&path) {
                Ok(manifest) => backups.push(manifest),
                Err(e) => debug!("skipping {}: {e}", path.display()),
            }
        }
    }
    backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    backups
}

pub fn latest_backup(roots: &[PathBuf]) -> Result<BackupManifest, BackupError> {
    list_backups(roots)
        .into_iter()
        .next()
        .ok_or(BackupError::NotFound)
}

/// Deletes every backup older than [`RETENTION`], returning the deleted
/// directories. A backup that cannot be deleted is logged and kept.
pub fn purge_expired(roots: &[PathBuf], now: DateTime<Utc>) -> Vec<PathBuf> {
    let mut purged = Vec::new();
    for manifest in list_backups(roots) {
        if !manifest.is_expired(now) {
            continue;
        }
        match std::fs::remove_dir_all(manifest.directory()) {
            Ok(()) => {
                info!("purged {}", manifest.directory().display());
                purged.push(manifest.directory().to_path_buf());
            }
            Err(e) => warn!("failed to purge {}: {e}", manifest.directory().display()),
        }
    }
    purged
}
