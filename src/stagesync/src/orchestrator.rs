// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The run modes: sync, restore, cleanup and compare.
//!
//! A sync runs the safety guard, the pre-flight checks, the backup and then
//! the pipeline. Every mode records what it did in the [`RunContext`] so the
//! caller can always print a summary.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use tracing::info;

use crate::backup::{self, BackupManager, BackupManifest, FreeSpaceCheck};
use crate::certificate;
use crate::compare::{self, ConfigDiff};
use crate::config::RunConfiguration;
use crate::context::RunContext;
use crate::error::SyncError;
use crate::pipeline::{Pipeline, StageEnv};
use crate::prompt::{self, InputRequest, Prompter};
use crate::rollback::{self, FailurePoint, RestoreOutcome};
use crate::safety;
use crate::services::Services;

pub struct Orchestrator<'a> {
    config: &'a RunConfiguration,
    services: &'a Services,
    prompter: &'a dyn Prompter,
    backup_roots: Vec<PathBuf>,
    free_space: FreeSpaceCheck,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a RunConfiguration,
        services: &'a Services,
        prompter: &'a dyn Prompter,
    ) -> Orchestrator<'a> {
        Orchestrator {
            config,
            services,
            prompter,
            backup_roots: backup::candidate_roots(config),
            free_space: backup::available_space,
        }
    }

    /// Overrides where backups are looked for and how free space is measured.
    pub fn with_backup_roots(mut self, roots: Vec<PathBuf>, free_space: FreeSpaceCheck) -> Self {
        self.backup_roots = roots;
        self.free_space = free_space;
        self
    }

    fn env(&self) -> StageEnv<'_> {
        StageEnv {
            config: self.config,
            services: self.services,
            prompter: self.prompter,
        }
    }

    /// Synchronizes production onto the clone.
    pub async fn sync(&self, ctx: &mut RunContext) -> Result<(), SyncError> {
        safety::verify(self.config, self.prompter)?;
        self.preflight(ctx).await;

        if ctx.flags().dry_run {
            info!("dry run: no backup taken");
        } else if ctx.flags().skip_backup {
            ctx.warn("backup skipped by request; a failed stage cannot be rolled back");
        } else {
            let manager = BackupManager::new(
                self.config,
                self.services.database.as_ref(),
                self.prompter,
                self.backup_roots.clone(),
                self.free_space,
            );
            let manifest = manager.create(Utc::now()).await?;
            ctx.set_manifest(manifest);
        }

        Pipeline::standard().run(ctx, &self.env()).await
    }

    /// Degraded conditions worth knowing about before anything changes.
    async fn preflight(&self, ctx: &mut RunContext) {
        let production = self.services.production.app_version().await;
        let local = self.services.app_server.version().await;
        match (production, local) {
            (Ok(production), Ok(local)) if production != local => ctx.warn(format!(
                "application versions differ: production runs {production}, the clone runs {local}"
            )),
            (Ok(version), Ok(_)) => info!("both hosts run application version {version}"),
            (Err(e), _) | (_, Err(e)) => {
                ctx.warn(format!("cannot compare application versions: {e:#}"))
            }
        }

        if let Some(path) = self.config.tls_cert_file() {
            match certificate::check(&path) {
                Ok(expiry) => {
                    if let Some(warning) = expiry.warning(&path) {
                        ctx.warn(warning);
                    }
                }
                Err(e) => ctx.warn(format!("cannot check TLS certificate: {e:#}")),
            }
        }
    }

    /// Restores every subsystem from the backup in `directory`, or from the
    /// newest backup. Declining the confirmation is not an error.
    pub async fn restore(
        &self,
        ctx: &mut RunContext,
        directory: Option<&Path>,
    ) -> Result<(), SyncError> {
        safety::verify(self.config, self.prompter)?;
        let manifest = match directory {
            Some(directory) => BackupManifest::load(directory)?,
            None => backup::latest_backup(&self.backup_roots)?,
        };

        let request = restore_request(&manifest);
        if !prompt::confirm(self.prompter, &request)? {
            info!("restore cancelled");
            return Ok(());
        }
        if ctx.flags().dry_run {
            info!("dry run: would restore {}", manifest.directory().display());
            ctx.set_manifest(manifest);
            return Ok(());
        }

        let targets = rollback::targets(FailurePoint::All);
        let rollback =
            rollback::restore(&targets, Some(&manifest), self.config, self.services).await;
        ctx.set_manifest(manifest);
        for warning in &rollback.warnings {
            ctx.warn(warning.clone());
        }
        if rollback.all_restored() {
            info!("restore complete");
            ctx.record_rollback(FailurePoint::All, rollback.restorations);
            return Ok(());
        }
        let incomplete = rollback
            .restorations
            .iter()
            .filter(|(_, outcome)| *outcome != RestoreOutcome::Restored)
            .map(|(target, outcome)| format!("{target}: {outcome}"))
            .join("; ");
        ctx.record_rollback(FailurePoint::All, rollback.restorations);
        Err(SyncError::Restore(incomplete))
    }

    /// Compares production's configuration with the clone's. Changes nothing.
    pub async fn compare(&self) -> anyhow::Result<ConfigDiff> {
        let production = &self.services.production;
        Ok(compare::compare(
            &production.tuning_parameters().await?,
            &self.services.app_server.tuning_parameters().await?,
            &production.settings().await?,
            &self.services.database.settings().await?,
        ))
    }
}

fn restore_request(manifest: &BackupManifest) -> InputRequest {
    InputRequest::confirm(
        "restore.confirm",
        format!(
            "Restore the database and configuration of {} from {}?",
            manifest.host,
            manifest.directory().display()
        ),
        false,
    )
    .because(format!(
        "Backup of {} taken {}. Everything changed since then is lost.",
        manifest.database,
        manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ))
}

/// Deletes expired backups under every candidate root of `config`.
pub fn cleanup(config: &RunConfiguration, now: DateTime<Utc>) -> Vec<PathBuf> {
    let purged = backup::purge_expired(&backup::candidate_roots(config), now);
    info!("purged {} expired backup(s)", purged.len());
    purged
}
