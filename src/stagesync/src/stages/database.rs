// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Replaces the clone's database with a copy of production's.
//!
//! The production dump is validated before the clone is touched. After the
//! restore, the storage settings are rewritten to match the resolved
//! [`StorageChoice`](crate::storage::StorageChoice), and with
//! `--configure-ddl` the clone-specific SQL overlay is applied.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::context::RunContext;
use crate::pipeline::{Stage, StageEnv, StageId, StageResult};
use crate::stages::absorb;
use crate::storage::{self, SettingChange};

pub struct DatabaseStage;

#[async_trait]
impl Stage for DatabaseStage {
    fn id(&self) -> StageId {
        StageId::Database
    }

    async fn run(&self, ctx: &mut RunContext, env: &StageEnv<'_>) -> anyhow::Result<StageResult> {
        let production = env.config.production_database();
        let local = env.config.local_database();
        if ctx.flags().dry_run {
            info!(
                "would restore {} from {} into {} on {}",
                production.dbname, production.host, local.dbname, local.host
            );
            if ctx.flags().configure_ddl {
                for file in ddl_files(env)? {
                    info!("would apply {}", file.display());
                }
            }
            return Ok(StageResult::DryRun);
        }

        let staging = staging_path(ctx);
        info!("fetching production database dump to {}", staging.display());
        let fetched = env
            .services
            .production
            .fetch_database_dump(&staging)
            .await
            .context("fetching production database dump")?;
        absorb(ctx, fetched);

        let result = restore(ctx, env, &staging).await;
        if let Err(e) = std::fs::remove_file(&staging) {
            warn!("failed to remove {}: {e}", staging.display());
        }
        result
    }
}

/// Where the production dump is staged: beside the backups when there are
/// any, since they were placed where space was found.
fn staging_path(ctx: &RunContext) -> PathBuf {
    let name = format!("stagesync-production-{}.dump", std::process::id());
    ctx.manifest()
        .and_then(|m| m.directory().parent())
        .map(|root| root.join(&name))
        .unwrap_or_else(|| std::env::temp_dir().join(name))
}

async fn restore(
    ctx: &mut RunContext,
    env: &StageEnv<'_>,
    dump: &Path,
) -> anyhow::Result<StageResult> {
    let database = &env.services.database;
    database
        .validate_dump(dump)
        .await
        .context("production dump cannot be restored")?;

    ctx.mark_mutated(StageId::Database);
    database
        .restore(dump)
        .await
        .context("restoring production dump")?;
    info!("restored production database");

    match ctx.storage_choice().cloned() {
        Some(choice) => {
            let settings = database.settings().await.context("reading restored settings")?;
            for change in storage::settings_plan(&choice, &settings) {
                match change {
                    SettingChange::Set { name, value } => {
                        info!("setting {name} = {value}");
                        database.set_setting(&name, &value).await?;
                    }
                    SettingChange::Delete { name } => {
                        info!("deleting setting {name}");
                        database.delete_setting(&name).await?;
                    }
                }
            }
        }
        None => ctx.warn("storage choice unresolved; storage settings copied from production as is"),
    }

    if ctx.flags().configure_ddl {
        for file in ddl_files(env)? {
            let sql = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            database
                .apply_sql(&sql)
                .await
                .with_context(|| format!("applying {}", file.display()))?;
            info!("applied {}", file.display());
        }
    }
    Ok(StageResult::Success)
}

/// The `*.sql` files of the DDL overlay, in lexical order.
pub fn ddl_files(env: &StageEnv<'_>) -> anyhow::Result<Vec<PathBuf>> {
    let Some(dir) = env.config.ddl_dir() else {
        bail!("--configure-ddl needs DDL_DIR to be set");
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
