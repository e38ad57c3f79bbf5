// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Restoring the clone from a backup.
//!
//! A successful rollback contains the damage of a failed run; it never turns
//! the run into a success. The dependent services are restarted at the end of
//! every rollback, whether or not the individual restorations worked.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::Context;
use tracing::{info, warn};

use crate::backup::BackupManifest;
use crate::config::RunConfiguration;
use crate::context::RunContext;
use crate::pipeline::{StageEnv, StageId, StageResult};
use crate::safety::DOMAIN_CONFIG_FILE;
use crate::services::Services;
use crate::tree;
use crate::tuning::{self, TuningParameter};

/// Where a run failed, or `All` for a full restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    Stage(StageId),
    All,
}

impl fmt::Display for FailurePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePoint::Stage(stage) => write!(f, "{stage}"),
            FailurePoint::All => f.write_str("all"),
        }
    }
}

/// One restorable subsystem, in restore order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestoreTarget {
    Database,
    Integrations,
    TuningParameters,
    SearchConfig,
    ConfigTree,
}

impl RestoreTarget {
    /// The stage whose changes this target undoes.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            RestoreTarget::Database => Some(StageId::Database),
            RestoreTarget::Integrations => Some(StageId::ExternalIntegrations),
            RestoreTarget::TuningParameters => Some(StageId::TuningParameters),
            RestoreTarget::SearchConfig => Some(StageId::SearchIndex),
            RestoreTarget::ConfigTree => None,
        }
    }

    fn needs_backup(&self) -> bool {
        *self != RestoreTarget::Integrations
    }
}

impl fmt::Display for RestoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreTarget::Database => "database",
            RestoreTarget::Integrations => "external integrations",
            RestoreTarget::TuningParameters => "tuning parameters",
            RestoreTarget::SearchConfig => "search index configuration",
            RestoreTarget::ConfigTree => "application server configuration",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    Failed(String),
    NoBackup,
}

impl RestoreOutcome {
    /// The refined result of a stage that had changed the clone.
    pub fn stage_result(&self) -> StageResult {
        match self {
            RestoreOutcome::Restored => StageResult::FailedRolledBack,
            RestoreOutcome::Failed(_) => StageResult::FailedRollbackFailed,
            RestoreOutcome::NoBackup => StageResult::FailedNoBackup,
        }
    }
}

impl fmt::Display for RestoreOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreOutcome::Restored => f.write_str("restored"),
            RestoreOutcome::Failed(reason) => write!(f, "FAILED: {reason}"),
            RestoreOutcome::NoBackup => f.write_str("no backup"),
        }
    }
}

/// The subsystems restored for `point`.
pub fn targets(point: FailurePoint) -> Vec<RestoreTarget> {
    match point {
        FailurePoint::All => vec![
            RestoreTarget::Database,
            RestoreTarget::Integrations,
            RestoreTarget::TuningParameters,
            RestoreTarget::SearchConfig,
            RestoreTarget::ConfigTree,
        ],
        FailurePoint::Stage(StageId::Database) => vec![RestoreTarget::Database],
        FailurePoint::Stage(StageId::ExternalIntegrations) => vec![RestoreTarget::Integrations],
        FailurePoint::Stage(StageId::TuningParameters) => vec![RestoreTarget::TuningParameters],
        FailurePoint::Stage(StageId::SearchIndex) => vec![RestoreTarget::SearchConfig],
        // Copied files and restarted services have nothing to restore from.
        FailurePoint::Stage(_) => Vec::new(),
    }
}

/// The result of one rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rollback {
    pub restorations: Vec<(RestoreTarget, RestoreOutcome)>,
    pub warnings: Vec<String>,
}

impl Rollback {
    pub fn all_restored(&self) -> bool {
        self.restorations
            .iter()
            .all(|(_, outcome)| *outcome == RestoreOutcome::Restored)
    }
}

/// Restores `targets` from `manifest`, then restarts the services.
pub async fn restore(
    targets: &[RestoreTarget],
    manifest: Option<&BackupManifest>,
    config: &RunConfiguration,
    services: &Services,
) -> Rollback {
    let mut rollback = Rollback::default();
    for target in targets {
        let outcome = match (manifest, target.needs_backup()) {
            (None, true) => RestoreOutcome::NoBackup,
            (manifest, _) => match restore_one(*target, manifest, config, services).await {
                Ok(outcome) => outcome,
                Err(e) => RestoreOutcome::Failed(format!("{e:#}")),
            },
        };
        match &outcome {
            RestoreOutcome::Failed(_) => warn!("rollback of {target}: {outcome}"),
            _ => info!("rollback of {target}: {outcome}"),
        }
        rollback.restorations.push((*target, outcome));
    }

    if let Err(e) = services.app_server.restart().await {
        rollback
            .warnings
            .push(format!("failed to restart application server after rollback: {e:#}"));
    }
    if let Err(e) = services.search.restart().await {
        rollback
            .warnings
            .push(format!("failed to restart search index after rollback: {e:#}"));
    }
    rollback
}

async fn restore_one(
    target: RestoreTarget,
    manifest: Option<&BackupManifest>,
    config: &RunConfiguration,
    services: &Services,
) -> anyhow::Result<RestoreOutcome> {
    match (target, manifest) {
        (RestoreTarget::Integrations, _) => {
            for integration in services.integrations.list().await? {
                if let Some(id) = integration.id {
                    services
                        .integrations
                        .remove(id)
                        .await
                        .with_context(|| format!("removing {}", integration.display_name))?;
                }
            }
        }
        (_, None) => return Ok(RestoreOutcome::NoBackup),
        (RestoreTarget::Database, Some(manifest)) => {
            let dump = manifest.database_dump();
            services.database.validate_dump(&dump).await?;
            services.database.restore(&dump).await?;
        }
        (RestoreTarget::TuningParameters, Some(manifest)) => {
            let path = manifest.appserver_config().join(DOMAIN_CONFIG_FILE);
            let xml = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let backed_up = tuning::parse_domain_config(&xml);
            let current = services.app_server.tuning_parameters().await?;
            for change in restore_plan(&backed_up, &current) {
                match change {
                    tuning::ParameterChange::Delete(p) => {
                        services.app_server.delete_tuning_parameter(&p).await?
                    }
                    tuning::ParameterChange::Create(p) => {
                        services.app_server.create_tuning_parameter(&p).await?
                    }
                }
            }
        }
        (RestoreTarget::SearchConfig, Some(manifest)) => {
            let Some(copy) = manifest.search_conf() else {
                return Ok(RestoreOutcome::NoBackup);
            };
            tree::replace_tree(&copy, &config.search_conf_dir())?;
        }
        (RestoreTarget::ConfigTree, Some(manifest)) => {
            tree::copy_tree(&manifest.appserver_config(), &config.appserver_config_dir())?;
        }
    }
    Ok(RestoreOutcome::Restored)
}

/// Deletes what was added since the backup, then recreates what was removed.
pub fn restore_plan(
    backed_up: &[TuningParameter],
    current: &[TuningParameter],
) -> Vec<tuning::ParameterChange> {
    let wanted: BTreeSet<_> = backed_up.iter().collect();
    let present: BTreeSet<_> = current.iter().collect();
    let deletes = current
        .iter()
        .filter(|p| !wanted.contains(p))
        .cloned()
        .map(tuning::ParameterChange::Delete);
    let creates = backed_up
        .iter()
        .filter(|p| !present.contains(p))
        .cloned()
        .map(tuning::ParameterChange::Create);
    deletes.chain(creates).collect()
}

/// Rolls back after the pipeline failed at `point`, refining the stage
/// results of stages that had changed the clone.
pub(crate) async fn roll_back_failure(
    ctx: &mut RunContext,
    env: &StageEnv<'_>,
    point: FailurePoint,
) {
    let stages: Vec<StageId> = match point {
        FailurePoint::Stage(stage) => vec![stage],
        FailurePoint::All => StageId::ALL.to_vec(),
    };
    let wanted: Vec<_> = targets(point)
        .into_iter()
        .filter(|t| t.stage().is_none_or(|stage| ctx.has_mutated(stage)))
        .collect();
    info!("rolling back {point}");
    let rollback = restore(&wanted, ctx.manifest(), env.config, env.services).await;

    for stage in stages {
        if !ctx.has_mutated(stage) {
            continue;
        }
        let result = rollback
            .restorations
            .iter()
            .find(|(target, _)| target.stage() == Some(stage))
            .map(|(_, outcome)| outcome.stage_result())
            .unwrap_or(StageResult::FailedNoBackup);
        ctx.refine(stage, result);
    }
    for warning in &rollback.warnings {
        ctx.warn(warning.clone());
    }
    ctx.record_rollback(point, rollback.restorations);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(option: &str) -> TuningParameter {
        TuningParameter::parse(option).unwrap()
    }

    #[test]
    fn stage_points_map_to_their_subsystem() {
        assert_eq!(
            targets(FailurePoint::Stage(StageId::Database)),
            vec![RestoreTarget::Database]
        );
        assert!(targets(FailurePoint::Stage(StageId::Files)).is_empty());
        assert_eq!(targets(FailurePoint::All).len(), 5);
        assert_eq!(FailurePoint::Stage(StageId::SearchIndex).to_string(), "search-index");
    }

    #[test]
    fn restore_plan_undoes_changes() {
        let backed_up = vec![p("-Xmx4g"), p("-Ddataverse.fqdn=staging.example.org")];
        let current = vec![
            p("-Xmx8g"),
            p("-Ddataverse.fqdn=staging.example.org"),
            p("-Ddataverse.timerServer=true"),
        ];
        assert_eq!(
            restore_plan(&backed_up, &current),
            vec![
                tuning::ParameterChange::Delete(p("-Xmx8g")),
                tuning::ParameterChange::Delete(p("-Ddataverse.timerServer=true")),
                tuning::ParameterChange::Create(p("-Xmx4g")),
            ]
        );
        assert!(restore_plan(&backed_up, &backed_up).is_empty());
    }

    #[test]
    fn outcomes_refine_results() {
        assert_eq!(
            RestoreOutcome::Restored.stage_result(),
            StageResult::FailedRolledBack
        );
        assert_eq!(
            RestoreOutcome::Failed("x".into()).stage_result(),
            StageResult::FailedRollbackFailed
        );
        assert_eq!(
            RestoreOutcome::NoBackup.stage_result(),
            StageResult::FailedNoBackup
        );
    }
}
