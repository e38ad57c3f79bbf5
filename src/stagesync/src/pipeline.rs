// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The ordered stage pipeline.
//!
//! The pipeline is a linear state machine. Stages run one at a time in a fixed
//! order. The first failure halts the run: the failing stage is recorded as
//! [`StageResult::Failed`], the stages after it stay
//! [`StageResult::NotAttempted`], and the rollback manager is invoked for the
//! failing stage if anything had started changing the clone.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::{error, info};

use crate::config::RunConfiguration;
use crate::context::RunContext;
use crate::error::SyncError;
use crate::prompt::Prompter;
use crate::rollback::{self, FailurePoint};
use crate::services::Services;
use crate::stages;

/// Names one stage. The declaration order is the pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageId {
    Storage,
    Database,
    Files,
    SearchIndex,
    AuxiliaryProcessor,
    TuningParameters,
    ExternalIntegrations,
    PostSetup,
}

impl StageId {
    pub const ALL: [StageId; 8] = [
        StageId::Storage,
        StageId::Database,
        StageId::Files,
        StageId::SearchIndex,
        StageId::AuxiliaryProcessor,
        StageId::TuningParameters,
        StageId::ExternalIntegrations,
        StageId::PostSetup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageId::Storage => "storage",
            StageId::Database => "database",
            StageId::Files => "files",
            StageId::SearchIndex => "search-index",
            StageId::AuxiliaryProcessor => "auxiliary-processor",
            StageId::TuningParameters => "tuning-parameters",
            StageId::ExternalIntegrations => "external-integrations",
            StageId::PostSetup => "post-setup",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<StageId, String> {
        StageId::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// The recorded status of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageResult {
    NotAttempted,
    Skipped,
    DryRun,
    Success,
    Failed,
    /// Failed, and the rollback manager restored what the stage changed.
    FailedRolledBack,
    /// Failed, and restoring what the stage changed failed too.
    FailedRollbackFailed,
    /// Failed after changing the clone, with nothing to restore from.
    FailedNoBackup,
}

impl StageResult {
    pub fn label(&self) -> &'static str {
        match self {
            StageResult::NotAttempted => "NOT_ATTEMPTED",
            StageResult::Skipped => "SKIPPED",
            StageResult::DryRun => "DRY_RUN",
            StageResult::Success => "SUCCESS",
            StageResult::Failed => "FAILED",
            StageResult::FailedRolledBack => "FAILED_ROLLED_BACK",
            StageResult::FailedRollbackFailed => "FAILED_ROLLBACK_FAILED",
            StageResult::FailedNoBackup => "FAILED_NO_BACKUP",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StageResult::Failed
                | StageResult::FailedRolledBack
                | StageResult::FailedRollbackFailed
                | StageResult::FailedNoBackup
        )
    }
}

impl fmt::Display for StageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One result per stage.
///
/// Every stage starts as [`StageResult::NotAttempted`] and is recorded exactly
/// once. The only later change allowed is the rollback manager refining
/// [`StageResult::Failed`] into one of the other failure values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResults {
    results: BTreeMap<StageId, StageResult>,
}

impl Default for StageResults {
    fn default() -> StageResults {
        StageResults {
            results: StageId::ALL
                .into_iter()
                .map(|id| (id, StageResult::NotAttempted))
                .collect(),
        }
    }
}

impl StageResults {
    pub fn get(&self, stage: StageId) -> StageResult {
        self.results
            .get(&stage)
            .copied()
            .unwrap_or(StageResult::NotAttempted)
    }

    pub fn iter(&self) -> impl Iterator<Item = (StageId, StageResult)> + '_ {
        self.results.iter().map(|(id, result)| (*id, *result))
    }

    /// Records the terminal result of `stage`. Returns false, leaving the
    /// existing result in place, if `stage` was already recorded.
    pub(crate) fn record(&mut self, stage: StageId, result: StageResult) -> bool {
        match self.results.get_mut(&stage) {
            Some(current @ StageResult::NotAttempted) if result != StageResult::NotAttempted => {
                *current = result;
                true
            }
            _ => false,
        }
    }

    /// Refines a plain failure with the outcome of its rollback.
    pub(crate) fn refine(&mut self, stage: StageId, result: StageResult) -> bool {
        match self.results.get_mut(&stage) {
            Some(current @ StageResult::Failed)
                if result.is_failure() && result != StageResult::Failed =>
            {
                *current = result;
                true
            }
            _ => false,
        }
    }

    pub fn any_failed(&self) -> bool {
        self.results.values().any(StageResult::is_failure)
    }
}

/// What a stage needs from the outside world.
pub struct StageEnv<'a> {
    pub config: &'a RunConfiguration,
    pub services: &'a Services,
    pub prompter: &'a dyn Prompter,
}

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    /// Whether running the stage changes the clone.
    fn is_destructive(&self) -> bool {
        true
    }

    /// Runs the stage, returning [`StageResult::Success`] or
    /// [`StageResult::DryRun`]. A stage that changes anything must call
    /// [`RunContext::mark_mutated`] before its first change.
    async fn run(&self, ctx: &mut RunContext, env: &StageEnv<'_>) -> anyhow::Result<StageResult>;
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// The production pipeline, in its fixed order.
    pub fn standard() -> Pipeline {
        Pipeline::new(vec![
            Box::new(stages::storage::StorageStage),
            Box::new(stages::database::DatabaseStage),
            Box::new(stages::files::FilesStage),
            Box::new(stages::search_index::SearchIndexStage),
            Box::new(stages::aux_processor::AuxProcessorStage),
            Box::new(stages::tuning::TuningStage),
            Box::new(stages::integrations::IntegrationsStage),
            Box::new(stages::post_setup::PostSetupStage),
        ])
    }

    pub fn new(stages: Vec<Box<dyn Stage>>) -> Pipeline {
        Pipeline { stages }
    }

    /// Runs every stage not skipped by flag, halting at the first failure.
    pub async fn run(&self, ctx: &mut RunContext, env: &StageEnv<'_>) -> Result<(), SyncError> {
        for stage in &self.stages {
            let id = stage.id();
            if ctx.flags().is_skipped(id) {
                info!("{id}: skipped");
                ctx.record(id, StageResult::Skipped);
                continue;
            }

            info!("{id}: starting");
            match stage.run(ctx, env).await {
                Ok(result) => {
                    info!("{id}: {result}");
                    ctx.record(id, result);
                }
                Err(err) => {
                    error!("{id}: failed: {err:#}");
                    ctx.record(id, StageResult::Failed);
                    if !ctx.flags().dry_run && (stage.is_destructive() || ctx.any_mutated()) {
                        rollback::roll_back_failure(ctx, env, FailurePoint::Stage(id)).await;
                    }
                    return Err(SyncError::Stage {
                        stage: id,
                        source: err,
                    });
                }
            }
        }
        Ok(())
    }
}
