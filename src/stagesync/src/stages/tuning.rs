// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Reconciles the clone's tuning parameters with production's.
//!
//! See [`crate::tuning`] for the two phases. Every question is asked before
//! the dry-run check so a dry run prompts exactly like a live one.

use anyhow::Context;
use async_trait::async_trait;
use itertools::Itertools;
use tracing::info;

use crate::context::RunContext;
use crate::pipeline::{Stage, StageEnv, StageId, StageResult};
use crate::prompt;
use crate::storage;
use crate::tuning::{self, DuplicateKey, ParameterChange};

pub struct TuningStage;

fn duplicate_warning(host: &str, duplicate: &DuplicateKey) -> String {
    format!(
        "{host} binds tuning parameter {} {} times: {}",
        duplicate.key,
        duplicate.options.len(),
        duplicate.options.iter().join(" ")
    )
}

#[async_trait]
impl Stage for TuningStage {
    fn id(&self) -> StageId {
        StageId::TuningParameters
    }

    async fn run(&self, ctx: &mut RunContext, env: &StageEnv<'_>) -> anyhow::Result<StageResult> {
        let app_server = &env.services.app_server;
        let production = env
            .services
            .production
            .tuning_parameters()
            .await
            .context("reading production tuning parameters")?;
        let local = app_server
            .tuning_parameters()
            .await
            .context("reading local tuning parameters")?;

        let production_duplicates = tuning::find_duplicates(&production);
        let local_duplicates = tuning::find_duplicates(&local);
        for duplicate in &production_duplicates {
            ctx.warn(duplicate_warning("production", duplicate));
        }
        for duplicate in &local_duplicates {
            ctx.warn(duplicate_warning("the clone", duplicate));
        }
        let findings = ctx.findings_mut();
        findings.production_parameters = production.clone();
        findings.local_parameters = local.clone();
        findings.production_duplicates = production_duplicates;
        findings.local_duplicates = local_duplicates;

        let mut changes: Vec<_> = tuning::missing_generic(&production, &local)
            .into_iter()
            .map(ParameterChange::Create)
            .collect();

        match ctx.storage_choice().cloned() {
            Some(choice) => {
                let candidates = storage::removal_candidates(&choice, &local);
                let remove = !candidates.is_empty()
                    && prompt::confirm(env.prompter, &storage::removal_request(&candidates))?;
                let remaining: Vec<_> = if remove {
                    changes.extend(candidates.iter().cloned().map(ParameterChange::Delete));
                    local.iter().filter(|p| !candidates.contains(p)).cloned().collect()
                } else {
                    if !candidates.is_empty() {
                        ctx.warn(format!(
                            "kept {} storage-related tuning parameter(s) on a clone that uses the \
                             local filesystem: {}",
                            candidates.len(),
                            candidates.iter().join(" ")
                        ));
                        ctx.findings_mut().retained_parameters = candidates;
                    }
                    local.clone()
                };
                let desired = storage::desired_parameters(&choice, &production);
                changes.extend(tuning::overwrite_plan(&remaining, &desired));
            }
            None => ctx.warn("storage choice unresolved; storage-related tuning parameters left as is"),
        }

        if ctx.flags().dry_run {
            for change in &changes {
                info!("would {change}");
            }
            return Ok(StageResult::DryRun);
        }
        if changes.is_empty() {
            info!("tuning parameters already reconciled");
            return Ok(StageResult::Success);
        }

        ctx.mark_mutated(StageId::TuningParameters);
        for change in &changes {
            info!("{change}");
            match change {
                ParameterChange::Create(p) => app_server
                    .create_tuning_parameter(p)
                    .await
                    .with_context(|| format!("creating {p}"))?,
                ParameterChange::Delete(p) => app_server
                    .delete_tuning_parameter(p)
                    .await
                    .with_context(|| format!("deleting {p}"))?,
            }
        }

        match app_server.tuning_parameters().await {
            Ok(parameters) => ctx.findings_mut().local_parameters = parameters,
            Err(e) => ctx.warn(format!("failed to re-read local tuning parameters: {e:#}")),
        }
        Ok(StageResult::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::TuningParameter;

    #[test]
    fn duplicate_warning_masks_secrets() {
        let parameters = [
            "-Ddataverse.files.s3.secret-key=first",
            "-Ddataverse.files.s3.secret-key=second",
        ]
        .map(|option| TuningParameter::parse(option).unwrap());
        let duplicates = tuning::find_duplicates(&parameters);
        let warning = duplicate_warning("production", &duplicates[0]);
        assert_eq!(
            warning,
            "production binds tuning parameter dataverse.files.s3.secret-key 2 times: \
             -Ddataverse.files.s3.secret-key=******** -Ddataverse.files.s3.secret-key=********"
        );
    }
}
