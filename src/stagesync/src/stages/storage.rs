// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Resolves the clone's [`StorageChoice`]. Changes nothing itself.

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use crate::context::RunContext;
use crate::pipeline::{Stage, StageEnv, StageId, StageResult};
use crate::storage::{self, StorageChoice};

pub struct StorageStage;

#[async_trait]
impl Stage for StorageStage {
    fn id(&self) -> StageId {
        StageId::Storage
    }

    fn is_destructive(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut RunContext, env: &StageEnv<'_>) -> anyhow::Result<StageResult> {
        let production = &env.services.production;
        let settings = production
            .settings()
            .await
            .context("reading production settings")?;
        let parameters = production
            .tuning_parameters()
            .await
            .context("reading production tuning parameters")?;

        let detection = storage::detect(&settings, &parameters);
        info!(
            "production {} object storage",
            if detection.uses_object_storage() {
                "uses"
            } else {
                "does not use"
            }
        );
        let findings = ctx.findings_mut();
        findings.production_uses_object_storage = Some(detection.uses_object_storage());
        findings.production_parameters = parameters;

        let choice = storage::resolve(&detection, env.prompter)?;
        info!("clone storage: {choice}");
        if choice == StorageChoice::InheritSource {
            ctx.warn("the clone shares production's storage configuration");
        }
        ctx.set_storage_choice(choice);

        Ok(if ctx.flags().dry_run {
            StageResult::DryRun
        } else {
            StageResult::Success
        })
    }
}
