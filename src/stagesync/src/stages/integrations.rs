// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Replaces the clone's external integrations with production's.

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use crate::context::RunContext;
use crate::pipeline::{Stage, StageEnv, StageId, StageResult};
use crate::services::Integration;

pub struct IntegrationsStage;

#[async_trait]
impl Stage for IntegrationsStage {
    fn id(&self) -> StageId {
        StageId::ExternalIntegrations
    }

    async fn run(&self, ctx: &mut RunContext, env: &StageEnv<'_>) -> anyhow::Result<StageResult> {
        let registry = &env.services.integrations;
        let production = env
            .services
            .production
            .integrations()
            .await
            .context("listing production integrations")?;
        let local = registry.list().await.context("listing local integrations")?;

        if ctx.flags().dry_run {
            info!(
                "would replace {} local integration(s) with {} from production",
                local.len(),
                production.len()
            );
            return Ok(StageResult::DryRun);
        }

        ctx.mark_mutated(StageId::ExternalIntegrations);
        for integration in &local {
            if let Some(id) = integration.id {
                registry
                    .remove(id)
                    .await
                    .with_context(|| format!("removing {}", integration.display_name))?;
            }
        }
        let mut registered = 0;
        for integration in production {
            let integration = Integration {
                id: None,
                ..integration
            };
            match registry.register(&integration).await {
                Ok(()) => registered += 1,
                Err(e) => ctx.warn(format!(
                    "failed to register integration {}: {e:#}",
                    integration.display_name
                )),
            }
        }
        info!("registered {registered} integration(s)");
        Ok(StageResult::Success)
    }
}
