// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Copies the search index configuration (schema and friends).

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use crate::context::RunContext;
use crate::pipeline::{Stage, StageEnv, StageId, StageResult};
use crate::stages::{absorb, ensure_remote_path};

pub struct SearchIndexStage;

#[async_trait]
impl Stage for SearchIndexStage {
    fn id(&self) -> StageId {
        StageId::SearchIndex
    }

    async fn run(&self, ctx: &mut RunContext, env: &StageEnv<'_>) -> anyhow::Result<StageResult> {
        let remote = env.config.production_search_conf_dir();
        let local = env.config.search_conf_dir();
        ensure_remote_path(env, "PRODUCTION_SEARCH_CONF_DIR", &remote).await?;
        if ctx.flags().dry_run {
            info!("would copy {} to {}", remote.display(), local.display());
            return Ok(StageResult::DryRun);
        }

        ctx.mark_mutated(StageId::SearchIndex);
        let fetched = env
            .services
            .production
            .fetch_tree(&remote, &local, None)
            .await
            .context("copying search index configuration")?;
        absorb(ctx, fetched);
        env.services
            .search
            .restart()
            .await
            .context("restarting search index")?;
        Ok(StageResult::Success)
    }
}
