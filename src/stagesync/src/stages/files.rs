// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Copies production's bulk file store.
//!
//! Without `--full-copy`, files above `FILE_SIZE_LIMIT_MB` are left behind.

use anyhow::Context;
use async_trait::async_trait;
use stagesync_ssh_util::transfer::TransferMethod;
use tracing::info;

use crate::context::RunContext;
use crate::pipeline::{Stage, StageEnv, StageId, StageResult};
use crate::stages::{absorb, ensure_remote_path};

pub struct FilesStage;

#[async_trait]
impl Stage for FilesStage {
    fn id(&self) -> StageId {
        StageId::Files
    }

    async fn run(&self, ctx: &mut RunContext, env: &StageEnv<'_>) -> anyhow::Result<StageResult> {
        let remote = env.config.production_content_dir();
        let local = env.config.content_dir();
        ensure_remote_path(env, "PRODUCTION_CONTENT_DIR", &remote).await?;

        let limit = (!ctx.flags().full_copy).then(|| env.config.file_size_limit_bytes());
        if ctx.flags().dry_run {
            info!(
                "would copy {} to {} ({})",
                remote.display(),
                local.display(),
                match limit {
                    Some(bytes) => format!("skipping files over {bytes} bytes"),
                    None => "full copy".to_string(),
                }
            );
            return Ok(StageResult::DryRun);
        }

        ctx.mark_mutated(StageId::Files);
        let fetched = env
            .services
            .production
            .fetch_tree(&remote, &local, limit)
            .await
            .context("copying production files")?;
        let method = fetched.method;
        absorb(ctx, fetched);
        if let Some(bytes) = limit {
            if method == TransferMethod::Scp {
                ctx.warn(format!(
                    "scp fallback cannot skip large files; files over {bytes} bytes were copied too"
                ));
            } else {
                info!("files over {bytes} bytes were not copied; use --full-copy to include them");
            }
        }

        env.services
            .app_server
            .take_ownership(&local)
            .await
            .context("handing copied files to the service account")?;
        Ok(StageResult::Success)
    }
}
