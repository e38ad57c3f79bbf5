// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Brings the clone up on its new data: restarts the application, waits for
//! it to answer and rebuilds the search index.
//!
//! Neither wait is fatal. A clone that is slow to come up is reported, not
//! rolled back.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::context::RunContext;
use crate::pipeline::{Stage, StageEnv, StageId, StageResult};
use crate::wait::{WaitOutcome, wait_until};

/// How often readiness and index progress are polled.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct PostSetupStage;

#[async_trait]
impl Stage for PostSetupStage {
    fn id(&self) -> StageId {
        StageId::PostSetup
    }

    async fn run(&self, ctx: &mut RunContext, env: &StageEnv<'_>) -> anyhow::Result<StageResult> {
        if ctx.flags().dry_run {
            info!("would restart the application server and rebuild the search index");
            return Ok(StageResult::DryRun);
        }

        let app_server = &env.services.app_server;
        let search = &env.services.search;
        ctx.mark_mutated(StageId::PostSetup);
        app_server
            .restart()
            .await
            .context("restarting application server")?;

        let timeout = env.config.readiness_timeout();
        match wait_until(move || app_server.is_ready(), POLL_INTERVAL, timeout).await {
            WaitOutcome::Ready { elapsed } => {
                info!("application ready after {}s", elapsed.as_secs())
            }
            WaitOutcome::TimedOut { .. } => {
                ctx.warn(format!(
                    "application not ready after {}s; continuing",
                    timeout.as_secs()
                ));
            }
        }

        search.clear().await.context("clearing search index")?;
        search
            .start_rebuild()
            .await
            .context("starting search index rebuild")?;
        let timeout = env.config.index_timeout();
        let outcome = wait_until(
            move || async move {
                match search.status().await {
                    Ok(status) => {
                        debug!("{} object(s) left to index", status.stale);
                        status.is_complete()
                    }
                    Err(e) => {
                        debug!("index status unavailable: {e:#}");
                        false
                    }
                }
            },
            POLL_INTERVAL,
            timeout,
        )
        .await;
        match outcome {
            WaitOutcome::Ready { elapsed } => {
                info!("search index rebuilt after {}s", elapsed.as_secs())
            }
            WaitOutcome::TimedOut { .. } => ctx.warn(format!(
                "search index rebuild still running after {}s; it continues in the background",
                timeout.as_secs()
            )),
        }
        Ok(StageResult::Success)
    }
}
