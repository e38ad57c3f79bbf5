// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The pipeline stages, in pipeline order.

use std::path::Path;

use anyhow::{Context, bail};

use crate::context::RunContext;
use crate::pipeline::StageEnv;
use crate::services::Fetched;

pub mod aux_processor;
pub mod database;
pub mod files;
pub mod integrations;
pub mod post_setup;
pub mod search_index;
pub mod storage;
pub mod tuning;

/// Confirms that `path`, configured under `key`, exists on production.
///
/// Paths substituted from their local counterpart are only a guess, so a
/// missing one points the operator at the key to set.
pub(crate) async fn ensure_remote_path(
    env: &StageEnv<'_>,
    key: &str,
    path: &Path,
) -> anyhow::Result<()> {
    let exists = env
        .services
        .production
        .path_exists(path)
        .await
        .with_context(|| format!("checking {} on production", path.display()))?;
    if exists {
        return Ok(());
    }
    if env.config.is_provisional(key) {
        bail!(
            "{} does not exist on production; {key} is unset and defaulted to the local path, \
             set it explicitly",
            path.display()
        );
    }
    bail!("{} ({key}) does not exist on production", path.display())
}

/// Moves the warnings of a transfer into the run summary.
pub(crate) fn absorb(ctx: &mut RunContext, fetched: Fetched) {
    for warning in fetched.warnings {
        ctx.warn(warning);
    }
}
