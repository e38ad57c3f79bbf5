// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Copies the auxiliary processor installation and points it at the clone.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::context::RunContext;
use crate::pipeline::{Stage, StageEnv, StageId, StageResult};
use crate::stages::{absorb, ensure_remote_path};

/// Extensions of the configuration files that may name the production host.
const CONFIG_EXTENSIONS: &[&str] = &["yaml", "yml", "json", "cfg", "conf", "properties"];

pub struct AuxProcessorStage;

#[async_trait]
impl Stage for AuxProcessorStage {
    fn id(&self) -> StageId {
        StageId::AuxiliaryProcessor
    }

    async fn run(&self, ctx: &mut RunContext, env: &StageEnv<'_>) -> anyhow::Result<StageResult> {
        let (Some(remote), Some(local)) = (
            env.config.production_aux_processor_dir(),
            env.config.aux_processor_dir(),
        ) else {
            info!("no auxiliary processor configured");
            return Ok(StageResult::Skipped);
        };
        ensure_remote_path(env, "PRODUCTION_AUX_PROCESSOR_DIR", &remote).await?;
        if ctx.flags().dry_run {
            info!("would copy {} to {}", remote.display(), local.display());
            return Ok(StageResult::DryRun);
        }

        ctx.mark_mutated(StageId::AuxiliaryProcessor);
        let fetched = env
            .services
            .production
            .fetch_tree(&remote, &local, None)
            .await
            .context("copying auxiliary processor")?;
        absorb(ctx, fetched);

        let rewritten = rewrite_host(&local, env.config.production_server(), env.config.local_server())
            .context("rewriting auxiliary processor configuration")?;
        info!(
            "pointed {} auxiliary processor configuration file(s) at {}",
            rewritten.len(),
            env.config.local_server()
        );
        env.services
            .app_server
            .take_ownership(&local)
            .await
            .context("handing auxiliary processor to the service account")?;
        Ok(StageResult::Success)
    }
}

/// Replaces `from` with `to` in every configuration file under `root`,
/// returning the files that changed. Files that are not UTF-8 are left alone.
pub fn rewrite_host(root: &Path, from: &str, to: &str) -> io::Result<Vec<PathBuf>> {
    let mut rewritten = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        let is_config = entry.file_type().is_file()
            && entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| CONFIG_EXTENSIONS.contains(&ext));
        if !is_config {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            debug!("{} is not text, skipped", entry.path().display());
            continue;
        };
        if text.contains(from) {
            std::fs::write(entry.path(), text.replace(from, to))?;
            rewritten.push(entry.path().to_path_buf());
        }
    }
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_only_configuration_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("conf")).unwrap();
        let yaml = dir.path().join("conf/processor.yaml");
        let script = dir.path().join("run.sh");
        std::fs::write(&yaml, "server: https://dataverse.example.org/api\n").unwrap();
        std::fs::write(&script, "curl https://dataverse.example.org\n").unwrap();

        let rewritten =
            rewrite_host(dir.path(), "dataverse.example.org", "staging.example.org").unwrap();
        assert_eq!(rewritten, vec![yaml.clone()]);
        assert_eq!(
            std::fs::read_to_string(&yaml).unwrap(),
            "server: https://staging.example.org/api\n"
        );
        assert!(std::fs::read_to_string(&script)
            .unwrap()
            .contains("dataverse.example.org"));
    }
}
