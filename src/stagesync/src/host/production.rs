// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The production host, reached only over SSH.
//!
//! Nothing here writes to production except the temporary database dump,
//! which is removed once it has been copied.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use stagesync_postgres_util::Config;
use stagesync_ssh_util::SshTarget;
use stagesync_ssh_util::command::RemoteCommand;
use stagesync_ssh_util::session::RemoteSession;
use stagesync_ssh_util::transfer::{self, TransferOptions};
use tracing::info;

use crate::config::RunConfiguration;
use crate::host::app_server::AdminCommand;
use crate::host::http_api;
use crate::services::{Fetched, Integration, Production};
use crate::tuning::{self, TuningParameter};

const SETTINGS_QUERY: &str = "SELECT name, content FROM setting WHERE lang IS NULL ORDER BY name";

pub struct SshProduction {
    session: RemoteSession,
    database: Config,
    asadmin: PathBuf,
    service_user: String,
    api_base: String,
}

impl SshProduction {
    pub fn new(session: RemoteSession, config: &RunConfiguration) -> SshProduction {
        SshProduction {
            session,
            database: config.production_database(),
            asadmin: config.production_appserver_dir().join("bin/asadmin"),
            service_user: config.production_app_service_user().to_string(),
            api_base: config
                .production_app_base_url()
                .trim_end_matches('/')
                .to_string(),
        }
    }

    fn target(&self) -> &SshTarget {
        self.session.target()
    }

    fn with_database_env(&self, mut command: RemoteCommand) -> RemoteCommand {
        for (key, value) in self.database.tool_env() {
            command = command.env(key, value);
        }
        command
    }

    async fn api_get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let command = RemoteCommand::new("curl")
            .args(["--silent", "--show-error"])
            .arg(format!("{}{path}", self.api_base));
        let output = self.session.run(&command).await?;
        http_api::unwrap_envelope(&output.stdout)
            .with_context(|| format!("calling {path} on production"))
    }
}

/// Parses `psql` output with tab-separated fields and NUL-terminated records.
pub fn parse_settings(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .split('\0')
        .map(|record| record.trim_start_matches('\n'))
        .filter_map(|record| record.split_once('\t'))
        .map(|(name, content)| (name.to_string(), content.to_string()))
        .collect()
}

#[async_trait]
impl Production for SshProduction {
    async fn settings(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let command = RemoteCommand::new("psql")
            .args(self.database.tool_args())
            .args(["--no-align", "--tuples-only", "--field-separator=\t"])
            .args(["--record-separator-zero", "--dbname"])
            .arg(self.database.dbname.clone())
            .args(["--command", SETTINGS_QUERY]);
        let output = self
            .session
            .run(&self.with_database_env(command))
            .await
            .context("reading production settings")?;
        Ok(parse_settings(&output.stdout))
    }

    async fn tuning_parameters(&self) -> anyhow::Result<Vec<TuningParameter>> {
        let command = RemoteCommand::new(self.asadmin.display().to_string())
            .args(AdminCommand::ListTuningParameters.args())
            .run_as(self.service_user.clone());
        let output = self
            .session
            .run(&command)
            .await
            .context("listing production tuning parameters")?;
        Ok(tuning::parse_listing(&output.stdout))
    }

    async fn fetch_database_dump(&self, local: &Path) -> anyhow::Result<Fetched> {
        let remote = format!("/tmp/stagesync-{}.dump", std::process::id());
        let command = RemoteCommand::new("pg_dump")
            .args(self.database.tool_args())
            .args(["--format=custom", "--file"])
            .arg(remote.clone())
            .arg(self.database.dbname.clone());
        info!("dumping production database on {}", self.target().host);
        self.session
            .run(&self.with_database_env(command))
            .await
            .context("dumping production database")?;

        let copied = transfer::fetch(
            self.target(),
            Path::new(&remote),
            local,
            &TransferOptions::file(),
        )
        .await;
        let cleanup = self
            .session
            .run(&RemoteCommand::new("rm").args(["-f", "--"]).arg(remote.clone()))
            .await;
        let mut fetched = Fetched::new(copied.context("copying production dump")?);
        if let Err(e) = cleanup {
            fetched
                .warnings
                .push(format!("failed to remove {remote} on production: {e}"));
        }
        Ok(fetched)
    }

    async fn path_exists(&self, path: &Path) -> anyhow::Result<bool> {
        let command = RemoteCommand::new("test")
            .arg("-e")
            .arg(path.display().to_string());
        let output = self.session.output(&command).await?;
        Ok(output.success())
    }

    async fn fetch_tree(
        &self,
        remote: &Path,
        local: &Path,
        max_file_size: Option<u64>,
    ) -> anyhow::Result<Fetched> {
        let options = TransferOptions::directory().max_file_size(max_file_size);
        let method = transfer::fetch(self.target(), remote, local, &options).await?;
        Ok(Fetched::new(method))
    }

    async fn integrations(&self) -> anyhow::Result<Vec<Integration>> {
        http_api::parse_integrations(self.api_get(http_api::INTEGRATIONS_PATH).await?)
    }

    async fn app_version(&self) -> anyhow::Result<String> {
        http_api::parse_version(&self.api_get(http_api::VERSION_PATH).await?)
    }
}
