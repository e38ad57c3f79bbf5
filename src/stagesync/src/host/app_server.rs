// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The clone's application server, driven through its admin CLI and systemd.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use crate::host::http_api::{self, ApiClient};
use crate::services::AppServer;
use crate::tuning::{self, TuningParameter};

/// One invocation of the application server's admin CLI.
///
/// Options are passed as single arguments. The CLI splits option lists on
/// `:`, so colons inside an option are escaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    ListTuningParameters,
    CreateTuningParameter(TuningParameter),
    DeleteTuningParameter(TuningParameter),
    Version,
}

impl AdminCommand {
    pub fn args(&self) -> Vec<String> {
        match self {
            AdminCommand::ListTuningParameters => vec!["list-jvm-options".into()],
            AdminCommand::CreateTuningParameter(p) => {
                vec!["create-jvm-options".into(), escape_option(p.option())]
            }
            AdminCommand::DeleteTuningParameter(p) => {
                vec!["delete-jvm-options".into(), escape_option(p.option())]
            }
            AdminCommand::Version => vec!["version".into(), "--local".into()],
        }
    }
}

fn escape_option(option: &str) -> String {
    option.replace(':', r"\:")
}

/// Runs a local program and returns its stdout, failing on a non-zero exit.
pub(crate) async fn run_local(mut cmd: Command, what: &str) -> anyhow::Result<String> {
    debug!("running {what}");
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to start {what}"))?;
    if !output.status.success() {
        bail!(
            "{what} exited with status {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub struct LocalAppServer {
    asadmin: PathBuf,
    service_user: String,
    service_name: String,
    api: ApiClient,
}

impl LocalAppServer {
    pub fn new(
        appserver_dir: &Path,
        service_user: &str,
        service_name: &str,
        base_url: Url,
    ) -> anyhow::Result<LocalAppServer> {
        Ok(LocalAppServer {
            asadmin: appserver_dir.join("bin/asadmin"),
            service_user: service_user.to_string(),
            service_name: service_name.to_string(),
            api: ApiClient::new(base_url, Duration::from_secs(10))?,
        })
    }

    async fn admin(&self, command: AdminCommand) -> anyhow::Result<String> {
        let mut cmd = Command::new("sudo");
        cmd.arg("-u")
            .arg(&self.service_user)
            .arg("--")
            .arg(&self.asadmin)
            .args(command.args());
        run_local(cmd, &format!("asadmin {}", command.args()[0])).await
    }
}

#[async_trait]
impl AppServer for LocalAppServer {
    async fn tuning_parameters(&self) -> anyhow::Result<Vec<TuningParameter>> {
        let listing = self.admin(AdminCommand::ListTuningParameters).await?;
        Ok(tuning::parse_listing(&listing))
    }

    async fn create_tuning_parameter(&self, parameter: &TuningParameter) -> anyhow::Result<()> {
        self.admin(AdminCommand::CreateTuningParameter(parameter.clone()))
            .await?;
        Ok(())
    }

    async fn delete_tuning_parameter(&self, parameter: &TuningParameter) -> anyhow::Result<()> {
        self.admin(AdminCommand::DeleteTuningParameter(parameter.clone()))
            .await?;
        Ok(())
    }

    async fn restart(&self) -> anyhow::Result<()> {
        let mut cmd = Command::new("systemctl");
        cmd.arg("restart").arg(&self.service_name);
        run_local(cmd, &format!("systemctl restart {}", self.service_name)).await?;
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        match self.api.get(http_api::VERSION_PATH).await {
            Ok(_) => true,
            Err(e) => {
                debug!("application not ready: {e:#}");
                false
            }
        }
    }

    async fn version(&self) -> anyhow::Result<String> {
        let data = self.api.get(http_api::VERSION_PATH).await?;
        http_api::parse_version(&data)
    }

    async fn take_ownership(&self, path: &Path) -> anyhow::Result<()> {
        let mut cmd = Command::new("chown");
        cmd.arg("-R")
            .arg(format!("{0}:{0}", self.service_user))
            .arg(path);
        run_local(cmd, &format!("chown {}", path.display())).await?;
        Ok(())
    }
}
