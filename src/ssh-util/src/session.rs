// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A multiplexed SSH session to a single remote host.

use std::time::Duration;

use openssh::{KnownHosts, Session, SessionBuilder};
use tracing::debug;

use crate::command::{CommandOutput, RemoteCommand};
use crate::{SshError, SshTarget};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// An open SSH session.
///
/// All remote commands issued during a run share this one master connection.
#[derive(Debug)]
pub struct RemoteSession {
    target: SshTarget,
    session: Session,
}

impl RemoteSession {
    /// Connects to `target`, requiring the host key to already be known.
    pub async fn connect(target: &SshTarget) -> Result<RemoteSession, SshError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(target.user.clone())
            .port(target.port)
            .known_hosts_check(KnownHosts::Strict)
            .connect_timeout(CONNECT_TIMEOUT);
        let session =
            builder
                .connect_mux(&target.host)
                .await
                .map_err(|source| SshError::Connect {
                    target: target.to_string(),
                    source,
                })?;
        debug!("opened ssh session to {target}");
        Ok(RemoteSession {
            target: target.clone(),
            session,
        })
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Runs `command` and captures its output regardless of exit status.
    pub async fn output(&self, command: &RemoteCommand) -> Result<CommandOutput, SshError> {
        let words = command.words();
        let (program, args) = words.split_first().expect("program is always present");
        let mut cmd = self.session.command(program.as_str());
        for arg in args {
            cmd.arg(arg);
        }
        debug!("{}: running {command}", self.target.host);
        let output = cmd.output().await.map_err(|source| SshError::Spawn {
            command: command.to_string(),
            source,
        })?;
        Ok(CommandOutput::from_process(output))
    }

    /// Runs `command`, failing unless it exits successfully.
    pub async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, SshError> {
        let output = self.output(command).await?;
        if !output.success() {
            return Err(SshError::CommandFailed {
                command: command.to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}
