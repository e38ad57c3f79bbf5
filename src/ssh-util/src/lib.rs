// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! SSH utilities for reaching the production host.
//!
//! Remote commands are described by [`command::RemoteCommand`], a typed
//! builder whose arguments are escaped by the SSH layer rather than spliced
//! into a shell string. File transfers go through [`transfer::fetch`], which
//! tries `rsync` first and falls back to `scp` exactly once.

pub mod command;
pub mod session;
pub mod transfer;

use std::fmt;

/// Identifies an SSH destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// The remote login user.
    pub user: String,
    /// The remote hostname or address.
    pub host: String,
    /// The remote SSH port.
    pub port: u16,
}

impl SshTarget {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> SshTarget {
        SshTarget {
            user: user.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Errors returned by SSH operations.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("failed to open ssh session to {target}")]
    Connect {
        target: String,
        #[source]
        source: openssh::Error,
    },
    #[error("failed to run remote command `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: openssh::Error,
    },
    #[error("remote command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("{method} transfer of {source_path} failed: {detail}")]
    Transfer {
        method: transfer::TransferMethod,
        source_path: String,
        detail: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
