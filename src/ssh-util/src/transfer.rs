// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Copying files from a remote host.
//!
//! Transfers run `rsync` over SSH. If that fails, the same transfer is retried
//! once with `scp`. `scp` cannot skip large files, so callers that asked for a
//! size limit learn from the returned [`TransferMethod`] that it was not
//! honored.

use std::ffi::OsString;
use std::fmt;
use std::path::Path;

use tokio::process::Command;
use tracing::{info, warn};

use crate::command::CommandOutput;
use crate::{SshError, SshTarget};

/// The tool that completed a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMethod {
    Rsync,
    Scp,
}

impl fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMethod::Rsync => f.write_str("rsync"),
            TransferMethod::Scp => f.write_str("scp"),
        }
    }
}

/// Options for a single transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Copy the contents of the remote directory into the local directory
    /// rather than a single file.
    pub directory: bool,
    /// Skip files larger than this many bytes. Only honored by rsync.
    pub max_file_size: Option<u64>,
}

impl TransferOptions {
    pub fn file() -> TransferOptions {
        TransferOptions::default()
    }

    pub fn directory() -> TransferOptions {
        TransferOptions {
            directory: true,
            ..Default::default()
        }
    }

    pub fn max_file_size(mut self, bytes: Option<u64>) -> TransferOptions {
        self.max_file_size = bytes;
        self
    }
}

/// Copies `remote` on `target` to `local`, returning the method that succeeded.
pub async fn fetch(
    target: &SshTarget,
    remote: &Path,
    local: &Path,
    options: &TransferOptions,
) -> Result<TransferMethod, SshError> {
    if options.directory {
        tokio::fs::create_dir_all(local).await?;
    }
    let rsync = rsync_args(target, remote, local, options);
    match run_local("rsync", rsync).await {
        Ok(_) => return Ok(TransferMethod::Rsync),
        Err(detail) => {
            warn!(
                "rsync of {}:{} failed, falling back to scp: {detail}",
                target.host,
                remote.display()
            );
        }
    }

    let scp = scp_args(target, remote, local, options);
    match run_local("scp", scp).await {
        Ok(_) => {
            info!("scp fallback completed for {}", remote.display());
            Ok(TransferMethod::Scp)
        }
        Err(detail) => Err(SshError::Transfer {
            method: TransferMethod::Scp,
            source_path: format!("{}:{}", target.host, remote.display()),
            detail,
        }),
    }
}

fn ssh_command(target: &SshTarget) -> String {
    format!("ssh -p {} -o BatchMode=yes", target.port)
}

fn remote_arg(target: &SshTarget, remote: &Path, suffix: &str) -> OsString {
    let mut arg = OsString::from(format!("{target}:"));
    arg.push(remote.as_os_str());
    arg.push(suffix);
    arg
}

pub(crate) fn rsync_args(
    target: &SshTarget,
    remote: &Path,
    local: &Path,
    options: &TransferOptions,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--archive".into(),
        "--partial".into(),
        "--protect-args".into(),
        "-e".into(),
        ssh_command(target).into(),
    ];
    if let Some(bytes) = options.max_file_size {
        args.push(format!("--max-size={bytes}").into());
    }
    if options.directory {
        args.push(remote_arg(target, remote, "/"));
        let mut dest = local.as_os_str().to_owned();
        dest.push("/");
        args.push(dest);
    } else {
        args.push(remote_arg(target, remote, ""));
        args.push(local.as_os_str().to_owned());
    }
    args
}

pub(crate) fn scp_args(
    target: &SshTarget,
    remote: &Path,
    local: &Path,
    options: &TransferOptions,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-p".into(),
        "-B".into(),
        "-P".into(),
        target.port.to_string().into(),
    ];
    if options.directory {
        args.push("-r".into());
        args.push(remote_arg(target, remote, "/."));
    } else {
        args.push(remote_arg(target, remote, ""));
    }
    args.push(local.as_os_str().to_owned());
    args
}

async fn run_local(program: &str, args: Vec<OsString>) -> Result<CommandOutput, String> {
    let output = Command::new(program)
        .args(&args)
        .output()
        .await
        .map_err(|e| format!("failed to start {program}: {e}"))?;
    let output = CommandOutput::from_process(output);
    if output.success() {
        Ok(output)
    } else {
        Err(format!(
            "{program} exited with status {}: {}",
            output.status,
            output.stderr.trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn target() -> SshTarget {
        SshTarget::new("deploy", "prod.example.org", 2222)
    }

    #[test]
    fn rsync_directory_transfer_uses_trailing_slashes() {
        let args = rsync_args(
            &target(),
            &PathBuf::from("/srv/files"),
            &PathBuf::from("/data/files"),
            &TransferOptions::directory().max_file_size(Some(1024)),
        );
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.contains(&"--max-size=1024".to_string()));
        assert!(args.contains(&"ssh -p 2222 -o BatchMode=yes".to_string()));
        assert_eq!(args[args.len() - 2], "deploy@prod.example.org:/srv/files/");
        assert_eq!(args[args.len() - 1], "/data/files/");
    }

    #[test]
    fn rsync_file_transfer_args() {
        let args = rsync_args(
            &target(),
            &PathBuf::from("/tmp/db.dump"),
            &PathBuf::from("/backup/db.dump"),
            &TransferOptions::file(),
        );
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "--archive",
                "--partial",
                "--protect-args",
                "-e",
                "ssh -p 2222 -o BatchMode=yes",
                "deploy@prod.example.org:/tmp/db.dump",
                "/backup/db.dump"
            ]
        );
    }

    #[test]
    fn scp_ignores_size_limit() {
        let args = scp_args(
            &target(),
            &PathBuf::from("/tmp/db.dump"),
            &PathBuf::from("/backup/db.dump"),
            &TransferOptions::file().max_file_size(Some(1024)),
        );
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "-p",
                "-B",
                "-P",
                "2222",
                "deploy@prod.example.org:/tmp/db.dump",
                "/backup/db.dump"
            ]
        );
    }
}
