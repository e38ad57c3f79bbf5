// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dumping and restoring whole databases with the PostgreSQL client tools.
//!
//! Dumps use the custom archive format, which `pg_restore` can replay
//! selectively and restart after interruption.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::{Config, PostgresError, bail_generic};

/// Every custom-format archive starts with these bytes.
pub const ARCHIVE_MAGIC: &[u8] = b"PGDMP";

/// Writes a custom-format dump of the configured database to `path`.
pub async fn dump_database(config: &Config, path: &Path) -> Result<(), PostgresError> {
    let mut cmd = tool_command("pg_dump", config);
    cmd.arg("--format=custom")
        .arg("--file")
        .arg(path)
        .arg(&config.dbname);
    run_tool("pg_dump", cmd).await
}

/// Replays the dump at `path` into the configured database, dropping the
/// objects it contains first.
pub async fn restore_database(config: &Config, path: &Path) -> Result<(), PostgresError> {
    let mut cmd = tool_command("pg_restore", config);
    cmd.arg("--clean")
        .arg("--if-exists")
        .arg("--no-owner")
        .arg("--no-privileges")
        .arg("--role")
        .arg(&config.user)
        .arg("--dbname")
        .arg(&config.dbname)
        .arg(path);
    run_tool("pg_restore", cmd).await
}

/// Checks that `path` is a readable custom-format archive.
pub async fn validate_dump(path: &Path) -> Result<(), PostgresError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut magic = [0u8; 5];
    if file.read_exact(&mut magic).await.is_err() || magic != ARCHIVE_MAGIC {
        bail_generic!("{} is not a PostgreSQL custom-format archive", path.display());
    }
    let mut cmd = Command::new("pg_restore");
    cmd.arg("--list").arg(path);
    run_tool("pg_restore", cmd).await
}

async fn run_tool(program: &'static str, mut cmd: Command) -> Result<(), PostgresError> {
    debug!("running {program}");
    let output = cmd
        .output()
        .await
        .map_err(|source| PostgresError::Spawn { program, source })?;
    if !output.status.success() {
        return Err(PostgresError::Tool {
            program,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Builds a client tool invocation connected to `config`. The password, if
/// any, travels through the environment rather than the argument list.
fn tool_command(program: &str, config: &Config) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(config.tool_args());
    for (key, value) in config.tool_env() {
        cmd.env(key, value);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validate_rejects_non_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.dump");
        tokio::fs::write(&path, b"this is not a dump").await.unwrap();
        let err = validate_dump(&path).await.unwrap_err();
        assert!(err.to_string().contains("not a PostgreSQL custom-format archive"));
    }

    #[tokio::test]
    async fn validate_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_dump(&dir.path().join("absent.dump"))
            .await
            .unwrap_err();
        assert!(matches!(err, PostgresError::Io(_)));
    }
}
