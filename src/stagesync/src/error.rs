// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use crate::backup::BackupError;
use crate::config::ConfigError;
use crate::lock::LockError;
use crate::pipeline::StageId;
use crate::safety::SafetyError;

/// Errors that end a run with a non-zero exit code.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    /// A pipeline stage failed; the summary holds the rollback outcome.
    #[error("stage {stage} failed")]
    Stage {
        stage: StageId,
        #[source]
        source: anyhow::Error,
    },
    /// Restoring a backup in restore mode did not fully succeed.
    #[error("restore incomplete: {0}")]
    Restore(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
