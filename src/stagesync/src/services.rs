// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The opaque systems a run talks to.
//!
//! Stages only see these traits. [`crate::host`] implements them over SSH,
//! PostgreSQL, the application server's admin CLI and its HTTP admin API.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagesync_ssh_util::transfer::TransferMethod;

use crate::tuning::TuningParameter;

/// The outcome of copying something off the production host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub method: TransferMethod,
    /// Degraded conditions hit along the way, for the run summary.
    pub warnings: Vec<String>,
}

impl Fetched {
    pub fn new(method: TransferMethod) -> Fetched {
        Fetched {
            method,
            warnings: Vec::new(),
        }
    }
}

/// An externally registered integration (an "external tool" manifest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(rename = "displayName")]
    pub display_name: String,
    /// The remaining manifest fields, passed through untouched.
    #[serde(flatten)]
    pub manifest: serde_json::Map<String, serde_json::Value>,
}

/// Progress of a search index rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStatus {
    /// Objects present in the database but stale in or missing from the index.
    pub stale: u64,
}

impl IndexStatus {
    pub fn is_complete(&self) -> bool {
        self.stale == 0
    }
}

/// The production host. Every operation is read-only on production.
#[async_trait]
pub trait Production: Send + Sync {
    /// The application's persisted settings.
    async fn settings(&self) -> anyhow::Result<BTreeMap<String, String>>;

    /// The running application server's tuning parameters.
    async fn tuning_parameters(&self) -> anyhow::Result<Vec<TuningParameter>>;

    /// Dumps the production database and copies the dump to `local`.
    async fn fetch_database_dump(&self, local: &Path) -> anyhow::Result<Fetched>;

    async fn path_exists(&self, path: &Path) -> anyhow::Result<bool>;

    /// Copies the contents of the remote directory `remote` into `local`,
    /// skipping files larger than `max_file_size` bytes where possible.
    async fn fetch_tree(
        &self,
        remote: &Path,
        local: &Path,
        max_file_size: Option<u64>,
    ) -> anyhow::Result<Fetched>;

    async fn integrations(&self) -> anyhow::Result<Vec<Integration>>;

    async fn app_version(&self) -> anyhow::Result<String>;
}

/// The clone's relational database.
#[async_trait]
pub trait LocalDatabase: Send + Sync {
    /// The on-disk size of the database in bytes.
    async fn size_bytes(&self) -> anyhow::Result<u64>;

    /// Writes a portable, restartable dump to `path`.
    async fn dump(&self, path: &Path) -> anyhow::Result<()>;

    /// Checks that `path` holds a dump this database can restore.
    async fn validate_dump(&self, path: &Path) -> anyhow::Result<()>;

    /// Replaces the database contents with the dump at `path`.
    async fn restore(&self, path: &Path) -> anyhow::Result<()>;

    async fn settings(&self) -> anyhow::Result<BTreeMap<String, String>>;

    async fn set_setting(&self, name: &str, value: &str) -> anyhow::Result<()>;

    /// Returns whether the setting existed.
    async fn delete_setting(&self, name: &str) -> anyhow::Result<bool>;

    async fn row_counts(&self) -> anyhow::Result<BTreeMap<String, i64>>;

    /// Runs a trusted SQL script.
    async fn apply_sql(&self, sql: &str) -> anyhow::Result<()>;
}

/// The clone's application server.
#[async_trait]
pub trait AppServer: Send + Sync {
    async fn tuning_parameters(&self) -> anyhow::Result<Vec<TuningParameter>>;

    async fn create_tuning_parameter(&self, parameter: &TuningParameter) -> anyhow::Result<()>;

    async fn delete_tuning_parameter(&self, parameter: &TuningParameter) -> anyhow::Result<()>;

    async fn restart(&self) -> anyhow::Result<()>;

    /// Whether the application answers requests. Never fails.
    async fn is_ready(&self) -> bool;

    async fn version(&self) -> anyhow::Result<String>;

    /// Hands a synchronized directory tree to the service account.
    async fn take_ownership(&self, path: &Path) -> anyhow::Result<()>;
}

/// The clone's search index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn restart(&self) -> anyhow::Result<()>;

    async fn clear(&self) -> anyhow::Result<()>;

    /// Starts an asynchronous rebuild of the whole index.
    async fn start_rebuild(&self) -> anyhow::Result<()>;

    async fn status(&self) -> anyhow::Result<IndexStatus>;
}

/// The clone's registry of external integrations.
#[async_trait]
pub trait IntegrationRegistry: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<Integration>>;

    async fn register(&self, integration: &Integration) -> anyhow::Result<()>;

    async fn remove(&self, id: i64) -> anyhow::Result<()>;
}

/// Every service a run uses.
pub struct Services {
    pub production: Box<dyn Production>,
    pub database: Box<dyn LocalDatabase>,
    pub app_server: Box<dyn AppServer>,
    pub search: Box<dyn SearchIndex>,
    pub integrations: Box<dyn IntegrationRegistry>,
}
