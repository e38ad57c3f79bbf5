// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use stagesync_postgres_util::{Config, dump, settings, stats};

use crate::services::LocalDatabase;

/// The clone's PostgreSQL database.
pub struct PostgresDatabase {
    config: Config,
}

impl PostgresDatabase {
    pub fn new(config: Config) -> PostgresDatabase {
        PostgresDatabase { config }
    }
}

#[async_trait]
impl LocalDatabase for PostgresDatabase {
    async fn size_bytes(&self) -> anyhow::Result<u64> {
        Ok(stats::database_size(&self.config).await?)
    }

    async fn dump(&self, path: &Path) -> anyhow::Result<()> {
        Ok(dump::dump_database(&self.config, path).await?)
    }

    async fn validate_dump(&self, path: &Path) -> anyhow::Result<()> {
        Ok(dump::validate_dump(path).await?)
    }

    async fn restore(&self, path: &Path) -> anyhow::Result<()> {
        Ok(dump::restore_database(&self.config, path).await?)
    }

    async fn settings(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(settings::list_settings(&self.config).await?)
    }

    async fn set_setting(&self, name: &str, value: &str) -> anyhow::Result<()> {
        Ok(settings::set_setting(&self.config, name, value).await?)
    }

    async fn delete_setting(&self, name: &str) -> anyhow::Result<bool> {
        Ok(settings::delete_setting(&self.config, name).await?)
    }

    async fn row_counts(&self) -> anyhow::Result<BTreeMap<String, i64>> {
        Ok(stats::table_row_counts(&self.config).await?)
    }

    async fn apply_sql(&self, sql: &str) -> anyhow::Result<()> {
        Ok(stagesync_postgres_util::execute_script(&self.config, sql).await?)
    }
}
