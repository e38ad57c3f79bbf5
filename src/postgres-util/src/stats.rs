// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use crate::{Config, PostgresError, bail_generic, quote_ident};

/// Returns the on-disk size of the configured database in bytes.
pub async fn database_size(config: &Config) -> Result<u64, PostgresError> {
    let client = config.connect("postgres_database_size").await?;
    let row = client
        .query_one("SELECT pg_database_size(current_database())", &[])
        .await?;
    let size: i64 = row.get(0);
    match u64::try_from(size) {
        Ok(size) => Ok(size),
        Err(_) => bail_generic!("database reported negative size {}", size),
    }
}

/// Counts the rows of every user table, keyed by `schema.table`.
pub async fn table_row_counts(config: &Config) -> Result<BTreeMap<String, i64>, PostgresError> {
    let client = config.connect("postgres_table_row_counts").await?;
    let tables = client
        .query(
            "SELECT table_schema, table_name FROM information_schema.tables
             WHERE table_type = 'BASE TABLE'
             AND table_schema NOT IN ('pg_catalog', 'information_schema')
             ORDER BY table_schema, table_name",
            &[],
        )
        .await?;

    let mut counts = BTreeMap::new();
    for table in tables {
        let schema: String = table.get("table_schema");
        let name: String = table.get("table_name");
        // Identifiers cannot be bound as parameters; they are quoted instead.
        let query = format!(
            "SELECT count(*) FROM {}.{}",
            quote_ident(&schema),
            quote_ident(&name)
        );
        let row = client.query_one(&query, &[]).await?;
        counts.insert(format!("{schema}.{name}"), row.get::<_, i64>(0));
    }
    Ok(counts)
}

/// Returns the server version string, e.g. `16.2`.
pub async fn server_version(config: &Config) -> Result<String, PostgresError> {
    let client = config.connect("postgres_server_version").await?;
    let row = client.query_one("SHOW server_version", &[]).await?;
    Ok(row.get(0))
}
