// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Access to the application's persisted settings table.
//!
//! The table holds one row per `(name, lang)`; only language-neutral rows
//! (`lang IS NULL`) are managed here.

use std::collections::BTreeMap;

use crate::{Config, PostgresError};

/// Reads every language-neutral setting.
pub async fn list_settings(config: &Config) -> Result<BTreeMap<String, String>, PostgresError> {
    let client = config.connect("postgres_list_settings").await?;
    let rows = client
        .query(
            "SELECT name, content FROM setting WHERE lang IS NULL ORDER BY name",
            &[],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let name: String = row.get("name");
            let content: Option<String> = row.get("content");
            (name, content.unwrap_or_default())
        })
        .collect())
}

/// Sets `name` to `content`, replacing any existing language-neutral row.
pub async fn set_setting(config: &Config, name: &str, content: &str) -> Result<(), PostgresError> {
    let mut client = config.connect("postgres_set_setting").await?;
    let txn = client.transaction().await?;
    txn.execute(
        "DELETE FROM setting WHERE name = $1 AND lang IS NULL",
        &[&name],
    )
    .await?;
    txn.execute(
        "INSERT INTO setting (name, content) VALUES ($1, $2)",
        &[&name, &content],
    )
    .await?;
    txn.commit().await?;
    Ok(())
}

/// Deletes `name`. Returns whether a row was removed.
pub async fn delete_setting(config: &Config, name: &str) -> Result<bool, PostgresError> {
    let client = config.connect("postgres_delete_setting").await?;
    let deleted = client
        .execute(
            "DELETE FROM setting WHERE name = $1 AND lang IS NULL",
            &[&name],
        )
        .await?;
    Ok(deleted > 0)
}
