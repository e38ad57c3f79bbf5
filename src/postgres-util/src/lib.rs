// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! PostgreSQL utility library.
//!
//! Everything that touches the clone's database goes through this crate:
//! connecting, reading and writing the application settings table, measuring
//! size and row counts, and shelling out to `pg_dump` / `pg_restore`.

use std::fmt;

use tokio_postgres::{Client, NoTls};
use tracing::warn;

pub mod dump;
pub mod settings;
pub mod stats;

macro_rules! bail_generic {
    ($fmt:expr, $($arg:tt)*) => {
        return Err(PostgresError::Generic(anyhow::anyhow!($fmt, $($arg)*)))
    };
    ($err:expr $(,)?) => {
        return Err(PostgresError::Generic(anyhow::anyhow!($err)))
    };
}
pub(crate) use bail_generic;

/// An error representing failures when interacting with PostgreSQL.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Any other error we bail on.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
    /// Error using the PostgreSQL client.
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
    /// A PostgreSQL client tool could not be run.
    #[error("failed to run {program}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// A PostgreSQL client tool exited unsuccessfully.
    #[error("{program} exited with status {status}: {stderr}")]
    Tool {
        program: &'static str,
        status: i32,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Connection parameters for one database.
///
/// A missing password means the ambient authentication of the platform
/// (`.pgpass`, peer or trust authentication) is used.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    fn to_tokio_postgres(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user)
            .application_name("stagesync");
        if let Some(password) = &self.password {
            config.password(password);
        }
        config
    }

    /// Connects to the configured database.
    pub async fn connect(&self, task_name: &str) -> Result<Client, PostgresError> {
        let (client, connection) = self.to_tokio_postgres().connect(NoTls).await?;
        let task_name = task_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("{task_name}: postgres connection failed: {e}");
            }
        });
        Ok(client)
    }

    /// Command-line connection arguments for the PostgreSQL client tools.
    pub fn tool_args(&self) -> Vec<String> {
        vec![
            "--host".into(),
            self.host.clone(),
            "--port".into(),
            self.port.to_string(),
            "--username".into(),
            self.user.clone(),
            "--no-password".into(),
        ]
    }

    /// Environment for the PostgreSQL client tools.
    pub fn tool_env(&self) -> Vec<(&'static str, String)> {
        match &self.password {
            Some(password) => vec![("PGPASSWORD", password.clone())],
            None => Vec::new(),
        }
    }
}

/// Runs a trusted, operator-provided SQL script in a single round trip.
pub async fn execute_script(config: &Config, sql: &str) -> Result<(), PostgresError> {
    let client = config.connect("postgres_execute_script").await?;
    client.batch_execute(sql).await?;
    Ok(())
}

/// Quotes `ident` as a PostgreSQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
