// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The live implementations of [`crate::services`].

use std::time::Duration;

use anyhow::Context;
use stagesync_ssh_util::session::RemoteSession;

use crate::config::RunConfiguration;
use crate::services::Services;

pub mod app_server;
pub mod database;
pub mod http_api;
pub mod production;

const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens the SSH session to production and builds the services for `config`.
pub async fn connect(config: &RunConfiguration) -> anyhow::Result<Services> {
    let target = config.ssh_target();
    let session = RemoteSession::connect(&target)
        .await
        .with_context(|| format!("connecting to production as {target}"))?;
    let api = http_api::ApiClient::new(config.app_base_url().clone(), API_TIMEOUT)?;
    Ok(Services {
        production: Box::new(production::SshProduction::new(session, config)),
        database: Box::new(database::PostgresDatabase::new(config.local_database())),
        app_server: Box::new(app_server::LocalAppServer::new(
            &config.appserver_dir(),
            config.app_service_user(),
            config.app_service_name(),
            config.app_base_url().clone(),
        )?),
        search: Box::new(http_api::ApiSearchIndex::new(
            api.clone(),
            config.search_service_name(),
        )),
        integrations: Box::new(http_api::ApiIntegrations::new(api)),
    })
}
