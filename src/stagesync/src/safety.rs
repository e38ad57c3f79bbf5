// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The check that keeps a run from touching production.
//!
//! No flag disables it, and it runs under `--dry-run` too.

use std::net::IpAddr;
use std::path::Path;

use tracing::{info, warn};
use url::Url;

use crate::config::RunConfiguration;
use crate::prompt::{self, InputRequest, Prompter};
use crate::tuning::{self, TuningParameter};

/// The file in the configuration tree that declares the public hostname.
pub const DOMAIN_CONFIG_FILE: &str = "domain.xml";

const SITE_URL_PARAMETER: &str = "dataverse.siteUrl";

#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error("local application server declares hostname {hostname}, which is the production host")]
    LocalIsProduction { hostname: String },
    #[error("LOCAL_SERVER {hostname} is the production host")]
    ConfiguredAsProduction { hostname: String },
    #[error("local database host {host} is the production {what} {production}")]
    DatabaseIsProduction {
        host: String,
        what: &'static str,
        production: String,
    },
    #[error("local host identity could not be determined and the run was not confirmed")]
    NotConfirmed,
    #[error("failed to confirm local host identity: {0:#}")]
    Prompt(anyhow::Error),
}

/// What the local application server says about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalIdentity {
    Declared(String),
    Unknown { reason: String },
}

/// Reads the declared public hostname out of the local configuration tree.
pub fn read_local_identity(config_dir: &Path, hostname_parameter: &str) -> LocalIdentity {
    let path = config_dir.join(DOMAIN_CONFIG_FILE);
    match std::fs::read_to_string(&path) {
        Ok(xml) => declared_hostname(&tuning::parse_domain_config(&xml), hostname_parameter),
        Err(e) => LocalIdentity::Unknown {
            reason: format!("failed to read {}: {e}", path.display()),
        },
    }
}

/// Finds the hostname parameter, falling back to the host of the site URL.
pub fn declared_hostname(parameters: &[TuningParameter], hostname_parameter: &str) -> LocalIdentity {
    let value_of = |key: &str| {
        parameters
            .iter()
            .find(|p| p.key() == key)
            .and_then(|p| p.value())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    if let Some(hostname) = value_of(hostname_parameter) {
        return LocalIdentity::Declared(hostname.to_string());
    }
    if let Some(site_url) = value_of(SITE_URL_PARAMETER) {
        // Colons may still carry their admin CLI escaping.
        let site_url = site_url.replace("\\:", ":");
        if let Some(host) = Url::parse(&site_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
        {
            return LocalIdentity::Declared(host);
        }
    }
    LocalIdentity::Unknown {
        reason: format!("neither {hostname_parameter} nor {SITE_URL_PARAMETER} is set"),
    }
}

/// Whether two hostnames name the same host.
pub fn same_host(a: &str, b: &str) -> bool {
    let normalize = |h: &str| {
        h.trim()
            .trim_end_matches('.')
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase()
    };
    normalize(a) == normalize(b)
}

pub fn is_loopback(host: &str) -> bool {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host.eq_ignore_ascii_case("localhost.")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// What the identity check decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    /// The identity is unknown; the run may only proceed if confirmed.
    NeedsConfirmation(InputRequest),
}

/// Compares the local identity with the production hostname.
pub fn check_identity(
    identity: &LocalIdentity,
    production_server: &str,
) -> Result<Verdict, SafetyError> {
    match identity {
        LocalIdentity::Declared(hostname) if same_host(hostname, production_server) => {
            Err(SafetyError::LocalIsProduction {
                hostname: hostname.clone(),
            })
        }
        LocalIdentity::Declared(_) => Ok(Verdict::Proceed),
        LocalIdentity::Unknown { reason } => Ok(Verdict::NeedsConfirmation(
            InputRequest::confirm(
                "safety.unknown_identity",
                format!("Is this host definitely NOT the production host {production_server}?"),
                false,
            )
            .because(format!("The local host identity is unknown: {reason}.")),
        )),
    }
}

/// Checks that the local database is not the production database.
///
/// A loopback production database host is local to production, so it stands
/// for the production host itself.
pub fn check_database(config: &RunConfiguration) -> Result<(), SafetyError> {
    let local = config.local_database();
    let production = config.production_database();
    let production_server = config.production_server();

    if same_host(&local.host, production_server) {
        return Err(SafetyError::DatabaseIsProduction {
            host: local.host,
            what: "server",
            production: production_server.to_string(),
        });
    }
    let production_db_host = if is_loopback(&production.host) {
        production_server
    } else {
        production.host.as_str()
    };
    if same_host(&local.host, production_db_host) {
        return Err(SafetyError::DatabaseIsProduction {
            host: local.host,
            what: "database host",
            production: production_db_host.to_string(),
        });
    }
    Ok(())
}

/// Runs every check, asking the operator only if the local identity is
/// unknown.
pub fn verify(config: &RunConfiguration, prompter: &dyn Prompter) -> Result<(), SafetyError> {
    if same_host(config.local_server(), config.production_server()) {
        return Err(SafetyError::ConfiguredAsProduction {
            hostname: config.local_server().to_string(),
        });
    }
    check_database(config)?;

    let identity = read_local_identity(&config.appserver_config_dir(), config.hostname_parameter());
    match check_identity(&identity, config.production_server())? {
        Verdict::Proceed => {
            info!("safety check passed: local host is {identity:?}");
            Ok(())
        }
        Verdict::NeedsConfirmation(request) => {
            warn!("local host identity unknown");
            match prompt::confirm(prompter, &request) {
                Ok(true) => Ok(()),
                Ok(false) => Err(SafetyError::NotConfirmed),
                Err(e) => Err(SafetyError::Prompt(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::*;
    use crate::config::tests::sample_values;
    use crate::prompt::InputResponse;
    use crate::testing::ScriptedPrompter;

    fn p(option: &str) -> TuningParameter {
        TuningParameter::parse(option).unwrap()
    }

    fn config_with(overrides: &[(&str, &str)], config_dir: &Path) -> RunConfiguration {
        let mut values: BTreeMap<_, _> = sample_values();
        values.insert(
            "APPSERVER_CONFIG_DIR".into(),
            config_dir.display().to_string(),
        );
        for (k, v) in overrides {
            values.insert(k.to_string(), v.to_string());
        }
        RunConfiguration::from_values(values, PathBuf::from("stagesync.env")).unwrap()
    }

    fn write_domain(dir: &Path, option: &str) {
        let xml = format!(
            r#"<domain><configs><config name="server-config"><java-config>
<jvm-options>-Xmx4g</jvm-options>
<jvm-options>{option}</jvm-options>
</java-config></config></configs></domain>"#
        );
        std::fs::write(dir.join(DOMAIN_CONFIG_FILE), xml).unwrap();
    }

    #[test]
    fn matching_hostname_aborts() {
        let identity = LocalIdentity::Declared("Dataverse.Example.org.".into());
        assert!(matches!(
            check_identity(&identity, "dataverse.example.org"),
            Err(SafetyError::LocalIsProduction { .. })
        ));
    }

    #[test]
    fn different_hostname_proceeds() {
        let identity = LocalIdentity::Declared("staging.example.org".into());
        assert_eq!(
            check_identity(&identity, "dataverse.example.org").unwrap(),
            Verdict::Proceed
        );
    }

    #[test]
    fn falls_back_to_site_url() {
        let identity = declared_hostname(
            &[p("-Ddataverse.siteUrl=https://dataverse.example.org:8443")],
            "dataverse.fqdn",
        );
        assert_eq!(
            identity,
            LocalIdentity::Declared("dataverse.example.org".into())
        );
        assert!(matches!(
            declared_hostname(&[p("-Xmx4g")], "dataverse.fqdn"),
            LocalIdentity::Unknown { .. }
        ));
    }

    #[test]
    fn database_on_production_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let on_server = config_with(&[("DB_HOST", "dataverse.example.org")], dir.path());
        assert!(matches!(
            check_database(&on_server),
            Err(SafetyError::DatabaseIsProduction { what: "server", .. })
        ));

        let on_db_host = config_with(
            &[
                ("DB_HOST", "db.example.org"),
                ("PRODUCTION_DB_HOST", "DB.example.org"),
            ],
            dir.path(),
        );
        assert!(matches!(
            check_database(&on_db_host),
            Err(SafetyError::DatabaseIsProduction {
                what: "database host",
                ..
            })
        ));

        // Both sides on their own loopback.
        let local = config_with(&[], dir.path());
        assert!(check_database(&local).is_ok());
    }

    #[test]
    fn verify_reads_domain_config() {
        let dir = tempfile::tempdir().unwrap();
        let prompter = ScriptedPrompter::new();

        write_domain(dir.path(), "-Ddataverse.fqdn=dataverse.example.org");
        let config = config_with(&[], dir.path());
        assert!(matches!(
            verify(&config, &prompter),
            Err(SafetyError::LocalIsProduction { .. })
        ));

        write_domain(dir.path(), "-Ddataverse.fqdn=staging.example.org");
        assert!(verify(&config, &prompter).is_ok());
        assert!(prompter.asked().is_empty());
    }

    #[test]
    fn unknown_identity_requires_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&[], dir.path());

        let declined = ScriptedPrompter::new();
        assert!(matches!(
            verify(&config, &declined),
            Err(SafetyError::NotConfirmed)
        ));
        assert_eq!(declined.asked(), vec!["safety.unknown_identity"]);

        let confirmed = ScriptedPrompter::new()
            .answer("safety.unknown_identity", InputResponse::Confirm(true));
        assert!(verify(&config, &confirmed).is_ok());
    }

    #[test]
    fn configured_local_server_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        write_domain(dir.path(), "-Ddataverse.fqdn=staging.example.org");
        let config = config_with(&[("LOCAL_SERVER", "dataverse.example.org")], dir.path());
        assert!(matches!(
            verify(&config, &ScriptedPrompter::new()),
            Err(SafetyError::ConfiguredAsProduction { .. })
        ));
    }
}
