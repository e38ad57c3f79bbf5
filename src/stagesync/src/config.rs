// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Loading and validating the run configuration.
//!
//! The configuration is a flat `KEY=VALUE` file. Required keys are grouped by
//! the subsystem that needs them and every group is checked independently, so
//! a single run reports every missing key at once.
//!
//! Some production-side keys default to the value of their local counterpart.
//! Those values are recorded as *provisional*: the stage that uses one must
//! confirm it against the production host before relying on it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use itertools::Itertools;
use regex::Regex;
use stagesync_ssh_util::SshTarget;
use url::Url;

/// Name of the configuration file looked up next to the binary.
pub const DEFAULT_CONFIG_FILE: &str = "stagesync.env";

/// The subsystem a required key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigGroup {
    LocalService,
    RemoteService,
    Database,
}

impl fmt::Display for ConfigGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigGroup::LocalService => f.write_str("local service"),
            ConfigGroup::RemoteService => f.write_str("remote service"),
            ConfigGroup::Database => f.write_str("database"),
        }
    }
}

const REQUIRED_KEYS: &[(ConfigGroup, &[&str])] = &[
    (
        ConfigGroup::LocalService,
        &[
            "LOCAL_SERVER",
            "APPSERVER_DIR",
            "CONTENT_DIR",
            "SEARCH_CONF_DIR",
            "APP_SERVICE_USER",
        ],
    ),
    (
        ConfigGroup::RemoteService,
        &["PRODUCTION_SERVER", "PRODUCTION_SSH_USER"],
    ),
    (
        ConfigGroup::Database,
        &[
            "DB_HOST",
            "DB_NAME",
            "DB_USER",
            "PRODUCTION_DB_HOST",
            "PRODUCTION_DB_NAME",
            "PRODUCTION_DB_USER",
        ],
    ),
];

/// `(production key, local key it defaults to)`.
const SUBSTITUTIONS: &[(&str, &str)] = &[
    ("PRODUCTION_APPSERVER_DIR", "APPSERVER_DIR"),
    ("PRODUCTION_CONTENT_DIR", "CONTENT_DIR"),
    ("PRODUCTION_SEARCH_CONF_DIR", "SEARCH_CONF_DIR"),
    ("PRODUCTION_APP_SERVICE_USER", "APP_SERVICE_USER"),
    ("PRODUCTION_AUX_PROCESSOR_DIR", "AUX_PROCESSOR_DIR"),
];

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(changeme|change-me|todo|tbd|x{3,}|<[^>]*>|your[-_].*)$").expect("valid regex")
});

/// The keys of one group that were not provided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingKeys {
    pub group: ConfigGroup,
    pub keys: Vec<&'static str>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}:{line}: expected KEY=VALUE", .path.display())]
    Syntax { path: PathBuf, line: usize },
    #[error("missing required configuration: {}", format_missing(.0))]
    Missing(Vec<MissingKeys>),
    #[error("configuration still contains template placeholders: {}", .0.join(", "))]
    Placeholders(Vec<String>),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn format_missing(missing: &[MissingKeys]) -> String {
    missing
        .iter()
        .map(|m| format!("{} ({})", m.group, m.keys.join(", ")))
        .join("; ")
}

/// The validated, immutable configuration of one run.
#[derive(Debug, Clone)]
pub struct RunConfiguration {
    values: BTreeMap<String, String>,
    provisional: BTreeSet<&'static str>,
    source: PathBuf,
    db_port: u16,
    production_db_port: u16,
    ssh_port: u16,
    file_size_limit_mb: u64,
    readiness_timeout: Duration,
    index_timeout: Duration,
    app_base_url: Url,
}

impl RunConfiguration {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<RunConfiguration, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let values = parse(&text, path)?;
        RunConfiguration::from_values(values, path.to_path_buf())
    }

    /// Validates already-parsed values. `source` anchors the default log and
    /// lock file locations.
    pub fn from_values(
        mut values: BTreeMap<String, String>,
        source: PathBuf,
    ) -> Result<RunConfiguration, ConfigError> {
        values.retain(|_, v| !v.is_empty());

        let missing: Vec<_> = REQUIRED_KEYS
            .iter()
            .filter_map(|(group, keys)| {
                let absent: Vec<_> = keys
                    .iter()
                    .copied()
                    .filter(|k| !values.contains_key(*k))
                    .collect();
                (!absent.is_empty()).then_some(MissingKeys {
                    group: *group,
                    keys: absent,
                })
            })
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let mut provisional = BTreeSet::new();
        for (production_key, local_key) in SUBSTITUTIONS {
            if values.contains_key(*production_key) {
                continue;
            }
            if let Some(local) = values.get(*local_key).cloned() {
                values.insert(production_key.to_string(), local);
                provisional.insert(*production_key);
            }
        }

        let app_base_url = values
            .get("APP_BASE_URL")
            .map(String::as_str)
            .unwrap_or("http://localhost:8080");
        let app_base_url = Url::parse(app_base_url).map_err(|e| ConfigError::Invalid {
            key: "APP_BASE_URL",
            reason: e.to_string(),
        })?;

        Ok(RunConfiguration {
            db_port: parse_number(&values, "DB_PORT", 5432)?,
            production_db_port: parse_number(&values, "PRODUCTION_DB_PORT", 5432)?,
            ssh_port: parse_number(&values, "SSH_PORT", 22)?,
            file_size_limit_mb: parse_number(&values, "FILE_SIZE_LIMIT_MB", 100)?,
            readiness_timeout: Duration::from_secs(parse_number(
                &values,
                "READINESS_TIMEOUT_SECS",
                300,
            )?),
            index_timeout: Duration::from_secs(parse_number(
                &values,
                "INDEX_TIMEOUT_SECS",
                3600,
            )?),
            app_base_url,
            values,
            provisional,
            source,
        })
    }

    /// Returns the raw value of `key`, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn required(&self, key: &str) -> &str {
        // Presence of every required key is checked in `from_values`.
        self.get(key).unwrap_or_default()
    }

    /// Whether `key` holds a value substituted from its local counterpart.
    pub fn is_provisional(&self, key: &str) -> bool {
        self.provisional.contains(key)
    }

    pub fn provisional_keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.provisional.iter().copied()
    }

    /// Returns every key whose value is still a template placeholder.
    pub fn placeholders(&self) -> Vec<String> {
        self.values
            .iter()
            .filter(|(_, v)| PLACEHOLDER_RE.is_match(v.trim()))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn check_placeholders(&self) -> Result<(), ConfigError> {
        let placeholders = self.placeholders();
        if placeholders.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Placeholders(placeholders))
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    fn beside_source(&self, file: &str) -> PathBuf {
        self.source
            .parent()
            .map(|dir| dir.join(file))
            .unwrap_or_else(|| PathBuf::from(file))
    }

    // === Local service. ===

    pub fn local_server(&self) -> &str {
        self.required("LOCAL_SERVER")
    }

    pub fn appserver_dir(&self) -> PathBuf {
        PathBuf::from(self.required("APPSERVER_DIR"))
    }

    pub fn appserver_config_dir(&self) -> PathBuf {
        match self.get("APPSERVER_CONFIG_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => self
                .appserver_dir()
                .join("glassfish/domains/domain1/config"),
        }
    }

    pub fn content_dir(&self) -> PathBuf {
        PathBuf::from(self.required("CONTENT_DIR"))
    }

    pub fn search_conf_dir(&self) -> PathBuf {
        PathBuf::from(self.required("SEARCH_CONF_DIR"))
    }

    pub fn aux_processor_dir(&self) -> Option<PathBuf> {
        self.get("AUX_PROCESSOR_DIR").map(PathBuf::from)
    }

    pub fn app_service_user(&self) -> &str {
        self.required("APP_SERVICE_USER")
    }

    pub fn app_service_name(&self) -> &str {
        self.get("APP_SERVICE_NAME").unwrap_or("payara")
    }

    pub fn search_service_name(&self) -> &str {
        self.get("SEARCH_SERVICE_NAME").unwrap_or("solr")
    }

    pub fn app_base_url(&self) -> &Url {
        &self.app_base_url
    }

    /// The tuning parameter that declares the public hostname.
    pub fn hostname_parameter(&self) -> &str {
        self.get("HOSTNAME_PARAMETER").unwrap_or("dataverse.fqdn")
    }

    // === Production service. ===

    pub fn production_server(&self) -> &str {
        self.required("PRODUCTION_SERVER")
    }

    pub fn ssh_target(&self) -> SshTarget {
        SshTarget::new(
            self.required("PRODUCTION_SSH_USER"),
            self.production_server(),
            self.ssh_port,
        )
    }

    pub fn production_appserver_dir(&self) -> PathBuf {
        PathBuf::from(self.required("PRODUCTION_APPSERVER_DIR"))
    }

    pub fn production_content_dir(&self) -> PathBuf {
        PathBuf::from(self.required("PRODUCTION_CONTENT_DIR"))
    }

    pub fn production_search_conf_dir(&self) -> PathBuf {
        PathBuf::from(self.required("PRODUCTION_SEARCH_CONF_DIR"))
    }

    pub fn production_aux_processor_dir(&self) -> Option<PathBuf> {
        self.get("PRODUCTION_AUX_PROCESSOR_DIR").map(PathBuf::from)
    }

    pub fn production_app_service_user(&self) -> &str {
        self.required("PRODUCTION_APP_SERVICE_USER")
    }

    pub fn production_app_base_url(&self) -> &str {
        self.get("PRODUCTION_APP_BASE_URL")
            .unwrap_or("http://localhost:8080")
    }

    // === Databases. ===

    pub fn local_database(&self) -> stagesync_postgres_util::Config {
        stagesync_postgres_util::Config {
            host: self.required("DB_HOST").to_string(),
            port: self.db_port,
            dbname: self.required("DB_NAME").to_string(),
            user: self.required("DB_USER").to_string(),
            password: self.get("DB_PASSWORD").map(str::to_string),
        }
    }

    pub fn production_database(&self) -> stagesync_postgres_util::Config {
        stagesync_postgres_util::Config {
            host: self.required("PRODUCTION_DB_HOST").to_string(),
            port: self.production_db_port,
            dbname: self.required("PRODUCTION_DB_NAME").to_string(),
            user: self.required("PRODUCTION_DB_USER").to_string(),
            password: self.get("PRODUCTION_DB_PASSWORD").map(str::to_string),
        }
    }

    // === Run behavior. ===

    pub fn backup_dir(&self) -> Option<PathBuf> {
        self.get("BACKUP_DIR").map(PathBuf::from)
    }

    pub fn file_size_limit_bytes(&self) -> u64 {
        self.file_size_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_timeout
    }

    pub fn index_timeout(&self) -> Duration {
        self.index_timeout
    }

    pub fn tls_cert_file(&self) -> Option<PathBuf> {
        self.get("TLS_CERT_FILE").map(PathBuf::from)
    }

    pub fn ddl_dir(&self) -> Option<PathBuf> {
        self.get("DDL_DIR").map(PathBuf::from)
    }

    pub fn log_file(&self) -> PathBuf {
        match self.get("LOG_FILE") {
            Some(path) => PathBuf::from(path),
            None => self.beside_source("stagesync.log"),
        }
    }

    pub fn lock_file(&self) -> PathBuf {
        match self.get("LOCK_FILE") {
            Some(path) => PathBuf::from(path),
            None => self.beside_source("stagesync.lock"),
        }
    }
}

fn parse_number<T>(
    values: &BTreeMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match values.get(key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("{v:?}: {e}"),
        }),
    }
}

/// Parses `KEY=VALUE` lines.
///
/// Blank lines and `#` comments are skipped, a leading `export ` is accepted,
/// and values may be wrapped in single or double quotes. Unquoted values end
/// at the first ` #`.
pub fn parse(text: &str, path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut values = BTreeMap::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let syntax = || ConfigError::Syntax {
            path: path.to_path_buf(),
            line: idx + 1,
        };
        let (key, value) = line.split_once('=').ok_or_else(syntax)?;
        let key = key.trim();
        if !KEY_RE.is_match(key) {
            return Err(syntax());
        }
        values.insert(key.to_string(), unquote(value.trim()));
    }
    Ok(values)
}

fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_values() -> BTreeMap<String, String> {
        [
            ("LOCAL_SERVER", "staging.example.org"),
            ("APPSERVER_DIR", "/usr/local/payara6"),
            ("CONTENT_DIR", "/srv/dataverse/files"),
            ("SEARCH_CONF_DIR", "/usr/local/solr/server/solr/collection1/conf"),
            ("APP_SERVICE_USER", "dataverse"),
            ("PRODUCTION_SERVER", "dataverse.example.org"),
            ("PRODUCTION_SSH_USER", "deploy"),
            ("DB_HOST", "localhost"),
            ("DB_NAME", "dvndb"),
            ("DB_USER", "dvnapp"),
            ("PRODUCTION_DB_HOST", "localhost"),
            ("PRODUCTION_DB_NAME", "dvndb"),
            ("PRODUCTION_DB_USER", "dvnapp"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn parses_comments_quotes_and_exports() {
        let text = r#"
# a comment
export LOCAL_SERVER=staging.example.org
DB_PASSWORD="p@ss word"
SEARCH_SERVICE_NAME='solr9'
FILE_SIZE_LIMIT_MB=50 # megabytes
"#;
        let values = parse(text, Path::new("stagesync.env")).unwrap();
        assert_eq!(values["LOCAL_SERVER"], "staging.example.org");
        assert_eq!(values["DB_PASSWORD"], "p@ss word");
        assert_eq!(values["SEARCH_SERVICE_NAME"], "solr9");
        assert_eq!(values["FILE_SIZE_LIMIT_MB"], "50");
    }

    #[test]
    fn rejects_lines_without_assignment() {
        let err = parse("LOCAL_SERVER\n", Path::new("stagesync.env")).unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { line: 1, .. }));
    }

    #[test]
    fn reports_every_missing_key_per_group() {
        let mut values = sample_values();
        values.remove("CONTENT_DIR");
        values.remove("APP_SERVICE_USER");
        values.remove("PRODUCTION_SSH_USER");
        values.insert("DB_NAME".into(), String::new());

        let err = RunConfiguration::from_values(values, PathBuf::from("stagesync.env"))
            .unwrap_err();
        let ConfigError::Missing(missing) = err else {
            panic!("expected missing keys, got {err:?}");
        };
        assert_eq!(
            missing,
            vec![
                MissingKeys {
                    group: ConfigGroup::LocalService,
                    keys: vec!["CONTENT_DIR", "APP_SERVICE_USER"],
                },
                MissingKeys {
                    group: ConfigGroup::RemoteService,
                    keys: vec!["PRODUCTION_SSH_USER"],
                },
                MissingKeys {
                    group: ConfigGroup::Database,
                    keys: vec!["DB_NAME"],
                },
            ]
        );
    }

    #[test]
    fn substitutes_production_paths_provisionally() {
        let mut values = sample_values();
        values.insert("PRODUCTION_SEARCH_CONF_DIR".into(), "/opt/solr/conf".into());
        let config =
            RunConfiguration::from_values(values, PathBuf::from("/etc/stagesync/stagesync.env"))
                .unwrap();

        assert_eq!(
            config.production_content_dir(),
            PathBuf::from("/srv/dataverse/files")
        );
        assert!(config.is_provisional("PRODUCTION_CONTENT_DIR"));
        assert!(!config.is_provisional("PRODUCTION_SEARCH_CONF_DIR"));
        assert_eq!(config.production_aux_processor_dir(), None);
        assert_eq!(
            config.lock_file(),
            PathBuf::from("/etc/stagesync/stagesync.lock")
        );
    }

    #[test]
    fn rejects_invalid_numbers() {
        let mut values = sample_values();
        values.insert("DB_PORT".into(), "fifty".into());
        let err =
            RunConfiguration::from_values(values, PathBuf::from("stagesync.env")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "DB_PORT", .. }));
    }

    #[test]
    fn flags_template_placeholders() {
        let mut values = sample_values();
        values.insert("DB_PASSWORD".into(), "CHANGEME".into());
        values.insert("BACKUP_DIR".into(), "<backup directory>".into());
        let config =
            RunConfiguration::from_values(values, PathBuf::from("stagesync.env")).unwrap();
        assert_eq!(config.placeholders(), vec!["BACKUP_DIR", "DB_PASSWORD"]);
        assert!(config.check_placeholders().is_err());
    }
}
