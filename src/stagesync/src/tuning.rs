// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Application-server tuning parameters and their reconciliation.
//!
//! A tuning parameter is one JVM startup option as reported by the
//! application server's admin CLI. Reconciliation between production and the
//! clone happens in two independent phases:
//!
//! 1. A generic merge adds production parameters whose key is missing locally.
//!    The local value always wins on conflict, and storage-related or
//!    environment-specific parameters are never copied.
//! 2. A storage application rewrites the storage-related parameters so they
//!    match the resolved [`StorageChoice`](crate::storage::StorageChoice).
//!
//! Both phases are computed as plans by pure functions here; the stage in
//! [`crate::stages::tuning`] applies them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Vocabulary that marks a key as belonging to object storage or cloud
/// credentials.
static STORAGE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        (^|[.\-_])s3([.\-_]|$)
        | aws
        | bucket
        | access-?key
        | secret-?key
        | endpoint-url
        | path-style
        | upload-redirect
        | download-redirect
        | payload-signing
        | chunked-encoding
        | storage-driver",
    )
    .expect("valid regex")
});

/// Vocabulary that marks a key as carrying a secret.
static SECRET_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(password|passwd|secret|token|credential|access-?key|api-?key|private-?key)")
        .expect("valid regex")
});

/// Keys that describe the identity of one particular host.
const IDENTITY_KEYS: &[&str] = &["dataverse.fqdn", "dataverse.siteUrl", "dataverse.siteurl"];

/// Whether values bound to `key` must not be shown.
pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEY_RE.is_match(key)
}

/// Shown in place of a secret value.
pub const SECRET_MASK: &str = "********";

/// The driver id parameter selecting the default storage.
pub const STORAGE_DRIVER_PARAMETER: &str = "dataverse.files.storage-driver-id";

/// Prefix of every per-store key, `dataverse.files.<store id>.<setting>`.
const STORE_PREFIX: &str = "dataverse.files.";

/// The store id and store type of the local filesystem store.
const FILE_STORE: &str = "file";

/// How a parameter may participate in reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParameterScope {
    /// Object storage or cloud credential configuration.
    Storage,
    /// Host identity or secrets; never copied between hosts.
    EnvironmentSpecific,
    Generic,
}

/// One application-server startup option, e.g. `-Xmx4g` or
/// `-Ddataverse.files.directory=/srv/files`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TuningParameter {
    option: String,
}

impl TuningParameter {
    /// Parses one option. Returns `None` for text that is not an option.
    pub fn parse(text: &str) -> Option<TuningParameter> {
        // Some servers annotate options with supported JDK ranges.
        let text = match text.find(" -->") {
            Some(idx) => &text[..idx],
            None => text,
        };
        let text = text.trim();
        if !text.starts_with('-') || text.len() < 2 {
            return None;
        }
        Some(TuningParameter {
            option: text.to_string(),
        })
    }

    /// Builds a system property option `-Dkey=value`.
    pub fn property(key: &str, value: &str) -> TuningParameter {
        TuningParameter {
            option: format!("-D{key}={value}"),
        }
    }

    /// The full option text.
    pub fn option(&self) -> &str {
        &self.option
    }

    /// The identity used to decide whether two options configure the same
    /// thing. Values never participate.
    pub fn key(&self) -> String {
        let option = self.option.as_str();
        if let Some(property) = option.strip_prefix("-D") {
            return match property.split_once('=') {
                Some((key, _)) => key.to_string(),
                None => property.to_string(),
            };
        }
        if let Some(flag) = option.strip_prefix("-XX:") {
            if let Some(name) = flag.strip_prefix('+').or_else(|| flag.strip_prefix('-')) {
                return format!("-XX:{name}");
            }
            return match flag.split_once('=') {
                Some((name, _)) => format!("-XX:{name}"),
                None => option.to_string(),
            };
        }
        for sized in ["-Xmx", "-Xms", "-Xss", "-Xmn"] {
            if option.starts_with(sized) {
                return sized.to_string();
            }
        }
        match option.split_once('=') {
            Some((key, _)) => key.to_string(),
            None => option.to_string(),
        }
    }

    /// The value of a `-Dkey=value` option.
    pub fn value(&self) -> Option<&str> {
        self.option
            .strip_prefix("-D")
            .and_then(|p| p.split_once('='))
            .map(|(_, v)| v)
    }

    /// The store id of a `dataverse.files.<id>.<setting>` key.
    fn store_id(&self) -> Option<String> {
        let key = self.key();
        let rest = key.strip_prefix(STORE_PREFIX)?;
        let (id, setting) = rest.split_once('.')?;
        (!setting.is_empty()).then(|| id.to_string())
    }

    /// Whether this belongs to a store other than the local filesystem one.
    /// A store declared with `.type=file` is local whatever its id.
    fn configures_remote_store(&self) -> bool {
        match self.store_id() {
            Some(id) if id == FILE_STORE => false,
            Some(_) => !(self.key().ends_with(".type") && self.value() == Some(FILE_STORE)),
            None => false,
        }
    }

    pub fn scope(&self) -> ParameterScope {
        let key = self.key();
        if STORAGE_KEY_RE.is_match(&key) || self.configures_remote_store() {
            ParameterScope::Storage
        } else if IDENTITY_KEYS.contains(&key.as_str()) || SECRET_KEY_RE.is_match(&key) {
            ParameterScope::EnvironmentSpecific
        } else {
            ParameterScope::Generic
        }
    }

    pub fn is_storage_related(&self) -> bool {
        self.scope() == ParameterScope::Storage
    }
}

/// Displays the option with a secret value masked. Commands use
/// [`TuningParameter::option`].
impl fmt::Display for TuningParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(_) if is_secret_key(&self.key()) => {
                write!(f, "-D{}={SECRET_MASK}", self.key())
            }
            _ => f.write_str(&self.option),
        }
    }
}

/// Parses the output of the admin CLI's option listing, skipping anything
/// that is not an option (banners, status lines).
pub fn parse_listing(output: &str) -> Vec<TuningParameter> {
    output.lines().filter_map(TuningParameter::parse).collect()
}

static JVM_OPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<jvm-options>([^<]*)</jvm-options>").expect("valid regex"));

/// Extracts the server configuration's options from a `domain.xml` document.
///
/// Only the `server-config` section is read when present, since the default
/// template section is not what the running server uses.
pub fn parse_domain_config(xml: &str) -> Vec<TuningParameter> {
    let section = match xml.find(r#"name="server-config""#) {
        Some(start) => {
            let rest = &xml[start..];
            match rest.find("</config>") {
                Some(end) => &rest[..end],
                None => rest,
            }
        }
        None => xml,
    };
    JVM_OPTION_RE
        .captures_iter(section)
        .filter_map(|c| TuningParameter::parse(&unescape_xml(&c[1])))
        .collect()
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// A key bound more than once within one host's parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateKey {
    pub key: String,
    pub options: Vec<TuningParameter>,
}

/// Finds every key bound more than once in `parameters`.
pub fn find_duplicates(parameters: &[TuningParameter]) -> Vec<DuplicateKey> {
    let mut by_key: BTreeMap<String, Vec<TuningParameter>> = BTreeMap::new();
    for parameter in parameters {
        by_key
            .entry(parameter.key())
            .or_default()
            .push(parameter.clone());
    }
    by_key
        .into_iter()
        .filter(|(_, options)| options.len() > 1)
        .map(|(key, options)| DuplicateKey { key, options })
        .collect()
}

/// The storage-related subset of `parameters`.
pub fn storage_parameters(parameters: &[TuningParameter]) -> Vec<TuningParameter> {
    parameters
        .iter()
        .filter(|p| p.is_storage_related())
        .cloned()
        .collect()
}

/// Returns the generic production parameters whose key is absent locally.
///
/// Each missing key is added once even if production binds it repeatedly.
pub fn missing_generic(
    production: &[TuningParameter],
    local: &[TuningParameter],
) -> Vec<TuningParameter> {
    let mut seen: BTreeSet<String> = local.iter().map(TuningParameter::key).collect();
    production
        .iter()
        .filter(|p| p.scope() == ParameterScope::Generic)
        .filter(|p| seen.insert(p.key()))
        .cloned()
        .collect()
}

/// One change to apply to the local parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterChange {
    Create(TuningParameter),
    Delete(TuningParameter),
}

impl fmt::Display for ParameterChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterChange::Create(p) => write!(f, "create tuning parameter {p}"),
            ParameterChange::Delete(p) => write!(f, "delete tuning parameter {p}"),
        }
    }
}

/// Plans writing `desired` with delete-then-create: every local option bound
/// to the same key is deleted first, so no stale duplicate survives. Options
/// already present exactly once are left alone.
pub fn overwrite_plan(local: &[TuningParameter], desired: &[TuningParameter]) -> Vec<ParameterChange> {
    let mut changes = Vec::new();
    for wanted in desired {
        let key = wanted.key();
        let bound: Vec<_> = local.iter().filter(|p| p.key() == key).collect();
        if bound.len() == 1 && bound[0] == wanted {
            continue;
        }
        changes.extend(bound.into_iter().cloned().map(ParameterChange::Delete));
        changes.push(ParameterChange::Create(wanted.clone()));
    }
    changes
}
