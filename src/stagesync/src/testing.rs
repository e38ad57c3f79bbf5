// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory services and a scratch installation for tests.
//!
//! Every fake shares its state behind an `Arc`, so a test can hand a clone to
//! [`Services`] and inspect its own handle afterwards.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagesync_ssh_util::transfer::TransferMethod;
use tempfile::TempDir;

use crate::config::RunConfiguration;
use crate::config::tests::sample_values;
use crate::prompt::{InputRequest, InputResponse, Prompter};
use crate::services::{
    AppServer, Fetched, IndexStatus, Integration, IntegrationRegistry, LocalDatabase, Production,
    SearchIndex, Services,
};
use crate::tree;
use crate::tuning::TuningParameter;

pub(crate) fn p(option: &str) -> TuningParameter {
    TuningParameter::parse(option).unwrap()
}

pub(crate) fn settings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Answers prompts from a script, falling back to each request's default.
#[derive(Debug, Default)]
pub(crate) struct ScriptedPrompter {
    answers: Mutex<BTreeMap<&'static str, VecDeque<InputResponse>>>,
    asked: Mutex<Vec<&'static str>>,
}

impl ScriptedPrompter {
    pub(crate) fn new() -> ScriptedPrompter {
        ScriptedPrompter::default()
    }

    /// Queues `response` for the next request with `key`.
    pub(crate) fn answer(self, key: &'static str, response: InputResponse) -> ScriptedPrompter {
        self.answers
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push_back(response);
        self
    }

    /// The keys of every request asked so far, in order.
    pub(crate) fn asked(&self) -> Vec<&'static str> {
        self.asked.lock().unwrap().clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&self, request: &InputRequest) -> anyhow::Result<InputResponse> {
        self.asked.lock().unwrap().push(request.key);
        let scripted = self
            .answers
            .lock()
            .unwrap()
            .get_mut(request.key)
            .and_then(VecDeque::pop_front);
        match scripted.or_else(|| request.default_response()) {
            Some(response) => Ok(response),
            None => bail!("{}: no scripted answer and no default", request.key),
        }
    }
}

/// The contents of a fake database, which is also its dump format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DatabaseState {
    pub settings: BTreeMap<String, String>,
    pub row_counts: BTreeMap<String, i64>,
    #[serde(skip)]
    pub applied_sql: Vec<String>,
}

const DUMP_MAGIC: &[u8] = b"PGDMP";

fn write_dump(state: &DatabaseState, path: &Path) -> anyhow::Result<()> {
    let mut bytes = DUMP_MAGIC.to_vec();
    bytes.extend(serde_json::to_vec(state)?);
    std::fs::write(path, bytes)?;
    Ok(())
}

fn read_dump(path: &Path) -> anyhow::Result<DatabaseState> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let Some(body) = bytes.strip_prefix(DUMP_MAGIC) else {
        bail!("{} is not a PostgreSQL custom-format archive", path.display());
    };
    serde_json::from_slice(body).context("corrupt archive")
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeDatabase {
    pub state: Arc<Mutex<DatabaseState>>,
}

impl FakeDatabase {
    pub(crate) fn new(state: DatabaseState) -> FakeDatabase {
        FakeDatabase {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn snapshot(&self) -> DatabaseState {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalDatabase for FakeDatabase {
    async fn size_bytes(&self) -> anyhow::Result<u64> {
        Ok(4096)
    }

    async fn dump(&self, path: &Path) -> anyhow::Result<()> {
        write_dump(&self.snapshot(), path)
    }

    async fn validate_dump(&self, path: &Path) -> anyhow::Result<()> {
        read_dump(path).map(|_| ())
    }

    async fn restore(&self, path: &Path) -> anyhow::Result<()> {
        let restored = read_dump(path)?;
        let mut state = self.state.lock().unwrap();
        state.settings = restored.settings;
        state.row_counts = restored.row_counts;
        Ok(())
    }

    async fn settings(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self.snapshot().settings)
    }

    async fn set_setting(&self, name: &str, value: &str) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .settings
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_setting(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.state.lock().unwrap().settings.remove(name).is_some())
    }

    async fn row_counts(&self) -> anyhow::Result<BTreeMap<String, i64>> {
        Ok(self.snapshot().row_counts)
    }

    async fn apply_sql(&self, sql: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().applied_sql.push(sql.to_string());
        Ok(())
    }
}

/// Production, served from plain directories and in-memory state.
#[derive(Debug, Clone)]
pub(crate) struct FakeProduction {
    pub database: DatabaseState,
    pub parameters: Vec<TuningParameter>,
    pub integrations: Vec<Integration>,
    pub version: String,
    /// Serve a dump that cannot be restored.
    pub corrupt_dump: bool,
}

#[async_trait]
impl Production for FakeProduction {
    async fn settings(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self.database.settings.clone())
    }

    async fn tuning_parameters(&self) -> anyhow::Result<Vec<TuningParameter>> {
        Ok(self.parameters.clone())
    }

    async fn fetch_database_dump(&self, local: &Path) -> anyhow::Result<Fetched> {
        if self.corrupt_dump {
            std::fs::write(local, b"truncated")?;
        } else {
            write_dump(&self.database, local)?;
        }
        Ok(Fetched::new(TransferMethod::Rsync))
    }

    async fn path_exists(&self, path: &Path) -> anyhow::Result<bool> {
        Ok(path.exists())
    }

    async fn fetch_tree(
        &self,
        remote: &Path,
        local: &Path,
        _max_file_size: Option<u64>,
    ) -> anyhow::Result<Fetched> {
        tree::copy_tree(remote, local)?;
        Ok(Fetched::new(TransferMethod::Rsync))
    }

    async fn integrations(&self) -> anyhow::Result<Vec<Integration>> {
        Ok(self.integrations.clone())
    }

    async fn app_version(&self) -> anyhow::Result<String> {
        Ok(self.version.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct AppServerState {
    pub parameters: Vec<TuningParameter>,
    pub restarts: u32,
    pub owned: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeAppServer {
    pub state: Arc<Mutex<AppServerState>>,
    pub version: String,
}

impl FakeAppServer {
    pub(crate) fn parameters(&self) -> Vec<TuningParameter> {
        self.state.lock().unwrap().parameters.clone()
    }
}

#[async_trait]
impl AppServer for FakeAppServer {
    async fn tuning_parameters(&self) -> anyhow::Result<Vec<TuningParameter>> {
        Ok(self.parameters())
    }

    async fn create_tuning_parameter(&self, parameter: &TuningParameter) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.parameters.contains(parameter) {
            bail!("{parameter} already exists");
        }
        state.parameters.push(parameter.clone());
        Ok(())
    }

    async fn delete_tuning_parameter(&self, parameter: &TuningParameter) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(idx) = state.parameters.iter().position(|p| p == parameter) else {
            bail!("{parameter} does not exist");
        };
        state.parameters.remove(idx);
        Ok(())
    }

    async fn restart(&self) -> anyhow::Result<()> {
        self.state.lock().unwrap().restarts += 1;
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn version(&self) -> anyhow::Result<String> {
        Ok(self.version.clone())
    }

    async fn take_ownership(&self, path: &Path) -> anyhow::Result<()> {
        self.state.lock().unwrap().owned.push(path.to_path_buf());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SearchState {
    pub restarts: u32,
    pub clears: u32,
    pub rebuilds: u32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeSearch {
    pub state: Arc<Mutex<SearchState>>,
}

#[async_trait]
impl SearchIndex for FakeSearch {
    async fn restart(&self) -> anyhow::Result<()> {
        self.state.lock().unwrap().restarts += 1;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.state.lock().unwrap().clears += 1;
        Ok(())
    }

    async fn start_rebuild(&self) -> anyhow::Result<()> {
        self.state.lock().unwrap().rebuilds += 1;
        Ok(())
    }

    async fn status(&self) -> anyhow::Result<IndexStatus> {
        Ok(IndexStatus { stale: 0 })
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeIntegrations {
    pub registered: Arc<Mutex<Vec<Integration>>>,
}

impl FakeIntegrations {
    pub(crate) fn list_now(&self) -> Vec<Integration> {
        self.registered.lock().unwrap().clone()
    }
}

#[async_trait]
impl IntegrationRegistry for FakeIntegrations {
    async fn list(&self) -> anyhow::Result<Vec<Integration>> {
        Ok(self.list_now())
    }

    async fn register(&self, integration: &Integration) -> anyhow::Result<()> {
        let mut registered = self.registered.lock().unwrap();
        let id = registered.iter().filter_map(|i| i.id).max().unwrap_or(0) + 1;
        registered.push(Integration {
            id: Some(id),
            ..integration.clone()
        });
        Ok(())
    }

    async fn remove(&self, id: i64) -> anyhow::Result<()> {
        self.registered
            .lock()
            .unwrap()
            .retain(|i| i.id != Some(id));
        Ok(())
    }
}

pub(crate) fn integration(name: &str) -> Integration {
    let mut manifest = serde_json::Map::new();
    manifest.insert(
        "toolUrl".into(),
        serde_json::Value::String(format!("https://{name}.example.org")),
    );
    Integration {
        id: Some(1),
        display_name: name.to_string(),
        manifest,
    }
}

fn domain_xml(parameters: &[TuningParameter]) -> String {
    let options: String = parameters
        .iter()
        .map(|p| format!("<jvm-options>{}</jvm-options>\n", p.option()))
        .collect();
    format!(
        "<domain><configs><config name=\"server-config\"><java-config>\n{options}\
         </java-config></config></configs></domain>\n"
    )
}

/// A scratch installation: the clone's directories, production's
/// directories and in-memory services for both.
pub(crate) struct Fixture {
    dir: TempDir,
    pub database: FakeDatabase,
    pub production: FakeProduction,
    pub app_server: FakeAppServer,
    pub search: FakeSearch,
    pub integrations: FakeIntegrations,
}

impl Fixture {
    pub(crate) fn new() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let local_parameters = vec![
            p("-Xmx4g"),
            p("-Ddataverse.fqdn=staging.example.org"),
            p("-Ddataverse.files.directory=/srv/dataverse/files"),
        ];
        for sub in ["local/config", "local/solr", "local/files", "backups"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        std::fs::write(root.join("local/config/domain.xml"), domain_xml(&local_parameters))
            .unwrap();
        std::fs::write(root.join("local/solr/schema.xml"), "<schema name=\"staging\"/>\n").unwrap();

        for sub in ["production/files/10.5072", "production/solr"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        std::fs::write(root.join("production/files/10.5072/data.csv"), "a,b\n1,2\n").unwrap();
        std::fs::write(root.join("production/solr/schema.xml"), "<schema name=\"production\"/>\n")
            .unwrap();

        let database = FakeDatabase::new(DatabaseState {
            settings: settings(&[
                (":SiteName", "Staging"),
                (":DefaultStorageDriverId", "file"),
            ]),
            row_counts: [("dvobject".to_string(), 10), ("filemetadata".to_string(), 4)]
                .into_iter()
                .collect(),
            applied_sql: Vec::new(),
        });
        let production = FakeProduction {
            database: DatabaseState {
                settings: settings(&[
                    (":SiteName", "Production"),
                    (":DefaultStorageDriverId", "file"),
                ]),
                row_counts: [("dvobject".to_string(), 250), ("filemetadata".to_string(), 90)]
                    .into_iter()
                    .collect(),
                applied_sql: Vec::new(),
            },
            parameters: vec![
                p("-Xmx16g"),
                p("-Ddataverse.fqdn=dataverse.example.org"),
                p("-Ddataverse.files.directory=/srv/dataverse/files"),
                p("-Ddoi.baseurlstring=https://mds.datacite.org"),
            ],
            integrations: vec![integration("explorer")],
            version: "6.2".into(),
            corrupt_dump: false,
        };
        let app_server = FakeAppServer {
            state: Arc::new(Mutex::new(AppServerState {
                parameters: local_parameters,
                ..Default::default()
            })),
            version: "6.2".into(),
        };

        Fixture {
            dir,
            database,
            production,
            app_server,
            search: FakeSearch::default(),
            integrations: FakeIntegrations::default(),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn backup_root(&self) -> PathBuf {
        self.root().join("backups")
    }

    /// A configuration pointing at the fixture's directories.
    pub(crate) fn config(&self, overrides: &[(&str, &str)]) -> RunConfiguration {
        let root = self.root();
        let path = |sub: &str| root.join(sub).display().to_string();
        let mut values = sample_values();
        for (key, value) in [
            ("APPSERVER_DIR", path("local/payara")),
            ("APPSERVER_CONFIG_DIR", path("local/config")),
            ("SEARCH_CONF_DIR", path("local/solr")),
            ("CONTENT_DIR", path("local/files")),
            ("PRODUCTION_CONTENT_DIR", path("production/files")),
            ("PRODUCTION_SEARCH_CONF_DIR", path("production/solr")),
            ("BACKUP_DIR", path("backups")),
            ("READINESS_TIMEOUT_SECS", "1".to_string()),
            ("INDEX_TIMEOUT_SECS", "1".to_string()),
        ] {
            values.insert(key.to_string(), value);
        }
        for (key, value) in overrides {
            values.insert(key.to_string(), value.to_string());
        }
        RunConfiguration::from_values(values, root.join("stagesync.env")).unwrap()
    }

    /// Services backed by the fixture's fakes. State is shared, so changes
    /// show up in the fixture's fields.
    pub(crate) fn services(&self) -> Services {
        Services {
            production: Box::new(self.production.clone()),
            database: Box::new(self.database.clone()),
            app_server: Box::new(self.app_server.clone()),
            search: Box::new(self.search.clone()),
            integrations: Box::new(self.integrations.clone()),
        }
    }
}
