// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Deciding how the clone stores bulk files.
//!
//! Production may keep files on the local filesystem or in an object store.
//! Copying its object-store configuration verbatim would point the clone at
//! production's bucket, so the operator picks a [`StorageChoice`] once per
//! run. The choice is then applied in two places that must agree: the
//! application settings (by the database stage, see [`settings_plan`]) and
//! the tuning parameters (by the reconciler, see [`desired_parameters`]).
//!
//! The functions that decide what to ask are pure; [`resolve`] is the only
//! one that talks to a [`Prompter`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::bail;
use tracing::info;

use crate::prompt::{self, InputRequest, Prompter};
use crate::tuning::{self, STORAGE_DRIVER_PARAMETER, TuningParameter};

/// The reserved setting naming the default storage driver.
pub const DRIVER_SETTING: &str = ":DefaultStorageDriverId";

/// The legacy setting naming an object-store bucket.
pub const BUCKET_SETTING: &str = ":S3BucketName";

/// The driver id of the local filesystem store.
pub const FILE_DRIVER: &str = "file";

/// How many bucket names the operator may enter before the stage gives up.
pub const MAX_BUCKET_ATTEMPTS: usize = 3;

/// Whether a setting configures an object store.
pub fn is_object_storage_setting(name: &str) -> bool {
    name.starts_with(":S3") || name.to_ascii_lowercase().contains("bucket")
}

/// What production's configuration says about object storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageDetection {
    /// Settings that reference an object store.
    pub settings_signal: Vec<String>,
    /// Storage-related tuning parameters.
    pub parameter_signal: Vec<TuningParameter>,
    /// Every bucket name production references.
    pub production_buckets: BTreeSet<String>,
}

impl StorageDetection {
    pub fn uses_object_storage(&self) -> bool {
        !self.settings_signal.is_empty() || !self.parameter_signal.is_empty()
    }

    pub fn is_production_bucket(&self, bucket: &str) -> bool {
        self.production_buckets.contains(bucket.trim())
    }
}

/// Inspects production's settings and tuning parameters. Either signal alone
/// means production uses object storage.
pub fn detect(
    settings: &BTreeMap<String, String>,
    parameters: &[TuningParameter],
) -> StorageDetection {
    let mut detection = StorageDetection::default();
    for (name, value) in settings {
        let fires = if name == DRIVER_SETTING {
            value != FILE_DRIVER
        } else {
            is_object_storage_setting(name)
        };
        if fires {
            detection.settings_signal.push(name.clone());
        }
        if is_object_storage_setting(name) && name.to_ascii_lowercase().contains("bucket") {
            detection.production_buckets.insert(value.trim().to_string());
        }
    }
    for parameter in tuning::storage_parameters(parameters) {
        if parameter.key().ends_with("bucket-name") {
            if let Some(bucket) = parameter.value() {
                detection.production_buckets.insert(bucket.trim().to_string());
            }
        }
        // A driver id of `file` says production does not use object storage.
        if parameter.key() == STORAGE_DRIVER_PARAMETER && parameter.value() == Some(FILE_DRIVER) {
            continue;
        }
        detection.parameter_signal.push(parameter);
    }
    detection
}

/// The parameters of a store dedicated to the clone. Secrets are never
/// entered here; `profile` names a credentials profile on the clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketParameters {
    pub store_id: String,
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageChoice {
    UseNewObjectStore(BucketParameters),
    UseLocalFilesystem,
    InheritSource,
}

impl fmt::Display for StorageChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageChoice::UseNewObjectStore(bucket) => write!(
                f,
                "dedicated object store {:?} (bucket {:?})",
                bucket.store_id, bucket.bucket
            ),
            StorageChoice::UseLocalFilesystem => f.write_str("local filesystem"),
            StorageChoice::InheritSource => f.write_str("inherit production storage"),
        }
    }
}

const OPTION_NEW_STORE: usize = 0;
const OPTION_LOCAL: usize = 1;
const OPTION_INHERIT: usize = 2;

/// The first question: which storage the clone should use.
pub fn choice_request(detection: &StorageDetection) -> InputRequest {
    let (default, reason) = if detection.uses_object_storage() {
        (
            OPTION_NEW_STORE,
            format!(
                "Production uses object storage ({}).",
                detection
                    .settings_signal
                    .iter()
                    .cloned()
                    .chain(detection.parameter_signal.iter().map(|p| p.key()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )
    } else {
        (
            OPTION_LOCAL,
            "Production stores files on the local filesystem.".to_string(),
        )
    };
    InputRequest::choice(
        "storage.choice",
        "How should the clone store files?",
        vec![
            "Configure a dedicated bucket".into(),
            "Use the local filesystem".into(),
            "Inherit production's storage configuration".into(),
        ],
        default,
    )
    .because(reason)
}

pub fn inherit_confirmation() -> InputRequest {
    InputRequest::confirm(
        "storage.inherit",
        "Point the clone at production's storage anyway?",
        false,
    )
    .because("Inheriting production's storage lets the clone read and write live files.")
}

/// The questions describing a dedicated store, in order.
pub fn bucket_requests() -> [InputRequest; 5] {
    [
        InputRequest::text("storage.store_id", "Store id", Some("s3".into()), false),
        InputRequest::text("storage.bucket", "Bucket name", None, false),
        InputRequest::text("storage.region", "Region", None, true),
        InputRequest::text("storage.endpoint_url", "Custom endpoint URL", None, true),
        InputRequest::text(
            "storage.profile",
            "Credentials profile",
            Some("default".into()),
            false,
        ),
    ]
}

/// The second confirmation required when `bucket` is one production uses.
pub fn bucket_conflict(detection: &StorageDetection, bucket: &str) -> Option<InputRequest> {
    detection.is_production_bucket(bucket).then(|| {
        InputRequest::confirm(
            "storage.bucket_conflict",
            format!("Really use production bucket {bucket:?} for the clone?"),
            false,
        )
        .because(format!(
            "Bucket {bucket:?} is referenced by production's configuration. \
             Sharing it risks mixing clone and live data."
        ))
    })
}

/// Asks the operator for the clone's storage choice.
pub fn resolve(
    detection: &StorageDetection,
    prompter: &dyn Prompter,
) -> anyhow::Result<StorageChoice> {
    loop {
        match prompt::choose(prompter, &choice_request(detection))? {
            OPTION_NEW_STORE => return resolve_bucket(detection, prompter),
            OPTION_LOCAL => return Ok(StorageChoice::UseLocalFilesystem),
            OPTION_INHERIT => {
                if prompt::confirm(prompter, &inherit_confirmation())? {
                    return Ok(StorageChoice::InheritSource);
                }
                info!("not inheriting production storage, asking again");
            }
            other => bail!("storage choice {other} out of range"),
        }
    }
}

fn resolve_bucket(
    detection: &StorageDetection,
    prompter: &dyn Prompter,
) -> anyhow::Result<StorageChoice> {
    let [store_id, bucket, region, endpoint_url, profile] = bucket_requests();
    let store_id = required_text(prompter, &store_id)?;
    for attempt in 1..=MAX_BUCKET_ATTEMPTS {
        let name = required_text(prompter, &bucket)?;
        if let Some(conflict) = bucket_conflict(detection, &name) {
            if !prompt::confirm(prompter, &conflict)? {
                info!("bucket {name:?} rejected (attempt {attempt} of {MAX_BUCKET_ATTEMPTS})");
                continue;
            }
        }
        return Ok(StorageChoice::UseNewObjectStore(BucketParameters {
            store_id,
            bucket: name,
            region: prompt::text(prompter, &region)?,
            endpoint_url: prompt::text(prompter, &endpoint_url)?,
            profile: prompt::text(prompter, &profile)?,
        }));
    }
    bail!("no acceptable bucket name after {MAX_BUCKET_ATTEMPTS} attempts")
}

fn required_text(prompter: &dyn Prompter, request: &InputRequest) -> anyhow::Result<String> {
    match prompt::text(prompter, request)? {
        Some(answer) => Ok(answer.trim().to_string()),
        None => bail!("{}: an answer is required", request.key),
    }
}

/// One change to the clone's settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingChange {
    Set { name: String, value: String },
    Delete { name: String },
}

/// Plans the settings changes that make `settings` (the clone's settings
/// after the production database was restored) agree with `choice`.
pub fn settings_plan(
    choice: &StorageChoice,
    settings: &BTreeMap<String, String>,
) -> Vec<SettingChange> {
    let driver = match choice {
        StorageChoice::InheritSource => return Vec::new(),
        StorageChoice::UseLocalFilesystem => FILE_DRIVER,
        StorageChoice::UseNewObjectStore(bucket) => bucket.store_id.as_str(),
    };
    let mut changes: Vec<_> = settings
        .keys()
        .filter(|name| is_object_storage_setting(name))
        .map(|name| SettingChange::Delete { name: name.clone() })
        .collect();
    if settings.get(DRIVER_SETTING).map(String::as_str) != Some(driver) {
        changes.push(SettingChange::Set {
            name: DRIVER_SETTING.into(),
            value: driver.into(),
        });
    }
    changes
}

/// The storage-related tuning parameters the clone must end up with.
pub fn desired_parameters(
    choice: &StorageChoice,
    production: &[TuningParameter],
) -> Vec<TuningParameter> {
    match choice {
        StorageChoice::UseLocalFilesystem => {
            vec![TuningParameter::property(STORAGE_DRIVER_PARAMETER, FILE_DRIVER)]
        }
        StorageChoice::UseNewObjectStore(bucket) => {
            let prefix = format!("dataverse.files.{}", bucket.store_id);
            let mut parameters = vec![
                TuningParameter::property(&format!("{prefix}.type"), "s3"),
                TuningParameter::property(&format!("{prefix}.label"), &bucket.store_id),
                TuningParameter::property(&format!("{prefix}.bucket-name"), &bucket.bucket),
            ];
            if let Some(region) = &bucket.region {
                parameters.push(TuningParameter::property(
                    &format!("{prefix}.custom-endpoint-region"),
                    region,
                ));
            }
            if let Some(url) = &bucket.endpoint_url {
                parameters.push(TuningParameter::property(
                    &format!("{prefix}.custom-endpoint-url"),
                    url,
                ));
            }
            if let Some(profile) = &bucket.profile {
                parameters.push(TuningParameter::property(&format!("{prefix}.profile"), profile));
            }
            parameters.push(TuningParameter::property(
                STORAGE_DRIVER_PARAMETER,
                &bucket.store_id,
            ));
            parameters
        }
        StorageChoice::InheritSource => {
            let mut seen = BTreeSet::new();
            tuning::storage_parameters(production)
                .into_iter()
                .filter(|p| seen.insert(p.key()))
                .collect()
        }
    }
}

/// Local storage-related parameters that contradict the choice and are
/// offered for removal.
pub fn removal_candidates(
    choice: &StorageChoice,
    local: &[TuningParameter],
) -> Vec<TuningParameter> {
    if *choice != StorageChoice::UseLocalFilesystem {
        return Vec::new();
    }
    tuning::storage_parameters(local)
        .into_iter()
        .filter(|p| p.key() != STORAGE_DRIVER_PARAMETER)
        .collect()
}

pub fn removal_request(candidates: &[TuningParameter]) -> InputRequest {
    InputRequest::confirm(
        "storage.remove_parameters",
        format!(
            "Remove {} storage-related tuning parameter(s) from the clone?",
            candidates.len()
        ),
        true,
    )
    .because(format!(
        "The clone uses the local filesystem but still has: {}",
        candidates
            .iter()
            .map(TuningParameter::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedPrompter;
    use crate::prompt::InputResponse;

    fn p(option: &str) -> TuningParameter {
        TuningParameter::parse(option).unwrap()
    }

    fn settings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn either_signal_detects_object_storage() {
        let by_setting = detect(&settings(&[(DRIVER_SETTING, "s3")]), &[]);
        assert!(by_setting.uses_object_storage());

        let by_parameter = detect(
            &BTreeMap::new(),
            &[p("-Ddataverse.files.s3.bucket-name=prod-files")],
        );
        assert!(by_parameter.uses_object_storage());
        assert!(by_parameter.is_production_bucket("prod-files"));

        let neither = detect(
            &settings(&[(DRIVER_SETTING, "file"), (":SiteUrl", "https://x")]),
            &[p("-Xmx4g"), p("-Ddataverse.files.storage-driver-id=file")],
        );
        assert!(!neither.uses_object_storage());
    }

    #[test]
    fn default_follows_detection() {
        let object = detect(&settings(&[(BUCKET_SETTING, "prod")]), &[]);
        let local = StorageDetection::default();
        let default_of = |d: &StorageDetection| match choice_request(d).kind {
            crate::prompt::InputKind::Choice { default, .. } => default,
            _ => unreachable!(),
        };
        assert_eq!(default_of(&object), OPTION_NEW_STORE);
        assert_eq!(default_of(&local), OPTION_LOCAL);
    }

    #[test]
    fn production_bucket_needs_second_confirmation() {
        let detection = detect(
            &BTreeMap::new(),
            &[p("-Ddataverse.files.s3.bucket-name=prod-files")],
        );
        assert!(bucket_conflict(&detection, "staging-files").is_none());
        let request = bucket_conflict(&detection, "prod-files").unwrap();
        assert_eq!(request.default_response(), Some(InputResponse::Confirm(false)));
    }

    #[test]
    fn declined_conflict_asks_for_another_bucket() {
        let detection = detect(
            &BTreeMap::new(),
            &[p("-Ddataverse.files.s3.bucket-name=prod-files")],
        );
        let prompter = ScriptedPrompter::new()
            .answer("storage.choice", InputResponse::Choice(OPTION_NEW_STORE))
            .answer("storage.bucket", InputResponse::Text("prod-files".into()))
            .answer("storage.bucket_conflict", InputResponse::Confirm(false))
            .answer("storage.bucket", InputResponse::Text("staging-files".into()));
        let choice = resolve(&detection, &prompter).unwrap();
        let StorageChoice::UseNewObjectStore(bucket) = choice else {
            panic!("expected a dedicated store, got {choice:?}");
        };
        assert_eq!(bucket.bucket, "staging-files");
        assert_eq!(bucket.store_id, "s3");
        assert_eq!(bucket.profile.as_deref(), Some("default"));
        assert_eq!(bucket.region, None);
    }

    #[test]
    fn gives_up_after_repeated_conflicts() {
        let detection = detect(&settings(&[(BUCKET_SETTING, "prod-files")]), &[]);
        let mut prompter = ScriptedPrompter::new()
            .answer("storage.choice", InputResponse::Choice(OPTION_NEW_STORE));
        for _ in 0..MAX_BUCKET_ATTEMPTS {
            prompter = prompter
                .answer("storage.bucket", InputResponse::Text("prod-files".into()))
                .answer("storage.bucket_conflict", InputResponse::Confirm(false));
        }
        let err = resolve(&detection, &prompter).unwrap_err();
        assert!(err.to_string().contains("no acceptable bucket name"));
    }

    #[test]
    fn local_filesystem_plan_removes_object_storage_settings() {
        let restored = settings(&[
            (DRIVER_SETTING, "s3"),
            (BUCKET_SETTING, "prod-files"),
            (":S3AccessKeyProfile", "prod"),
            (":SiteUrl", "https://dataverse.example.org"),
        ]);
        let plan = settings_plan(&StorageChoice::UseLocalFilesystem, &restored);
        assert_eq!(
            plan,
            vec![
                SettingChange::Delete {
                    name: ":S3AccessKeyProfile".into()
                },
                SettingChange::Delete {
                    name: BUCKET_SETTING.into()
                },
                SettingChange::Set {
                    name: DRIVER_SETTING.into(),
                    value: FILE_DRIVER.into()
                },
            ]
        );
        assert!(settings_plan(&StorageChoice::InheritSource, &restored).is_empty());
    }

    #[test]
    fn dedicated_store_parameters_are_complete() {
        let choice = StorageChoice::UseNewObjectStore(BucketParameters {
            store_id: "s3clone".into(),
            bucket: "staging-files".into(),
            region: Some("eu-west-1".into()),
            endpoint_url: None,
            profile: Some("staging".into()),
        });
        let options: Vec<_> = desired_parameters(&choice, &[])
            .iter()
            .map(|p| p.option().to_string())
            .collect();
        assert_eq!(
            options,
            vec![
                "-Ddataverse.files.s3clone.type=s3",
                "-Ddataverse.files.s3clone.label=s3clone",
                "-Ddataverse.files.s3clone.bucket-name=staging-files",
                "-Ddataverse.files.s3clone.custom-endpoint-region=eu-west-1",
                "-Ddataverse.files.s3clone.profile=staging",
                "-Ddataverse.files.storage-driver-id=s3clone",
            ]
        );
    }

    #[test]
    fn only_local_choice_offers_removal() {
        let local = vec![
            p("-Ddataverse.files.s3.bucket-name=prod-files"),
            p("-Ddataverse.files.storage-driver-id=s3"),
            p("-Xmx4g"),
        ];
        assert_eq!(
            removal_candidates(&StorageChoice::UseLocalFilesystem, &local),
            vec![p("-Ddataverse.files.s3.bucket-name=prod-files")]
        );
        assert!(removal_candidates(&StorageChoice::InheritSource, &local).is_empty());
    }

    #[test]
    fn dedicated_store_is_removed_completely() {
        let previous = StorageChoice::UseNewObjectStore(BucketParameters {
            store_id: "s3clone".into(),
            bucket: "staging".into(),
            region: Some("eu-west-1".into()),
            endpoint_url: None,
            profile: Some("staging".into()),
        });
        let mut local = desired_parameters(&previous, &[]);
        local.push(p("-Xmx4g"));
        local.push(p("-Ddataverse.files.directory=/srv/files"));

        let candidates = removal_candidates(&StorageChoice::UseLocalFilesystem, &local);
        assert_eq!(
            candidates,
            vec![
                p("-Ddataverse.files.s3clone.type=s3"),
                p("-Ddataverse.files.s3clone.label=s3clone"),
                p("-Ddataverse.files.s3clone.bucket-name=staging"),
                p("-Ddataverse.files.s3clone.custom-endpoint-region=eu-west-1"),
                p("-Ddataverse.files.s3clone.profile=staging"),
            ]
        );

        let remaining: Vec<_> = local
            .iter()
            .filter(|p| !candidates.contains(p))
            .cloned()
            .collect();
        assert_eq!(
            tuning::storage_parameters(&remaining),
            vec![p("-Ddataverse.files.storage-driver-id=s3clone")]
        );
        let desired = desired_parameters(&StorageChoice::UseLocalFilesystem, &[]);
        assert_eq!(
            tuning::overwrite_plan(&remaining, &desired),
            vec![
                tuning::ParameterChange::Delete(p("-Ddataverse.files.storage-driver-id=s3clone")),
                tuning::ParameterChange::Create(p("-Ddataverse.files.storage-driver-id=file")),
            ]
        );
    }

    #[test]
    fn removal_request_masks_secrets() {
        let request = removal_request(&[
            p("-Ddataverse.files.s3.bucket-name=prod-files"),
            p("-Ddataverse.files.s3.secret-key=PRODSECRET123"),
        ]);
        let reason = request.reason.unwrap();
        assert!(reason.contains("-Ddataverse.files.s3.bucket-name=prod-files"));
        assert!(reason.contains("-Ddataverse.files.s3.secret-key=********"));
        assert!(!reason.contains("PRODSECRET123"));
    }
}
