// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Run-wide state shared by every stage.

use std::collections::BTreeSet;

use tracing::warn;

use crate::backup::BackupManifest;
use crate::pipeline::{StageId, StageResult, StageResults};
use crate::rollback::{FailurePoint, RestoreOutcome, RestoreTarget};
use crate::storage::StorageChoice;
use crate::tuning::{DuplicateKey, TuningParameter};

/// Flags that shape a run. Fixed once the run starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub dry_run: bool,
    pub full_copy: bool,
    pub configure_ddl: bool,
    pub skip_backup: bool,
    pub skip_template_check: bool,
    pub skip: BTreeSet<StageId>,
}

impl RunFlags {
    pub fn is_skipped(&self, stage: StageId) -> bool {
        self.skip.contains(&stage)
    }
}

/// What the storage resolver and the tuning-parameter reconciler observed.
/// The storage section of the report is built from this alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageFindings {
    pub production_uses_object_storage: Option<bool>,
    pub production_parameters: Vec<TuningParameter>,
    pub local_parameters: Vec<TuningParameter>,
    pub production_duplicates: Vec<DuplicateKey>,
    pub local_duplicates: Vec<DuplicateKey>,
    /// Storage-related parameters the operator chose to keep on the clone.
    pub retained_parameters: Vec<TuningParameter>,
}

/// The explicit state of one run, passed by reference to every component.
#[derive(Debug)]
pub struct RunContext {
    flags: RunFlags,
    results: StageResults,
    warnings: Vec<String>,
    mutated: BTreeSet<StageId>,
    storage_choice: Option<StorageChoice>,
    findings: StorageFindings,
    manifest: Option<BackupManifest>,
    rollback: Option<FailurePoint>,
    restorations: Vec<(RestoreTarget, RestoreOutcome)>,
    fatal: Option<String>,
}

impl RunContext {
    pub fn new(flags: RunFlags) -> RunContext {
        RunContext {
            flags,
            results: StageResults::default(),
            warnings: Vec::new(),
            mutated: BTreeSet::new(),
            storage_choice: None,
            findings: StorageFindings::default(),
            manifest: None,
            rollback: None,
            restorations: Vec::new(),
            fatal: None,
        }
    }

    pub fn flags(&self) -> &RunFlags {
        &self.flags
    }

    /// Appends a degraded-condition warning to the run summary.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.warnings.push(message);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn results(&self) -> &StageResults {
        &self.results
    }

    pub(crate) fn record(&mut self, stage: StageId, result: StageResult) {
        if !self.results.record(stage, result) {
            warn!(
                "{stage}: ignoring second result {result}, already {}",
                self.results.get(stage)
            );
        }
    }

    pub(crate) fn refine(&mut self, stage: StageId, result: StageResult) {
        self.results.refine(stage, result);
    }

    /// Notes that `stage` is about to change the clone.
    pub fn mark_mutated(&mut self, stage: StageId) {
        self.mutated.insert(stage);
    }

    pub fn has_mutated(&self, stage: StageId) -> bool {
        self.mutated.contains(&stage)
    }

    pub fn any_mutated(&self) -> bool {
        !self.mutated.is_empty()
    }

    pub fn storage_choice(&self) -> Option<&StorageChoice> {
        self.storage_choice.as_ref()
    }

    pub fn set_storage_choice(&mut self, choice: StorageChoice) {
        self.storage_choice = Some(choice);
    }

    pub fn findings(&self) -> &StorageFindings {
        &self.findings
    }

    pub fn findings_mut(&mut self) -> &mut StorageFindings {
        &mut self.findings
    }

    pub fn manifest(&self) -> Option<&BackupManifest> {
        self.manifest.as_ref()
    }

    pub fn set_manifest(&mut self, manifest: BackupManifest) {
        self.manifest = Some(manifest);
    }

    /// The failure point the rollback manager was invoked with, if any.
    pub fn rollback(&self) -> Option<FailurePoint> {
        self.rollback
    }

    pub fn restorations(&self) -> &[(RestoreTarget, RestoreOutcome)] {
        &self.restorations
    }

    /// Records the error that ended the run.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.fatal = Some(message.into());
    }

    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    /// Whether the run as a whole failed. A contained failure is still one.
    pub fn failed(&self) -> bool {
        self.fatal.is_some() || self.results.any_failed()
    }

    pub(crate) fn record_rollback(
        &mut self,
        point: FailurePoint,
        restorations: Vec<(RestoreTarget, RestoreOutcome)>,
    ) {
        self.rollback = Some(point);
        self.restorations = restorations;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_keep_order() {
        let mut ctx = RunContext::new(RunFlags::default());
        ctx.warn("first");
        ctx.warn(String::from("second"));
        assert_eq!(ctx.warnings(), ["first", "second"]);
    }

    #[test]
    fn tracks_mutated_stages() {
        let mut ctx = RunContext::new(RunFlags::default());
        assert!(!ctx.any_mutated());
        ctx.mark_mutated(StageId::Files);
        assert!(ctx.has_mutated(StageId::Files));
        assert!(!ctx.has_mutated(StageId::Database));
        assert!(ctx.any_mutated());
    }
}
