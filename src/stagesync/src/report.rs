// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The run summary.
//!
//! Rendered once per process from the recorded [`RunContext`]; nothing here
//! talks to a live system.

use std::fmt::Write;

use owo_colors::OwoColorize;

use crate::context::RunContext;
use crate::pipeline::StageResult;
use crate::tuning::{DuplicateKey, TuningParameter};

fn colorize(result: StageResult, color: bool) -> String {
    let label = format!("{:<22}", result.label());
    if !color {
        return label;
    }
    match result {
        StageResult::Success => label.green().to_string(),
        StageResult::DryRun | StageResult::Skipped => label.cyan().to_string(),
        StageResult::NotAttempted => label.dimmed().to_string(),
        StageResult::FailedRolledBack => label.yellow().to_string(),
        StageResult::Failed | StageResult::FailedNoBackup => label.red().to_string(),
        StageResult::FailedRollbackFailed => label.red().bold().to_string(),
    }
}

fn write_parameters(out: &mut String, host: &str, parameters: &[TuningParameter]) {
    let storage: Vec<_> = parameters.iter().filter(|p| p.is_storage_related()).collect();
    if storage.is_empty() {
        let _ = writeln!(out, "  {host}: no storage-related tuning parameters");
        return;
    }
    let _ = writeln!(out, "  {host}:");
    for parameter in storage {
        let _ = writeln!(out, "    {parameter}");
    }
}

fn write_duplicates(out: &mut String, host: &str, duplicates: &[DuplicateKey]) {
    for duplicate in duplicates {
        let options: Vec<_> = duplicate.options.iter().map(TuningParameter::to_string).collect();
        let _ = writeln!(
            out,
            "  duplicate key on {host}: {} ({})",
            duplicate.key,
            options.join(", ")
        );
    }
}

/// Renders the summary of `ctx`.
pub fn render(ctx: &RunContext, color: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== stagesync summary ===");
    if ctx.flags().dry_run {
        let _ = writeln!(out, "(dry run: nothing was changed)");
    }

    let _ = writeln!(out, "\nStages:");
    for (stage, result) in ctx.results().iter() {
        let _ = writeln!(out, "  {stage:<22} {}", colorize(result, color).trim_end());
    }

    if let Some(point) = ctx.rollback() {
        let _ = writeln!(out, "\nRollback ({point}):");
        if ctx.restorations().is_empty() {
            let _ = writeln!(out, "  nothing to restore");
        }
        for (target, outcome) in ctx.restorations() {
            let _ = writeln!(out, "  {target}: {outcome}");
        }
    }

    if let Some(manifest) = ctx.manifest() {
        let _ = writeln!(out, "\nBackup: {}", manifest.directory().display());
    }

    let _ = writeln!(out, "\nWarnings:");
    if ctx.warnings().is_empty() {
        let _ = writeln!(out, "  none");
    }
    for warning in ctx.warnings() {
        let _ = writeln!(out, "  - {warning}");
    }

    let findings = ctx.findings();
    let _ = writeln!(out, "\nStorage configuration:");
    match findings.production_uses_object_storage {
        Some(true) => {
            let _ = writeln!(out, "  production uses object storage");
        }
        Some(false) => {
            let _ = writeln!(out, "  production uses the local filesystem");
        }
        None => {
            let _ = writeln!(out, "  production storage not inspected");
        }
    }
    if let Some(choice) = ctx.storage_choice() {
        let _ = writeln!(out, "  clone: {choice}");
    }
    write_parameters(&mut out, "production", &findings.production_parameters);
    write_parameters(&mut out, "clone", &findings.local_parameters);
    for parameter in &findings.retained_parameters {
        let _ = writeln!(out, "  kept on clone by request: {parameter}");
    }
    write_duplicates(&mut out, "production", &findings.production_duplicates);
    write_duplicates(&mut out, "clone", &findings.local_duplicates);

    if let Some(fatal) = ctx.fatal() {
        let _ = writeln!(out, "\nFatal: {fatal}");
    }
    let outcome = if ctx.failed() { "FAILURE" } else { "SUCCESS" };
    let _ = writeln!(out, "\nResult: {outcome}");
    out
}

/// Prints the summary to stdout.
pub fn print(ctx: &RunContext) {
    use std::io::IsTerminal;
    println!("{}", render(ctx, std::io::stdout().is_terminal()));
}
