// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Synchronizes a production installation onto the staging host this runs on.

use std::collections::BTreeSet;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use chrono::Utc;
use clap::Parser;
use owo_colors::OwoColorize;
use stagesync::config::{DEFAULT_CONFIG_FILE, RunConfiguration};
use stagesync::context::{RunContext, RunFlags};
use stagesync::error::SyncError;
use stagesync::lock::RunLock;
use stagesync::orchestrator::{self, Orchestrator};
use stagesync::pipeline::StageId;
use stagesync::prompt::TerminalPrompter;
use stagesync::{compare, host, log, report};
use tracing::{error, info};

#[derive(Parser, Debug, Clone)]
#[clap(name = "stagesync", next_line_help = true, version)]
struct Args {
    /// The configuration file. Defaults to `stagesync.env` next to the binary.
    #[clap(long, env = "STAGESYNC_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    // === Run shape. ===
    /// Report what would change without changing anything.
    #[clap(long)]
    dry_run: bool,
    /// Log debug output.
    #[clap(long)]
    verbose: bool,
    /// Log trace output, including every remote command.
    #[clap(long)]
    debug: bool,
    /// Copy every file, ignoring FILE_SIZE_LIMIT_MB.
    #[clap(long)]
    full_copy: bool,
    /// Apply the SQL files in DDL_DIR after restoring the database.
    #[clap(long)]
    configure_ddl: bool,
    /// Proceed even if the configuration still has template placeholders.
    #[clap(long)]
    skip_template_check: bool,
    /// Do not back up the clone first. Failures cannot be rolled back.
    #[clap(long)]
    skip_backup: bool,

    // === Stage selection. ===
    #[clap(long)]
    skip_database: bool,
    #[clap(long)]
    skip_files: bool,
    #[clap(long)]
    skip_search_index: bool,
    #[clap(long)]
    skip_auxiliary_processor: bool,
    #[clap(long)]
    skip_tuning_parameters: bool,
    #[clap(long)]
    skip_external_integrations: bool,
    #[clap(long)]
    skip_post_setup: bool,

    // === Other modes. ===
    /// Delete backups older than seven days and exit.
    #[clap(long)]
    cleanup_backups: bool,
    /// Restore the clone from a backup directory, or from the newest backup.
    #[clap(long, value_name = "PATH", num_args = 0..=1)]
    restore: Option<Option<PathBuf>>,
    /// Show how production's configuration differs from the clone's and exit.
    #[clap(long)]
    compare_configs: bool,
}

impl Args {
    fn flags(&self) -> RunFlags {
        let skips = [
            (self.skip_database, StageId::Database),
            (self.skip_files, StageId::Files),
            (self.skip_search_index, StageId::SearchIndex),
            (self.skip_auxiliary_processor, StageId::AuxiliaryProcessor),
            (self.skip_tuning_parameters, StageId::TuningParameters),
            (self.skip_external_integrations, StageId::ExternalIntegrations),
            (self.skip_post_setup, StageId::PostSetup),
        ];
        RunFlags {
            dry_run: self.dry_run,
            full_copy: self.full_copy,
            configure_ddl: self.configure_ddl,
            skip_backup: self.skip_backup,
            skip_template_check: self.skip_template_check,
            skip: skips
                .into_iter()
                .filter_map(|(skipped, stage)| skipped.then_some(stage))
                .collect::<BTreeSet<_>>(),
        }
    }

    fn config_path(&self) -> PathBuf {
        if let Some(path) = &self.config {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_CONFIG_FILE)))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

/// What to print once the run is over.
enum Outcome {
    Summary,
    Quiet,
}

fn main() {
    let args = Args::parse();
    let config_path = args.config_path();
    let config = RunConfiguration::load(&config_path);

    let log_file = match &config {
        Ok(config) => config.log_file(),
        Err(_) => beside(&config_path, "stagesync.log"),
    };
    let log_problem = log::init(&log_file, args.verbose, args.debug);

    let mut ctx = RunContext::new(args.flags());
    if let Some(problem) = log_problem {
        ctx.warn(problem);
    }

    let result = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(run(&args, config, &mut ctx)),
        Err(e) => Err(SyncError::Other(
            anyhow::Error::new(e).context("starting async runtime"),
        )),
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("stagesync: fatal: {err:#}");
            ctx.fail(format!("{err:#}"));
            if std::io::stderr().is_terminal() {
                eprintln!("{} {err:#}", "ERROR:".red().bold());
            } else {
                eprintln!("ERROR: {err:#}");
            }
            Outcome::Summary
        }
    };
    if let Outcome::Summary = outcome {
        report::print(&ctx);
    }
    process::exit(if ctx.failed() { 1 } else { 0 });
}

fn beside(path: &Path, file: &str) -> PathBuf {
    path.parent()
        .map(|dir| dir.join(file))
        .unwrap_or_else(|| PathBuf::from(file))
}

async fn run(
    args: &Args,
    config: Result<RunConfiguration, stagesync::config::ConfigError>,
    ctx: &mut RunContext,
) -> Result<Outcome, SyncError> {
    let config = config?;
    info!("configuration loaded from {}", config.source().display());
    for key in config.provisional_keys() {
        info!("{key} unset, using the local value");
    }
    if args.skip_template_check {
        if !config.placeholders().is_empty() {
            ctx.warn("template placeholders left in the configuration; check skipped by request");
        }
    } else {
        config.check_placeholders()?;
    }

    if args.cleanup_backups {
        let purged = orchestrator::cleanup(&config, Utc::now());
        println!("Purged {} expired backup(s).", purged.len());
        for path in purged {
            println!("  {}", path.display());
        }
        return Ok(Outcome::Quiet);
    }

    let _lock = RunLock::acquire(&config.lock_file())?;
    let services = host::connect(&config).await?;
    let prompter = TerminalPrompter;
    let orchestrator = Orchestrator::new(&config, &services, &prompter);

    if args.compare_configs {
        let diff = orchestrator.compare().await?;
        println!("{}", compare::render(&diff));
        return Ok(Outcome::Quiet);
    }
    if let Some(directory) = &args.restore {
        orchestrator.restore(ctx, directory.as_deref()).await?;
        return Ok(Outcome::Summary);
    }
    orchestrator.sync(ctx).await?;
    Ok(Outcome::Summary)
}
