// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tracing setup: progress to stdout, everything to the run log.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// The run log is rotated at startup once it grows past this size.
pub const ROTATE_BYTES: u64 = 10 * 1024 * 1024;

/// The filter directive for the requested verbosity.
pub fn filter(verbose: bool, debug: bool) -> &'static str {
    match (verbose, debug) {
        (_, true) => "stagesync=trace,stagesync_ssh_util=trace,stagesync_postgres_util=trace",
        (true, false) => "stagesync=debug,stagesync_ssh_util=debug,stagesync_postgres_util=debug",
        (false, false) => "stagesync=info,stagesync_ssh_util=info,stagesync_postgres_util=info",
    }
}

/// Renames `path` to `<path>.1` if it is larger than [`ROTATE_BYTES`],
/// replacing any earlier rotation. Returns the rotated path if it rotated.
pub fn rotate(path: &Path) -> io::Result<Option<PathBuf>> {
    let size = match std::fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if size <= ROTATE_BYTES {
        return Ok(None);
    }
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".1");
    let rotated = PathBuf::from(rotated);
    std::fs::rename(path, &rotated)?;
    Ok(Some(rotated))
}

fn open_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Installs the global subscriber. If the run log cannot be opened, logs go
/// to stdout only and the reason is returned for the caller to report.
pub fn init(log_file: &Path, verbose: bool, debug: bool) -> Option<String> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time();

    let opened = rotate(log_file).and_then(|_| open_log(log_file));
    match opened {
        Ok(file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_ansi(false);
            let _ = tracing_subscriber::registry()
                .with(EnvFilter::new(filter(verbose, debug)))
                .with(stdout_layer)
                .with(file_layer)
                .try_init();
            None
        }
        Err(e) => {
            let _ = tracing_subscriber::registry()
                .with(EnvFilter::new(filter(verbose, debug)))
                .with(stdout_layer)
                .try_init();
            Some(format!("cannot write run log {}: {e}", log_file.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_only_large_logs() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("stagesync.log");
        assert_eq!(rotate(&log).unwrap(), None);

        std::fs::write(&log, "small\n").unwrap();
        assert_eq!(rotate(&log).unwrap(), None);
        assert!(log.exists());

        let file = File::create(&log).unwrap();
        file.set_len(ROTATE_BYTES + 1).unwrap();
        let rotated = rotate(&log).unwrap().unwrap();
        assert_eq!(rotated, dir.path().join("stagesync.log.1"));
        assert!(!log.exists());
        assert_eq!(std::fs::metadata(&rotated).unwrap().len(), ROTATE_BYTES + 1);
    }

    #[test]
    fn verbosity_selects_filter() {
        assert!(filter(false, false).starts_with("stagesync=info"));
        assert!(filter(true, false).starts_with("stagesync=debug"));
        assert!(filter(true, true).starts_with("stagesync=trace"));
    }
}
