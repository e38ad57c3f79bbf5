// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Typed remote commands.

use std::fmt;

use itertools::Itertools;

/// A command to run on a remote host.
///
/// Every argument is passed to the remote side as a separate, escaped word.
/// Values such as hostnames or bucket names must be added with
/// [`RemoteCommand::arg`], never formatted into the program name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    run_as: Option<String>,
    env: Vec<(String, String)>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> RemoteCommand {
        RemoteCommand {
            program: program.into(),
            args: Vec::new(),
            run_as: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> RemoteCommand {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> RemoteCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Runs the command as `user` through `sudo`.
    pub fn run_as(mut self, user: impl Into<String>) -> RemoteCommand {
        self.run_as = Some(user.into());
        self
    }

    /// Sets an environment variable for the remote process only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> RemoteCommand {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Returns the words that are sent over the wire, program first.
    pub fn words(&self) -> Vec<String> {
        let mut words = Vec::new();
        if let Some(user) = &self.run_as {
            words.extend(["sudo".into(), "-u".into(), user.clone(), "--".into()]);
        }
        if !self.env.is_empty() {
            words.push("env".into());
            words.extend(self.env.iter().map(|(k, v)| format!("{k}={v}")));
        }
        words.push(self.program.clone());
        words.extend(self.args.iter().cloned());
        words
    }

    /// Renders the command for logs with environment values redacted.
    pub fn redacted(&self) -> String {
        let mut words = Vec::new();
        if let Some(user) = &self.run_as {
            words.push(format!("sudo -u {user} --"));
        }
        if !self.env.is_empty() {
            words.push("env".into());
            words.extend(self.env.iter().map(|(k, _)| format!("{k}=<redacted>")));
        }
        words.push(self.program.clone());
        words.extend(self.args.iter().cloned());
        words.into_iter().join(" ")
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// The captured result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// The exit status, or `-1` if the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub(crate) fn from_process(output: std::process::Output) -> CommandOutput {
        CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}
