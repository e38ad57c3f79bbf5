// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Interactive input.
//!
//! Decision logic never reads from the terminal. It builds an [`InputRequest`]
//! describing what it needs and why, and a [`Prompter`] turns that into an
//! [`InputResponse`]. Without a terminal, every request resolves to its
//! default.

use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::bail;
use tracing::info;

/// The shape of the answer a request expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    Confirm { default: bool },
    Choice { options: Vec<String>, default: usize },
    Text { default: Option<String>, optional: bool },
}

/// A question for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRequest {
    /// A stable identifier for the question.
    pub key: &'static str,
    pub question: String,
    /// Why the question is being asked, shown before it.
    pub reason: Option<String>,
    pub kind: InputKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputResponse {
    Confirm(bool),
    Choice(usize),
    /// Free text. Empty for a skipped optional answer.
    Text(String),
}

impl InputRequest {
    pub fn confirm(key: &'static str, question: impl Into<String>, default: bool) -> InputRequest {
        InputRequest {
            key,
            question: question.into(),
            reason: None,
            kind: InputKind::Confirm { default },
        }
    }

    pub fn choice(
        key: &'static str,
        question: impl Into<String>,
        options: Vec<String>,
        default: usize,
    ) -> InputRequest {
        InputRequest {
            key,
            question: question.into(),
            reason: None,
            kind: InputKind::Choice { options, default },
        }
    }

    pub fn text(
        key: &'static str,
        question: impl Into<String>,
        default: Option<String>,
        optional: bool,
    ) -> InputRequest {
        InputRequest {
            key,
            question: question.into(),
            reason: None,
            kind: InputKind::Text { default, optional },
        }
    }

    pub fn because(mut self, reason: impl Into<String>) -> InputRequest {
        self.reason = Some(reason.into());
        self
    }

    /// The answer used when nobody is there to give one.
    pub fn default_response(&self) -> Option<InputResponse> {
        match &self.kind {
            InputKind::Confirm { default } => Some(InputResponse::Confirm(*default)),
            InputKind::Choice { default, .. } => Some(InputResponse::Choice(*default)),
            InputKind::Text { default: Some(d), .. } => Some(InputResponse::Text(d.clone())),
            InputKind::Text { optional: true, .. } => Some(InputResponse::Text(String::new())),
            InputKind::Text { .. } => None,
        }
    }

    /// Interprets one line of operator input. `None` means ask again.
    pub fn interpret(&self, line: &str) -> Option<InputResponse> {
        let line = line.trim();
        if line.is_empty() {
            return self.default_response();
        }
        match &self.kind {
            InputKind::Confirm { .. } => match line.to_ascii_lowercase().as_str() {
                "y" | "yes" => Some(InputResponse::Confirm(true)),
                "n" | "no" => Some(InputResponse::Confirm(false)),
                _ => None,
            },
            InputKind::Choice { options, .. } => {
                let n: usize = line.parse().ok()?;
                (1..=options.len())
                    .contains(&n)
                    .then(|| InputResponse::Choice(n - 1))
            }
            InputKind::Text { .. } => Some(InputResponse::Text(line.to_string())),
        }
    }
}

/// Collects answers to [`InputRequest`]s.
pub trait Prompter: Send + Sync {
    fn ask(&self, request: &InputRequest) -> anyhow::Result<InputResponse>;
}

/// Asks a yes/no question.
pub fn confirm(prompter: &dyn Prompter, request: &InputRequest) -> anyhow::Result<bool> {
    match prompter.ask(request)? {
        InputResponse::Confirm(answer) => Ok(answer),
        other => bail!("{}: expected a yes/no answer, got {other:?}", request.key),
    }
}

/// Asks for one of several options, returning its index.
pub fn choose(prompter: &dyn Prompter, request: &InputRequest) -> anyhow::Result<usize> {
    match prompter.ask(request)? {
        InputResponse::Choice(idx) => Ok(idx),
        other => bail!("{}: expected a choice, got {other:?}", request.key),
    }
}

/// Asks for free text. Returns `None` for a skipped optional answer.
pub fn text(prompter: &dyn Prompter, request: &InputRequest) -> anyhow::Result<Option<String>> {
    match prompter.ask(request)? {
        InputResponse::Text(answer) if answer.is_empty() => Ok(None),
        InputResponse::Text(answer) => Ok(Some(answer)),
        other => bail!("{}: expected text, got {other:?}", request.key),
    }
}

/// Asks on the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    fn render(request: &InputRequest) -> String {
        let mut out = String::new();
        if let Some(reason) = &request.reason {
            out.push_str(reason);
            out.push('\n');
        }
        match &request.kind {
            InputKind::Confirm { default } => {
                let hint = if *default { "[Y/n]" } else { "[y/N]" };
                out.push_str(&format!("{} {hint} ", request.question));
            }
            InputKind::Choice { options, default } => {
                out.push_str(&request.question);
                out.push('\n');
                for (idx, option) in options.iter().enumerate() {
                    let marker = if idx == *default { " (default)" } else { "" };
                    out.push_str(&format!("  {}) {option}{marker}\n", idx + 1));
                }
                out.push_str("> ");
            }
            InputKind::Text { default, optional } => {
                out.push_str(&request.question);
                match (default, optional) {
                    (Some(d), _) => out.push_str(&format!(" [{d}]")),
                    (None, true) => out.push_str(" (optional)"),
                    (None, false) => {}
                }
                out.push_str(": ");
            }
        }
        out
    }
}

impl Prompter for TerminalPrompter {
    fn ask(&self, request: &InputRequest) -> anyhow::Result<InputResponse> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return match request.default_response() {
                Some(response) => {
                    info!("{}: no terminal, using default {response:?}", request.key);
                    Ok(response)
                }
                None => bail!("{}: an answer is required but no terminal is attached", request.key),
            };
        }

        loop {
            print!("{}", TerminalPrompter::render(request));
            io::stdout().flush()?;
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                bail!("{}: input closed", request.key);
            }
            match request.interpret(&line) {
                Some(response) => return Ok(response),
                None => println!("Please answer again."),
            }
        }
    }
}
