//! CI log parsing.
//!
//! Splits raw workflow job logs into per-command sections. A job log looks
//! like:
//!
//! ```text
//! 2021-09-01T12:00:00.1234567Z ##[group]Run cs workers models build
//! 2021-09-01T12:00:00.1234567Z cs workers models build
//! 2021-09-01T12:00:00.1234567Z shell: /usr/bin/bash -e {0}
//! 2021-09-01T12:00:00.1234567Z ##[endgroup]
//! 2021-09-01T12:00:01.1234567Z Step 1/12 : FROM continuumio/miniconda3
//! ```
//!
//! Only groups whose command is in [`COMMANDS`] produce a section; the text
//! after a known group's `##[endgroup]` up to the next `##[group]` is that
//! command's output.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static TIMESTAMP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\u{feff}?\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z ?").unwrap()
});

const GROUP_START: &str = "##[group]";
const GROUP_END: &str = "##[endgroup]";

/// Pipeline command a log section belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineCommand {
    Build,
    Test,
    Push,
}

impl PipelineCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Push => "push",
        }
    }
}

/// Commands the publishing workflow runs. A command matches when the line
/// starts with it and continues with whitespace or nothing.
pub const COMMANDS: &[(&str, PipelineCommand)] = &[
    ("cs workers models build", PipelineCommand::Build),
    ("cs workers models test", PipelineCommand::Test),
    ("cs workers models push", PipelineCommand::Push),
];

/// Output of one known pipeline command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogSection {
    pub cmd: String,
    pub stage: PipelineCommand,
    pub logs: String,
}

/// Remove the leading ISO-8601 timestamp GitHub prefixes to every log line.
pub fn strip_timestamp(line: &str) -> &str {
    match TIMESTAMP_REGEX.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

fn classify(line: &str) -> Option<(String, PipelineCommand)> {
    let cmd = line.trim();
    let cmd = cmd.strip_prefix("Run ").unwrap_or(cmd).trim();
    COMMANDS
        .iter()
        .find(|(prefix, _)| {
            cmd.strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
        })
        .map(|(_, stage)| (cmd.to_string(), *stage))
}

fn is_group_metadata(line: &str) -> bool {
    let trimmed = line.trim_start();
    line.starts_with(char::is_whitespace)
        || trimmed.starts_with("shell:")
        || trimmed.starts_with("env:")
        || trimmed.is_empty()
}

#[derive(Default)]
struct Pending {
    command: Option<(String, PipelineCommand)>,
    first_line_seen: bool,
    output: Vec<String>,
}

impl Pending {
    fn flush(&mut self, sections: &mut Vec<LogSection>) {
        if let Some((cmd, stage)) = self.command.take() {
            while self.output.last().is_some_and(|l| l.trim().is_empty()) {
                self.output.pop();
            }
            sections.push(LogSection {
                cmd,
                stage,
                logs: self.output.join("\n"),
            });
        }
        *self = Pending::default();
    }
}

/// Parse a raw job log into sections for the known pipeline commands.
pub fn parse_logs(raw: &str) -> Vec<LogSection> {
    let mut sections = Vec::new();
    let mut pending = Pending::default();
    let mut in_group = false;

    for raw_line in raw.lines() {
        let line = strip_timestamp(raw_line.trim_end_matches('\r'));

        if let Some(header) = line.strip_prefix(GROUP_START) {
            pending.flush(&mut sections);
            in_group = true;
            pending.command = classify(header);
            pending.first_line_seen = pending.command.is_some();
            continue;
        }
        if line.starts_with(GROUP_END) {
            in_group = false;
            continue;
        }
        if in_group {
            // Header did not name a command; fall back to the first script line.
            if !pending.first_line_seen && !is_group_metadata(line) {
                pending.first_line_seen = true;
                pending.command = classify(line);
            }
            continue;
        }
        if pending.command.is_some() {
            pending.output.push(line.to_string());
        }
    }
    pending.flush(&mut sections);

    sections
}
