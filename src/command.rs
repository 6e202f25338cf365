//! Turning a raw command payload into a [`CommandForm`] and screening it.
//!
//! The denylist here is advisory. It catches the obvious shell injection
//! shapes for operator-supplied templates and is not a security boundary for
//! untrusted callers: redirection (`<`, `>`) and globbing pass through in
//! shell form. Argument-list form never touches a shell and is the safer way
//! to submit commands.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineResult, ProcessError};

/// How the `command` payload should be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Try a JSON array first, fall back to a shell string.
    #[default]
    Auto,
    Json,
    Shell,
}

impl FromStr for ExecutionMode {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "json" => Ok(Self::Json),
            "shell" => Ok(Self::Shell),
            other => Err(ProcessError::invalid_request(format!(
                "unknown execution_mode '{other}', expected auto, json or shell"
            ))),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Json => "json",
            Self::Shell => "shell",
        })
    }
}

/// A command decided once by [`interpret`]; later stages match on the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandForm {
    /// Handed to `sh -c` after the tool name.
    Shell(String),
    /// Passed to the tool as discrete arguments, no shell involved.
    Argv(Vec<String>),
}

impl CommandForm {
    /// Whether any part of the command contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        match self {
            Self::Shell(line) => line.contains(needle),
            Self::Argv(args) => args.iter().any(|arg| arg.contains(needle)),
        }
    }

    pub fn is_shell(&self) -> bool {
        matches!(self, Self::Shell(_))
    }
}

/// Raw user input for one request, before interpretation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub raw_payload: String,
    pub execution_mode: ExecutionMode,
    pub output_extension: Option<String>,
}

/// Characters and sequences rejected anywhere in a resolved command.
///
/// Newlines are included because `sh -c` treats them exactly like `;`.
const DENIED_SEQUENCES: &[&str] = &["$(", ";", "&", "|", "`", "$", "\n", "\r"];

/// Arguments rejected when they appear as a whole token.
const DENIED_ARGUMENTS: &[&str] = &["-filter_complex_script", "pipe:"];

/// Decide between argument-list and shell form.
pub fn interpret(raw_payload: &str, mode: ExecutionMode) -> PipelineResult<CommandForm> {
    if raw_payload.trim().is_empty() {
        return Err(ProcessError::invalid_request("command is required"));
    }
    let raw_payload = raw_payload.trim();

    let form = match mode {
        ExecutionMode::Json => CommandForm::Argv(parse_argv(raw_payload)?),
        ExecutionMode::Shell => CommandForm::Shell(raw_payload.to_string()),
        ExecutionMode::Auto => match parse_argv(raw_payload) {
            Ok(args) => CommandForm::Argv(args),
            Err(err) => {
                debug!(error = %err, "payload is not a JSON argument list, using shell form");
                CommandForm::Shell(raw_payload.to_string())
            }
        },
    };

    if let CommandForm::Argv(args) = &form {
        if args.is_empty() {
            return Err(ProcessError::InvalidCommandFormat {
                reason: "argument list is empty".to_string(),
            });
        }
    }

    Ok(form)
}

fn parse_argv(raw_payload: &str) -> PipelineResult<Vec<String>> {
    serde_json::from_str::<Vec<String>>(raw_payload.trim()).map_err(|err| {
        ProcessError::InvalidCommandFormat {
            reason: err.to_string(),
        }
    })
}

/// Screen the raw payload before it is interpreted, whatever the mode.
pub fn screen_payload(raw_payload: &str) -> PipelineResult<()> {
    check_sequences(raw_payload.trim())
}

/// Reject a resolved command that hits the denylist.
pub fn validate(form: &CommandForm) -> PipelineResult<()> {
    let tokens: Vec<String> = match form {
        CommandForm::Shell(line) => {
            check_sequences(line)?;
            // Split the way sh will, so quoted fragments are joined first.
            shell_words::split(line).map_err(|err| {
                warn!(error = %err, "rejected shell line that does not tokenize");
                ProcessError::UnsafeCommand {
                    pattern: "unbalanced quoting".to_string(),
                }
            })?
        }
        CommandForm::Argv(args) => {
            for arg in args {
                check_sequences(arg)?;
            }
            args.clone()
        }
    };

    for token in &tokens {
        if let Some(blocked) = DENIED_ARGUMENTS.iter().find(|blocked| **blocked == token.as_str()) {
            warn!(pattern = *blocked, "rejected blocked argument");
            return Err(ProcessError::UnsafeCommand {
                pattern: (*blocked).to_string(),
            });
        }
    }
    Ok(())
}

fn check_sequences(text: &str) -> PipelineResult<()> {
    match DENIED_SEQUENCES.iter().find(|seq| text.contains(**seq)) {
        Some(seq) => {
            warn!(pattern = ?seq, "rejected command containing denylisted sequence");
            Err(ProcessError::UnsafeCommand {
                pattern: (*seq).to_string(),
            })
        }
        None => Ok(()),
    }
}
