//! Expansion of `{input}`, `{inputN}`, `{output}` and `{font}` tokens.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::command::CommandForm;
use crate::error::{PipelineResult, ProcessError};

/// `{word}` tokens; a leading `%` marks ffmpeg's own `%{...}` expansion.
static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(%?)\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is valid"));

pub const FONT_TOKEN: &str = "{font}";

/// Values available to a template for one request.
#[derive(Debug, Clone)]
pub struct Placeholders {
    inputs: Vec<PathBuf>,
    output: PathBuf,
    font: Option<PathBuf>,
}

impl Placeholders {
    pub fn new(inputs: Vec<PathBuf>, output: PathBuf, font: Option<PathBuf>) -> Self {
        Self {
            inputs,
            output,
            font,
        }
    }

    fn lookup(&self, name: &str) -> Option<&Path> {
        match name {
            "input" => self.inputs.first().map(PathBuf::as_path),
            "output" => Some(self.output.as_path()),
            "font" => self.font.as_deref(),
            _ => {
                let index: usize = name.strip_prefix("input")?.parse().ok()?;
                index
                    .checked_sub(1)
                    .and_then(|i| self.inputs.get(i))
                    .map(PathBuf::as_path)
            }
        }
    }

    /// Substitute every token in `form`.
    ///
    /// Argument lists are expanded per element so a path can never merge two
    /// arguments. Substituted text is never rescanned.
    pub fn resolve(&self, form: &CommandForm) -> PipelineResult<CommandForm> {
        require_output(form)?;

        match form {
            CommandForm::Shell(line) => Ok(CommandForm::Shell(self.expand(line, true)?)),
            CommandForm::Argv(args) => args
                .iter()
                .map(|arg| self.expand(arg, false))
                .collect::<PipelineResult<Vec<_>>>()
                .map(CommandForm::Argv),
        }
    }

    fn expand(&self, template: &str, quote: bool) -> PipelineResult<String> {
        for caps in TOKEN.captures_iter(template) {
            if caps[1].is_empty() && self.lookup(&caps[2]).is_none() {
                return Err(ProcessError::UnknownPlaceholder {
                    token: caps[2].to_string(),
                });
            }
        }

        let expanded = TOKEN.replace_all(template, |caps: &Captures<'_>| {
            if !caps[1].is_empty() {
                return caps[0].to_string();
            }
            match self.lookup(&caps[2]) {
                Some(path) if quote => shell_quote(&path.to_string_lossy()).into_owned(),
                Some(path) => path.to_string_lossy().into_owned(),
                None => caps[0].to_string(),
            }
        });
        Ok(expanded.into_owned())
    }
}

/// Fail unless `form` has a bare `{output}`; `%{output}` does not count.
pub fn require_output(form: &CommandForm) -> PipelineResult<()> {
    let has_output = |text: &str| {
        TOKEN
            .captures_iter(text)
            .any(|caps| caps[1].is_empty() && &caps[2] == "output")
    };
    let found = match form {
        CommandForm::Shell(line) => has_output(line),
        CommandForm::Argv(args) => args.iter().any(|arg| has_output(arg)),
    };
    if found {
        Ok(())
    } else {
        Err(ProcessError::MissingOutputToken)
    }
}

/// Single-quote `text` for `sh` unless it is made only of inert characters.
pub fn shell_quote(text: &str) -> Cow<'_, str> {
    let inert = |c: char| c.is_ascii_alphanumeric() || "_./:+@%=,-".contains(c);
    if !text.is_empty() && text.chars().all(inert) {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("'{}'", text.replace('\'', r"'\''")))
    }
}
