//! Launching the external tool under a wall-clock limit.
//!
//! Each child is started as the leader of a new process group. A
//! [`ProcessGroupGuard`] kills the whole group when it goes out of scope, so
//! a timeout, a finished run, or an abandoned request all leave no stray
//! descendants behind.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::command::CommandForm;
use crate::error::{PipelineResult, ProcessError};
use crate::placeholder::shell_quote;

const SHELL: &str = "/bin/sh";

/// Outcome of one tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub output_file_path: PathBuf,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs `<program> -y <args>` either directly or through `sh -c`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn build(&self, form: &CommandForm) -> Command {
        let mut cmd = match form {
            CommandForm::Argv(args) => {
                let mut cmd = Command::new(&self.program);
                cmd.arg("-y").args(args);
                cmd
            }
            CommandForm::Shell(line) => {
                let program = self.program.to_string_lossy();
                let mut cmd = Command::new(SHELL);
                cmd.arg("-c")
                    .arg(format!("exec {} -y {}", shell_quote(&program), line));
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        cmd
    }

    /// Run `form` with `cwd` as working directory.
    ///
    /// A non-zero exit is reported in the result, not as an error. Only a
    /// failure to start the process at all is an `Err`.
    pub async fn run(
        &self,
        form: &CommandForm,
        cwd: &Path,
        output_file_path: &Path,
    ) -> PipelineResult<ProcessResult> {
        let mut cmd = self.build(form);
        cmd.current_dir(cwd);

        let mode = if form.is_shell() { "shell" } else { "argv" };
        info!(program = %self.program.display(), mode, "Launching tool");

        let child = cmd.spawn().map_err(|source| launch_error(&self.program, form, source))?;
        let mut guard = child.id().map(ProcessGroupGuard::new);
        debug!(pid = ?child.id(), "Child spawned");

        let mut result = ProcessResult {
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            output_file_path: output_file_path.to_path_buf(),
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                // The leader is reaped; its pid is free for reuse once the group empties.
                if let Some(guard) = guard.as_mut() {
                    guard.disarm_if_empty();
                }
                let (exit_code, signal) = split_status(output.status);
                result.exit_code = exit_code;
                result.signal = signal;
                result.stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                result.stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                info!(exit_code = ?exit_code, signal = ?signal, "Tool exited");
                if let Some(source) = shell_launch_failure(form, exit_code) {
                    return Err(ProcessError::LaunchError {
                        program: program_name(&self.program),
                        source,
                    });
                }
            }
            Ok(Err(e)) => {
                return Err(ProcessError::LaunchError {
                    program: program_name(&self.program),
                    source: e,
                });
            }
            Err(_) => {
                warn!(seconds = self.timeout.as_secs(), "Tool timed out, killing process group");
                result.timed_out = true;
            }
        }
        Ok(result)
    }
}

fn launch_error(program: &Path, form: &CommandForm, source: io::Error) -> ProcessError {
    let program = match form {
        CommandForm::Argv(_) => program_name(program),
        CommandForm::Shell(_) => SHELL.to_string(),
    };
    ProcessError::LaunchError { program, source }
}

/// `sh` reports an `exec` it could not perform as 127 (not found) or 126.
fn shell_launch_failure(form: &CommandForm, exit_code: Option<i32>) -> Option<io::Error> {
    match (form, exit_code) {
        (CommandForm::Shell(_), Some(127)) => Some(io::Error::from(io::ErrorKind::NotFound)),
        (CommandForm::Shell(_), Some(126)) => Some(io::Error::from(io::ErrorKind::PermissionDenied)),
        _ => None,
    }
}

fn program_name(program: &Path) -> String {
    program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string_lossy().into_owned())
}

fn split_status(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

/// Sends SIGKILL to a whole process group when dropped.
#[derive(Debug)]
pub struct ProcessGroupGuard {
    pgid: Pid,
    armed: bool,
}

impl ProcessGroupGuard {
    pub fn new(leader: u32) -> Self {
        Self {
            pgid: Pid::from_raw(leader as i32),
            armed: true,
        }
    }

    /// Stop guarding a group with no members left. Returns whether still armed.
    ///
    /// While any member lives the pgid cannot be handed out again, so a
    /// non-empty group stays armed and its stragglers are killed on drop.
    pub fn disarm_if_empty(&mut self) -> bool {
        if let Err(nix::errno::Errno::ESRCH) = killpg(self.pgid, None::<Signal>) {
            self.armed = false;
        }
        self.armed
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) => debug!(pgid = %self.pgid, "Killed process group"),
            // Nothing left in the group.
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!(pgid = %self.pgid, error = %e, "Failed to kill process group"),
        }
    }
}
