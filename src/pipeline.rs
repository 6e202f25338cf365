//! Request orchestration: from a workspace full of inputs to an artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tracing::{info, warn};

use crate::command::{self, CommandSpec};
use crate::config::Config;
use crate::error::{PipelineResult, ProcessError};
use crate::output;
use crate::placeholder::{self, Placeholders, FONT_TOKEN};
use crate::runner::{ProcessResult, ProcessRunner};
use crate::workspace::{Workspace, WorkspaceManager};

/// Longest stderr tail returned to callers.
const STDERR_TAIL_CHARS: usize = 4000;

/// The finished output, opened before its workspace was removed.
#[derive(Debug)]
pub struct Artifact {
    pub file: File,
    pub size_bytes: u64,
    pub file_name: String,
    pub extension: String,
    pub content_type: &'static str,
    pub input_count: usize,
}

/// Runs the interpret → resolve → validate → execute pipeline for one request.
#[derive(Debug, Clone)]
pub struct Processor {
    config: Arc<Config>,
    workspaces: WorkspaceManager,
    runner: ProcessRunner,
}

impl Processor {
    pub fn new(config: Arc<Config>) -> Self {
        let workspaces = WorkspaceManager::new(config.workspace_root(), config.max_file_bytes());
        let runner = ProcessRunner::new(config.ffmpeg_bin.clone(), config.timeout());
        Self {
            config,
            workspaces,
            runner,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Process the inputs already saved in `workspace`, then remove it.
    ///
    /// The workspace is destroyed exactly once whichever stage fails. The
    /// returned artifact holds an open handle, so it stays readable after
    /// its directory is gone.
    pub async fn execute(&self, mut workspace: Workspace, spec: &CommandSpec) -> PipelineResult<Artifact> {
        let outcome = self.run_stages(&mut workspace, spec).await;
        if let Err(err) = &outcome {
            if err.is_client_error() {
                info!(workspace = %workspace.id(), kind = err.kind(), error = %err, "Request rejected");
            } else {
                warn!(workspace = %workspace.id(), kind = err.kind(), error = %err, "Processing failed");
            }
        }
        workspace.destroy().await;
        outcome
    }

    async fn run_stages(&self, workspace: &mut Workspace, spec: &CommandSpec) -> PipelineResult<Artifact> {
        if workspace.input_files().is_empty() {
            return Err(ProcessError::invalid_request("no files uploaded"));
        }
        if spec.raw_payload.trim().is_empty() {
            return Err(ProcessError::invalid_request("command is required"));
        }

        let original_names: Vec<String> = workspace
            .input_files()
            .iter()
            .map(|file| file.original_name.clone())
            .collect();
        let extension = output::resolve_extension(
            spec.output_extension.as_deref(),
            &spec.raw_payload,
            original_names.first().map(String::as_str),
        );
        let output_path = workspace.allocate_output_path(&extension);

        command::screen_payload(&spec.raw_payload)?;
        let form = command::interpret(&spec.raw_payload, spec.execution_mode)?;
        info!(
            workspace = %workspace.id(),
            mode = %spec.execution_mode,
            shell = form.is_shell(),
            inputs = original_names.len(),
            "Interpreted command"
        );

        placeholder::require_output(&form)?;
        let font = if form.contains(FONT_TOKEN) {
            Some(workspace.stage_font(&self.config.font_path).await?)
        } else {
            None
        };
        let inputs: Vec<PathBuf> = workspace
            .input_files()
            .iter()
            .map(|file| file.saved_path.clone())
            .collect();
        let resolved = Placeholders::new(inputs, output_path.clone(), font).resolve(&form)?;
        command::validate(&resolved)?;

        let result = self
            .runner
            .run(&resolved, workspace.root_dir(), &output_path)
            .await?;
        check_result(&result, workspace.root_dir(), self.runner.timeout().as_secs())?;

        let (file, size_bytes) = open_output(&result.output_file_path).await?;
        Ok(Artifact {
            file,
            size_bytes,
            file_name: output::download_name(&original_names, &extension),
            content_type: output::content_type(&extension),
            extension,
            input_count: original_names.len(),
        })
    }
}

fn check_result(result: &ProcessResult, workspace_dir: &Path, timeout_secs: u64) -> PipelineResult<()> {
    if result.timed_out {
        return Err(ProcessError::Timeout {
            seconds: timeout_secs,
        });
    }
    if result.success() {
        return Ok(());
    }

    let message = match (result.exit_code, result.signal) {
        (Some(code), _) => format!("ffmpeg exited with code {code}"),
        (None, Some(signal)) => format!("ffmpeg was killed by signal {signal}"),
        (None, None) => "ffmpeg terminated abnormally".to_string(),
    };
    Err(ProcessError::ProcessingFailed {
        message,
        exit_code: result.exit_code,
        stderr: Some(scrub_stderr(&result.stderr, workspace_dir)),
    })
}

async fn open_output(path: &Path) -> PipelineResult<(File, u64)> {
    let missing = || ProcessError::ProcessingFailed {
        message: "ffmpeg completed but output file was not created".to_string(),
        exit_code: Some(0),
        stderr: None,
    };
    let file = File::open(path).await.map_err(|_| missing())?;
    let size = file
        .metadata()
        .await
        .map_err(|e| ProcessError::storage("stat output file", path, e))?
        .len();
    if size == 0 {
        return Err(ProcessError::ProcessingFailed {
            message: "ffmpeg completed but output file is empty".to_string(),
            exit_code: Some(0),
            stderr: None,
        });
    }
    Ok((file, size))
}

/// Replace the workspace path with `.` and keep only the tail.
pub fn scrub_stderr(stderr: &str, workspace_dir: &Path) -> String {
    let dir = workspace_dir.to_string_lossy();
    let scrubbed = stderr.replace(&format!("{dir}/"), "./").replace(&*dir, ".");
    let count = scrubbed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return scrubbed;
    }
    scrubbed.chars().skip(count - STDERR_TAIL_CHARS).collect()
}
