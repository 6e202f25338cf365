//! mediabox - ffmpeg processing over HTTP.
//!
//! Usage:
//!   mediabox serve [--port 8000]
//!   mediabox run --input clip.mp4 --command "-i {input} {output}" --out result.mp4

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mediabox::{http_server, AppState, CommandSpec, Config, ExecutionMode, ProcessError, Processor};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mediabox")]
#[command(about = "Run ffmpeg command templates against uploaded files", version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value = "8000")]
        port: u16,

        #[command(flatten)]
        config: Config,
    },
    /// Process local files once and write the result
    Run {
        /// Input file; repeat for {input2}, {input3}, ...
        #[arg(long = "input", required = true)]
        inputs: Vec<PathBuf>,

        /// Command template
        #[arg(long, allow_hyphen_values = true)]
        command: String,

        /// auto, json or shell
        #[arg(long, default_value = "auto")]
        mode: String,

        /// Output extension, e.g. mp4
        #[arg(long)]
        output_extension: Option<String>,

        /// Where to write the result
        #[arg(long)]
        out: PathBuf,

        #[command(flatten)]
        config: Config,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve { port, config } => {
            if let Err(e) = http_server::run_server(port, AppState::new(config)).await {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Commands::Run {
            inputs,
            command,
            mode,
            output_extension,
            out,
            config,
        } => match run_once(config, inputs, command, &mode, output_extension, &out).await {
            Ok(bytes) => {
                eprintln!("Wrote {} bytes to {}", bytes, out.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error [{}]: {}", e.kind(), e);
                if let ProcessError::ProcessingFailed {
                    stderr: Some(stderr),
                    ..
                } = &e
                {
                    eprint!("{}", stderr);
                }
                ExitCode::FAILURE
            }
        },
    }
}

async fn run_once(
    config: Config,
    inputs: Vec<PathBuf>,
    command: String,
    mode: &str,
    output_extension: Option<String>,
    out: &Path,
) -> Result<u64, ProcessError> {
    let spec = CommandSpec {
        raw_payload: command,
        execution_mode: mode.parse::<ExecutionMode>()?,
        output_extension,
    };

    let processor = Processor::new(Arc::new(config));
    let mut workspace = processor.workspaces().create().await?;
    for input in &inputs {
        if let Err(e) = workspace.save_input_from_path(input).await {
            workspace.destroy().await;
            return Err(e);
        }
    }

    let mut artifact = processor.execute(workspace, &spec).await?;
    let mut dest = tokio::fs::File::create(out)
        .await
        .map_err(|e| ProcessError::storage("create result file", out, e))?;
    tokio::io::copy(&mut artifact.file, &mut dest)
        .await
        .map_err(|e| ProcessError::storage("write result file", out, e))
}
