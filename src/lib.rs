//! mediabox - run ffmpeg command templates against uploaded files.
//!
//! Each request gets its own workspace directory. The command is
//! interpreted as an argument list or a shell string, placeholders are
//! expanded to workspace paths, the result is screened against a denylist
//! and the tool runs under a wall-clock limit.

#[cfg(not(unix))]
compile_error!("mediabox relies on Unix process groups and only builds on Unix.");

pub mod command;
pub mod config;
pub mod error;
pub mod http_server;
pub mod output;
pub mod pipeline;
pub mod placeholder;
pub mod runner;
pub mod state;
pub mod workspace;

pub use command::{CommandForm, CommandSpec, ExecutionMode};
pub use config::Config;
pub use error::{PipelineResult, ProcessError};
pub use pipeline::{Artifact, Processor};
pub use state::AppState;
