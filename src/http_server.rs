//! HTTP server implementation using Axum.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{multipart::Field, DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream, Stream, TryStreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::command::{CommandSpec, ExecutionMode};
use crate::error::ProcessError;
use crate::pipeline::Artifact;
use crate::state::AppState;
use crate::workspace::Workspace;

const SERVICE_NAME: &str = "mediabox";
const STREAM_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
}

impl IntoResponse for ProcessError {
    fn into_response(self) -> Response {
        let (exit_code, stderr) = match &self {
            ProcessError::ProcessingFailed {
                exit_code, stderr, ..
            } => (*exit_code, stderr.clone()),
            _ => (None, None),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind(),
                message: self.to_string(),
                exit_code,
                stderr,
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct ProcessSummary {
    success: bool,
    message: &'static str,
    output_size_bytes: u64,
    output_extension: String,
    input_files_count: usize,
}

/// Build the router; split out so tests can drive it without a socket.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = state.config().body_limit();

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/process", post(process_file))
        .route("/process-json", post(process_json))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let config = state.config();
    info!(
        workspace_root = %config.workspace_root().display(),
        max_file_size_mb = config.max_file_size_mb,
        timeout_secs = config.ffmpeg_timeout_seconds,
        ffmpeg = %config.ffmpeg_bin.display(),
        "Configuration loaded"
    );

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": SERVICE_NAME }))
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "name": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /process": "Upload files and process them with ffmpeg; returns the output file",
            "POST /process-json": "Same as /process but returns a JSON summary",
            "GET /health": "Health check"
        },
        "usage": {
            "fields": {
                "files": "One or more files",
                "command": "ffmpeg arguments as a shell string or a JSON array of strings",
                "output_extension": "Optional output extension, e.g. mp4",
                "execution_mode": "auto (default), json or shell"
            },
            "placeholders": {
                "{input}": "First uploaded file ({input1} is an alias)",
                "{inputN}": "N-th uploaded file",
                "{output}": "Output file path (required)",
                "{font}": "Bundled font"
            },
            "examples": [
                {
                    "description": "Scale to 720p",
                    "command": "-i {input} -vf scale=-1:720 -c:v libx264 {output}"
                },
                {
                    "description": "Extract audio as MP3",
                    "command": "-i {input} -vn -acodec mp3 -ab 192k {output}"
                },
                {
                    "description": "Mux video and audio (argument list, no shell)",
                    "command": ["-i", "{input}", "-i", "{input2}", "-c:v", "copy", "-c:a", "aac",
                                "-map", "0:v:0", "-map", "1:a:0", "{output}"]
                },
                {
                    "description": "Watermark text",
                    "command": "-i {input} -vf drawtext=fontfile={font}:text='WaterMark':fontcolor=white:fontsize=48 -c:v libx264 {output}"
                }
            ]
        }
    }))
}

async fn process_file(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ProcessError> {
    let artifact = run_request(&state, multipart).await?;

    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name);
    let body = Body::from_stream(file_stream(artifact.file));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, artifact.content_type.to_string()),
            (header::CONTENT_LENGTH, artifact.size_bytes.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn process_json(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ProcessSummary>, ProcessError> {
    let artifact = run_request(&state, multipart).await?;
    Ok(Json(ProcessSummary {
        success: true,
        message: "Processing completed successfully",
        output_size_bytes: artifact.size_bytes,
        output_extension: artifact.extension,
        input_files_count: artifact.input_count,
    }))
}

async fn run_request(state: &AppState, multipart: Multipart) -> Result<Artifact, ProcessError> {
    let processor = &state.processor;
    let mut workspace = processor.workspaces().create().await?;
    let spec = match receive_form(state, &mut workspace, multipart).await {
        Ok(spec) => spec,
        Err(err) => {
            info!(workspace = %workspace.id(), kind = err.kind(), error = %err, "Upload rejected");
            workspace.destroy().await;
            return Err(err);
        }
    };
    processor.execute(workspace, &spec).await
}

/// Save every `files` part into the workspace and collect the text fields.
async fn receive_form(
    state: &AppState,
    workspace: &mut Workspace,
    mut multipart: Multipart,
) -> Result<CommandSpec, ProcessError> {
    let config = state.config();
    let mut command = None;
    let mut output_extension = None;
    let mut execution_mode = ExecutionMode::Auto;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, config.max_file_size_mb))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" | "file" => {
                if workspace.input_files().len() >= config.max_files {
                    return Err(ProcessError::invalid_request(format!(
                        "at most {} files may be uploaded",
                        config.max_files
                    )));
                }
                let file_name = field.file_name().unwrap_or_default().to_string();
                let limit_mb = config.max_file_size_mb;
                let saved = workspace
                    .save_input(&file_name, field_chunks(field, limit_mb))
                    .await?;
                debug!(bytes = saved.size_bytes, "Received upload");
            }
            "command" => command = Some(read_text(field, config.max_file_size_mb).await?),
            "output_extension" => {
                let value = read_text(field, config.max_file_size_mb).await?;
                output_extension = Some(value).filter(|v| !v.trim().is_empty());
            }
            "execution_mode" => {
                execution_mode = read_text(field, config.max_file_size_mb).await?.parse()?;
            }
            other => debug!(field = other, "Ignoring unknown form field"),
        }
    }

    Ok(CommandSpec {
        raw_payload: command.ok_or_else(|| ProcessError::invalid_request("command is required"))?,
        execution_mode,
        output_extension,
    })
}

fn field_chunks(
    field: Field<'_>,
    limit_mb: u64,
) -> impl Stream<Item = Result<axum::body::Bytes, ProcessError>> + Unpin + '_ {
    Box::pin(field.map_err(move |e| multipart_error(e, limit_mb)))
}

async fn read_text(field: Field<'_>, limit_mb: u64) -> Result<String, ProcessError> {
    field.text().await.map_err(|e| multipart_error(e, limit_mb))
}

fn multipart_error(err: axum::extract::multipart::MultipartError, limit_mb: u64) -> ProcessError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ProcessError::PayloadTooLarge {
            file_name: "request body".to_string(),
            limit_mb,
        }
    } else {
        ProcessError::invalid_request(format!("malformed multipart body: {}", err.body_text()))
    }
}

/// Stream an already-open file in fixed-size chunks.
fn file_stream(file: tokio::fs::File) -> impl Stream<Item = std::io::Result<Vec<u8>>> {
    stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; STREAM_CHUNK_BYTES];
        let read = file.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some((buf, file)))
    })
}
