//! End-to-end tests for the upload/process endpoints.
//!
//! ffmpeg is replaced by a small shell script that concatenates every `-i`
//! input into its last argument. Flags `--fail`, `--hang` and `--no-output`
//! make it misbehave on request.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use mediabox::{http_server, AppState, Config};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "mediabox-test-boundary";

struct Harness {
    tmp: TempDir,
    config: Config,
}

impl Harness {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let tool = tmp.path().join("fake-ffmpeg");
        let calls = tmp.path().join("calls.log");
        let script = format!(
            r#"#!/bin/sh
echo "$@" >> "{calls}"
out=""
for arg in "$@"; do out="$arg"; done
case " $* " in
  *" --fail "*) echo "bad input $PWD/input_1.mp4" >&2; exit 3 ;;
  *" --hang "*) exec sleep 30 ;;
  *" --no-output "*) exit 0 ;;
esac
: > "$out"
take=0
for arg in "$@"; do
  if [ "$take" = 1 ]; then cat "$arg" >> "$out"; fi
  take=0
  if [ "$arg" = "-i" ]; then take=1; fi
done
"#,
            calls = calls.display()
        );
        std::fs::write(&tool, script).expect("write tool");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let font = tmp.path().join("OpenSans.ttf");
        std::fs::write(&font, b"not really a font").expect("write font");

        let config = Config {
            temp_dir: Some(tmp.path().join("scratch")),
            ffmpeg_bin: tool,
            font_path: font,
            ffmpeg_timeout_seconds: 10,
            ..Config::default()
        };
        Self { tmp, config }
    }

    fn workspace_root(&self) -> PathBuf {
        self.config.workspace_root()
    }

    fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(self.workspace_root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    fn tool_calls(&self) -> usize {
        std::fs::read_to_string(self.tmp.path().join("calls.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }

    async fn send(&self, uri: &str, form: Form) -> Response {
        http_server::router(AppState::new(self.config.clone()))
            .oneshot(form.into_request(uri))
            .await
            .expect("response")
    }
}

#[derive(Default)]
struct Form {
    body: Vec<u8>,
}

impl Form {
    fn file(mut self, name: &str, content: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(content);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                .as_bytes(),
        );
        self
    }

    fn into_request(mut self, uri: &str) -> Request<Body> {
        self.body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(self.body))
            .expect("request")
    }
}

async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body")
        .to_vec()
}

async fn json_body(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

#[tokio::test]
async fn single_file_round_trip_cleans_up() {
    let harness = Harness::new();
    let form = Form::default()
        .file("clip.mp4", b"video-bytes")
        .text("command", "-i {input} -vf scale=-1:720 -c:v libx264 {output}")
        .text("output_extension", ".mp4")
        .text("execution_mode", "auto");

    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_TYPE), "video/mp4");
    assert_eq!(
        header_str(&response, header::CONTENT_DISPOSITION),
        "attachment; filename=\"clip_processed.mp4\""
    );
    assert_eq!(body_bytes(response).await, b"video-bytes");
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn json_argument_list_maps_inputs_in_order() {
    let harness = Harness::new();
    let command = r#"["-i","{input}","-i","{input2}","-c:v","copy","-c:a","aac","-map","0:v:0","-map","1:a:0","{output}"]"#;
    for mode in ["json", "auto"] {
        let form = Form::default()
            .file("video.mp4", b"V")
            .file("audio.mp3", b"A")
            .text("command", command)
            .text("execution_mode", mode);

        let response = harness.send("/process", form).await;
        assert_eq!(response.status(), StatusCode::OK, "mode {mode}");
        assert_eq!(
            header_str(&response, header::CONTENT_DISPOSITION),
            "attachment; filename=\"processed.mp4\""
        );
        assert_eq!(body_bytes(response).await, b"VA");
    }
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn injected_separator_never_launches() {
    let harness = Harness::new();
    for mode in ["auto", "json", "shell"] {
        let form = Form::default()
            .file("clip.mp4", b"x")
            .text("command", "-i {input}; rm -rf /")
            .text("execution_mode", mode);

        let response = harness.send("/process", form).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["kind"], "UnsafeCommand");
    }
    assert_eq!(harness.tool_calls(), 0);
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn placeholder_errors_are_client_errors() {
    let harness = Harness::new();

    let form = Form::default()
        .file("a.mp4", b"a")
        .file("b.mp4", b"b")
        .text("command", "-i {input} -i {input3} {output}");
    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["kind"], "UnknownPlaceholder");

    let form = Form::default()
        .file("a.mp4", b"a")
        .text("command", "-i {input} out.mp4");
    let response = harness.send("/process", form).await;
    assert_eq!(json_body(response).await["error"]["kind"], "MissingOutputToken");

    let form = Form::default()
        .file("a.mp4", b"a")
        .text("command", "-i {input} {output}")
        .text("execution_mode", "json");
    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["kind"], "InvalidCommandFormat");

    assert_eq!(harness.tool_calls(), 0);
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn failing_tool_reports_scrubbed_stderr() {
    let harness = Harness::new();
    let form = Form::default()
        .file("clip.mp4", b"x")
        .text("command", "-i {input} --fail {output}");

    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["error"]["kind"], "ProcessingFailed");
    assert_eq!(body["error"]["exit_code"], 3);
    let stderr = body["error"]["stderr"].as_str().expect("stderr");
    assert!(stderr.contains("./input_1.mp4"), "{stderr}");
    assert!(!stderr.contains(&harness.tmp.path().display().to_string()));
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn missing_output_is_processing_failure() {
    let harness = Harness::new();
    let form = Form::default()
        .file("clip.mp4", b"x")
        .text("command", "-i {input} --no-output {output}");

    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["error"]["kind"], "ProcessingFailed");
}

#[tokio::test]
async fn slow_tool_times_out() {
    let mut harness = Harness::new();
    harness.config.ffmpeg_timeout_seconds = 1;
    let form = Form::default()
        .file("clip.mp4", b"x")
        .text("command", "-i {input} --hang {output}");

    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json_body(response).await["error"]["kind"], "Timeout");
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let mut harness = Harness::new();
    harness.config.max_file_size_mb = 1;
    let big = vec![0u8; 1024 * 1024 + 1];
    let form = Form::default()
        .file("big.mp4", &big)
        .text("command", "-i {input} {output}");

    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json_body(response).await["error"]["kind"], "PayloadTooLarge");
    assert_eq!(harness.tool_calls(), 0);
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn missing_binary_is_launch_error() {
    let mut harness = Harness::new();
    harness.config.ffmpeg_bin = harness.tmp.path().join("absent-ffmpeg");
    let form = Form::default()
        .file("clip.mp4", b"x")
        .text("command", r#"["-i","{input}","{output}"]"#);

    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["error"]["kind"], "LaunchError");
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn font_is_staged_into_the_workspace() {
    let harness = Harness::new();
    let form = Form::default()
        .file("clip.mp4", b"x")
        .text(
            "command",
            r#"["-i","{input}","-vf","drawtext=fontfile={font}:text='Mark'","{output}"]"#,
        );
    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::OK);

    let calls = std::fs::read_to_string(harness.tmp.path().join("calls.log")).expect("calls");
    let staged = harness.workspace_root();
    assert!(calls.contains(&format!("drawtext=fontfile={}", staged.display())));
    assert!(calls.contains("/OpenSans.ttf:text='Mark'"));
}

#[tokio::test]
async fn missing_font_asset_is_storage_error() {
    let mut harness = Harness::new();
    harness.config.font_path = harness.tmp.path().join("missing.ttf");
    let form = Form::default()
        .file("clip.mp4", b"x")
        .text("command", "-i {input} -vf drawtext=fontfile={font} {output}");

    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["error"]["kind"], "StorageError");
    assert_eq!(harness.leftover_workspaces(), 0);

    let form = Form::default()
        .file("clip.mp4", b"x")
        .text("command", "-i {input} -vf drawtext=fontfile={font} out.mp4");
    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["kind"], "MissingOutputToken");
}

#[tokio::test]
async fn quoted_blocked_argument_never_launches() {
    let harness = Harness::new();
    let form = Form::default()
        .file("clip.mp4", b"x")
        .text("command", "-i {input} -filter_complex_scrip't' /etc/passwd {output}")
        .text("execution_mode", "shell");

    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["kind"], "UnsafeCommand");
    assert_eq!(harness.tool_calls(), 0);
}

#[tokio::test]
async fn submission_without_files_or_command() {
    let harness = Harness::new();

    let response = harness
        .send("/process", Form::default().text("command", "-i {input} {output}"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["kind"], "InvalidRequest");

    let response = harness
        .send("/process", Form::default().file("clip.mp4", b"x"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["kind"], "InvalidRequest");

    let form = Form::default()
        .file("clip.mp4", b"x")
        .text("command", "-i {input} {output}")
        .text("execution_mode", "bash");
    let response = harness.send("/process", form).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(harness.leftover_workspaces(), 0);
}

#[tokio::test]
async fn json_endpoint_summarises() {
    let harness = Harness::new();
    let form = Form::default()
        .file("song.wav", b"abcd")
        .text("command", "-i {input} -vn -acodec mp3 {output}");

    let response = harness.send("/process-json", form).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["output_extension"], ".mp3");
    assert_eq!(body["output_size_bytes"], 4);
    assert_eq!(body["input_files_count"], 1);
}

#[tokio::test]
async fn health_and_index() {
    let harness = Harness::new();
    let app = http_server::router(AppState::new(harness.config.clone()));

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "healthy");

    let response = app
        .oneshot(Request::get("/").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    let body = json_body(response).await;
    assert!(body["usage"]["placeholders"]["{output}"].is_string());
}
