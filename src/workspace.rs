//! Per-request scratch directories.
//!
//! A [`Workspace`] owns a freshly created directory. It is removed by
//! [`Workspace::destroy`] or, if a request is abandoned before that point,
//! when the value is dropped.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineResult, ProcessError};

/// A file received for the current request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub original_name: String,
    pub saved_path: PathBuf,
    pub size_bytes: u64,
}

/// Creates workspaces under one root and enforces the per-file ceiling.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    max_file_bytes: u64,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, max_file_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_file_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// Create a new uniquely named directory under the root.
    pub async fn create(&self) -> PipelineResult<Workspace> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ProcessError::storage("create workspace root", &self.root, e))?;

        let id = Uuid::new_v4();
        let dir = self.root.join(id.to_string());
        // create_dir (not _all) fails if the name already exists.
        fs::create_dir(&dir)
            .await
            .map_err(|e| ProcessError::storage("create workspace", &dir, e))?;

        info!(workspace = %id, "Created workspace");
        Ok(Workspace {
            id,
            root_dir: dir,
            input_files: Vec::new(),
            output_path: None,
            max_file_bytes: self.max_file_bytes,
            destroyed: false,
        })
    }
}

pub struct Workspace {
    id: Uuid,
    root_dir: PathBuf,
    input_files: Vec<UploadedFile>,
    output_path: Option<PathBuf>,
    max_file_bytes: u64,
    destroyed: bool,
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("inputs", &self.input_files.len())
            .finish_non_exhaustive()
    }
}

impl Workspace {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn input_files(&self) -> &[UploadedFile] {
        &self.input_files
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    fn next_input_path(&self, original_name: &str) -> PathBuf {
        let index = self.input_files.len() + 1;
        let name = match safe_extension(original_name) {
            Some(ext) => format!("input_{index}.{ext}"),
            None => format!("input_{index}"),
        };
        self.root_dir.join(name)
    }

    /// Stream one upload to disk, discarding it if it outgrows the ceiling.
    pub async fn save_input<S, E>(
        &mut self,
        original_name: &str,
        mut chunks: S,
    ) -> PipelineResult<&UploadedFile>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<ProcessError>,
    {
        let path = self.next_input_path(original_name);
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| ProcessError::storage("create input file", &path, e))?;

        let mut written: u64 = 0;
        let outcome: PipelineResult<()> = async {
            while let Some(chunk) = chunks.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => return Err(e.into()),
                };
                written += chunk.len() as u64;
                if written > self.max_file_bytes {
                    return Err(self.too_large(original_name));
                }
                file.write_all(&chunk)
                    .await
                    .map_err(|e| ProcessError::storage("write input file", &path, e))?;
            }
            file.flush()
                .await
                .map_err(|e| ProcessError::storage("flush input file", &path, e))
        }
        .await;

        if let Err(err) = outcome {
            drop(file);
            if let Err(e) = fs::remove_file(&path).await {
                debug!(error = %e, "Could not remove partial upload");
            }
            return Err(err);
        }

        debug!(workspace = %self.id, bytes = written, "Saved upload");
        Ok(self.record_input(original_name, path, written))
    }

    /// Copy a local file in as the next input (used by the one-shot CLI).
    pub async fn save_input_from_path(&mut self, source: &Path) -> PipelineResult<&UploadedFile> {
        let original_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let meta = fs::metadata(source)
            .await
            .map_err(|e| ProcessError::storage("stat input file", source, e))?;
        if meta.len() > self.max_file_bytes {
            return Err(self.too_large(&original_name));
        }

        let path = self.next_input_path(&original_name);
        let size = fs::copy(source, &path)
            .await
            .map_err(|e| ProcessError::storage("copy input file", &path, e))?;
        Ok(self.record_input(&original_name, path, size))
    }

    fn record_input(&mut self, original_name: &str, path: PathBuf, size: u64) -> &UploadedFile {
        self.input_files.push(UploadedFile {
            original_name: original_name.to_string(),
            saved_path: path,
            size_bytes: size,
        });
        &self.input_files[self.input_files.len() - 1]
    }

    fn too_large(&self, original_name: &str) -> ProcessError {
        ProcessError::PayloadTooLarge {
            file_name: original_name.to_string(),
            limit_mb: self.max_file_bytes / (1024 * 1024),
        }
    }

    /// Pick a fresh output filename inside the workspace.
    pub fn allocate_output_path(&mut self, extension: &str) -> PathBuf {
        let extension = extension.trim_start_matches('.');
        let id = Uuid::new_v4().simple().to_string();
        let path = self.root_dir.join(format!("output_{}.{extension}", &id[..8]));
        self.output_path = Some(path.clone());
        path
    }

    /// Copy the shared font asset in, so `{font}` never points outside.
    pub async fn stage_font(&self, font: &Path) -> PipelineResult<PathBuf> {
        let name = font
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| name.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)))
            .unwrap_or_else(|| "font.ttf".to_string());
        let dest = self.root_dir.join(name);
        fs::copy(font, &dest)
            .await
            .map_err(|e| ProcessError::storage("copy font asset", font, e))?;
        Ok(dest)
    }

    /// Remove the directory tree. Failures are logged, never returned.
    pub async fn destroy(mut self) {
        self.destroyed = true;
        match fs::remove_dir_all(&self.root_dir).await {
            Ok(()) => info!(workspace = %self.id, "Removed workspace"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(workspace = %self.id, error = %e, "Failed to remove workspace"),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        match std::fs::remove_dir_all(&self.root_dir) {
            Ok(()) => info!(workspace = %self.id, "Removed abandoned workspace"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(workspace = %self.id, error = %e, "Failed to remove workspace"),
        }
    }
}

/// ASCII-alphanumeric extension of `name`, at most ten characters.
fn safe_extension(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_string_lossy();
    let clean: String = ext
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(10)
        .collect::<String>()
        .to_ascii_lowercase();
    (!clean.is_empty()).then_some(clean)
}
