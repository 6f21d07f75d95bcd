pub mod ffmpeg;
pub mod handbrake;
pub mod makemkv;

use async_trait::async_trait;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::models::{RawTitle, TimeWindow};

/// Failure running one of the external media tools.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} not found. Please install it and ensure it's in your PATH, or pass its location explicitly.")]
    NotFound { tool: String },
    #[error("failed to execute {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("sampler produced no clip at {0:?}")]
    MissingOutput(PathBuf),
}

impl SamplerError {
    /// A missing binary will not fix itself between retries; everything
    /// else (tool crashes, truncated output) is worth another try.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SamplerError::Tool(ToolError::NotFound { .. }))
    }
}

/// Short lower-half clip of one title window. The file is removed when the
/// clip is dropped, whatever the outcome of the attempt that produced it.
#[derive(Debug)]
pub struct Clip {
    path: PathBuf,
    window: TimeWindow,
}

impl Clip {
    pub fn new(path: PathBuf, window: TimeWindow) -> Self {
        Self { path, window }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }
}

impl Drop for Clip {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(clip = %self.path.display(), "Removed clip"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(clip = %self.path.display(), "Failed to remove clip: {e}"),
        }
    }
}

#[async_trait]
pub trait FrameSampler: Send + Sync {
    async fn sample(&self, title: &RawTitle, window: TimeWindow) -> Result<Clip, SamplerError>;
}

/// Runs `tool` to completion, mapping a missing binary and a non-zero exit
/// status to [`ToolError`]. The child is killed if the future is dropped.
pub(crate) async fn run_tool<I, S>(tool: &Path, args: I) -> Result<Output, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let name = tool.display().to_string();
    let output = Command::new(tool)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ToolError::NotFound { tool: name });
        }
        Err(source) => return Err(ToolError::Spawn { tool: name, source }),
    };

    if !output.status.success() {
        return Err(ToolError::Failed {
            tool: name,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_clip_removed_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.m4v");
        File::create(&path).unwrap();

        let clip = Clip::new(path.clone(), TimeWindow::new(4, 6));
        assert!(clip.path().exists());
        drop(clip);
        assert!(!path.exists());
    }

    #[test]
    fn test_clip_drop_without_file() {
        let temp_dir = TempDir::new().unwrap();
        let clip = Clip::new(temp_dir.path().join("never-written.m4v"), TimeWindow::new(0, 2));
        drop(clip);
    }

    #[test]
    fn test_sampler_error_classification() {
        let missing = SamplerError::Tool(ToolError::NotFound {
            tool: "ffmpeg".to_string(),
        });
        assert!(!missing.is_transient());

        let failed = SamplerError::Tool(ToolError::Failed {
            tool: "ffmpeg".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "moov atom not found".to_string(),
        });
        assert!(failed.is_transient());
        assert!(SamplerError::MissingOutput(PathBuf::from("x.m4v")).is_transient());
    }

    #[tokio::test]
    async fn test_run_tool_missing_binary() {
        let result = run_tool(Path::new("definitely-not-a-real-tool-9c1f"), ["-version"]).await;
        assert!(matches!(result, Err(ToolError::NotFound { .. })));
    }
}
