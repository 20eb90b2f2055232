//! Visual collaborator seams: rendering and model critique.
//!
//! Rendering an STL to images and judging a model against a prompt are
//! external concerns. Both sit behind traits so orchestration can be tested
//! with scripted stand-ins; the production implementations shell out to
//! configured commands, mirroring how guard commands are run elsewhere in
//! the codebase.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::process::run_command_with_timeout;

/// Renders exported geometry to image files (thumbnails, critique views).
pub trait Renderer: Send + Sync {
    /// Render `stl_path` into `output`. Returns the produced image paths.
    fn render(&self, stl_path: &Path, output: &Path) -> Result<Vec<PathBuf>>;
}

/// Judges a rendered model: free-form critique plus a 0-10 rating.
///
/// Both operations are best-effort: `None` means the judge could not produce
/// an answer, and callers decide whether that drops the candidate.
pub trait VisualJudge: Send + Sync {
    fn compare(&self, stl_path: &Path, prompt: &str, model: &str) -> Option<(String, i32)>;
    fn describe(&self, stl_path: &Path, model: &str) -> Option<String>;
}

/// Renderer that invokes a configured external command as
/// `<command...> <stl_path> <output_path>`.
pub struct CommandRenderer {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandRenderer {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

impl Renderer for CommandRenderer {
    fn render(&self, stl_path: &Path, output: &Path) -> Result<Vec<PathBuf>> {
        if self.command.is_empty() {
            return Err(anyhow!("no renderer command configured"));
        }
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).arg(stl_path).arg(output);
        let result = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .context("run renderer command")?;
        if result.timed_out || !result.status.success() {
            return Err(anyhow!("renderer command failed: {}", result.combined_lossy()));
        }
        if !output.exists() {
            return Err(anyhow!("renderer produced no image at {}", output.display()));
        }
        debug!(output = %output.display(), "rendered image");
        Ok(vec![output.to_path_buf()])
    }
}

/// Renderer used when no render command is configured. Thumbnailing is a
/// best-effort side effect, so callers treat the error as a warning.
pub struct DisabledRenderer;

impl Renderer for DisabledRenderer {
    fn render(&self, _stl_path: &Path, _output: &Path) -> Result<Vec<PathBuf>> {
        Err(anyhow!("rendering disabled"))
    }
}

#[derive(Deserialize)]
struct CompareOutput {
    critique: String,
    rating: i32,
}

#[derive(Deserialize)]
struct DescribeOutput {
    description: String,
}

/// Judge that invokes a configured external command as
/// `<command...> <mode> <model> <stl_path>` with the prompt on stdin and a
/// JSON object on stdout (`{"critique": ..., "rating": ...}` for compare,
/// `{"description": ...}` for describe).
pub struct CommandVisualJudge {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandVisualJudge {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }

    fn invoke(&self, mode: &str, model: &str, stl_path: &Path, stdin: &str) -> Option<String> {
        if self.command.is_empty() {
            return None;
        }
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).arg(mode).arg(model).arg(stl_path);
        let result = run_command_with_timeout(
            cmd,
            Some(stdin.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        );
        match result {
            Ok(output) if !output.timed_out && output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                warn!(mode, timed_out = output.timed_out, "visual judge command failed");
                None
            }
            Err(err) => {
                warn!(mode, err = %err, "visual judge command errored");
                None
            }
        }
    }
}

impl VisualJudge for CommandVisualJudge {
    fn compare(&self, stl_path: &Path, prompt: &str, model: &str) -> Option<(String, i32)> {
        let raw = self.invoke("compare", model, stl_path, prompt)?;
        match serde_json::from_str::<CompareOutput>(&raw) {
            Ok(parsed) => Some((parsed.critique, parsed.rating.clamp(0, 10))),
            Err(err) => {
                warn!(err = %err, "unparseable compare output");
                None
            }
        }
    }

    fn describe(&self, stl_path: &Path, model: &str) -> Option<String> {
        let raw = self.invoke("describe", model, stl_path, "")?;
        match serde_json::from_str::<DescribeOutput>(&raw) {
            Ok(parsed) => Some(parsed.description),
            Err(err) => {
                warn!(err = %err, "unparseable describe output");
                None
            }
        }
    }
}

/// Judge used when no command is configured: every answer is `None`.
pub struct DisabledVisualJudge;

impl VisualJudge for DisabledVisualJudge {
    fn compare(&self, _stl_path: &Path, _prompt: &str, _model: &str) -> Option<(String, i32)> {
        None
    }

    fn describe(&self, _stl_path: &Path, _model: &str) -> Option<String> {
        None
    }
}
