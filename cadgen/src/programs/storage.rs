//! On-disk layout of per-program artifact directories.
//!
//! Each program owns one directory under the storage root:
//!
//! ```text
//! <root>/<program-id>/
//!   script.py      final source (preamble + sanitized body)
//!   render.stl     exported geometry (successful runs only)
//!   params.json    extracted parameter map
//!   thumbnail.png  rendered preview (lazily, stl exports only)
//! ```
//!
//! This directory is the hand-off contract to any consumer layer. Workers
//! only ever write into their own freshly allocated directory, so no locking
//! is needed for artifact writes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::programs::id::ProgramId;

/// Path helpers and lifecycle operations for program directories.
#[derive(Debug, Clone)]
pub struct ProgramStore {
    root: PathBuf,
}

impl ProgramStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, id: &ProgramId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn script_path(&self, id: &ProgramId) -> PathBuf {
        self.dir(id).join("script.py")
    }

    pub fn export_path(&self, id: &ProgramId, format: &str) -> PathBuf {
        self.dir(id).join(format!("render.{format}"))
    }

    pub fn stl_path(&self, id: &ProgramId) -> PathBuf {
        self.export_path(id, "stl")
    }

    pub fn params_path(&self, id: &ProgramId) -> PathBuf {
        self.dir(id).join("params.json")
    }

    pub fn thumbnail_path(&self, id: &ProgramId) -> PathBuf {
        self.dir(id).join("thumbnail.png")
    }

    pub fn ensure_dir(&self, id: &ProgramId) -> Result<()> {
        let dir = self.dir(id);
        fs::create_dir_all(&dir).with_context(|| format!("create program dir {}", dir.display()))
    }

    pub fn read_code(&self, id: &ProgramId) -> Result<String> {
        let path = self.script_path(id);
        fs::read_to_string(&path).with_context(|| format!("read program script {}", path.display()))
    }

    pub fn write_params(&self, id: &ProgramId, params: &BTreeMap<String, String>) -> Result<()> {
        let path = self.params_path(id);
        let mut buf = serde_json::to_string_pretty(params).context("serialize params")?;
        buf.push('\n');
        fs::write(&path, buf).with_context(|| format!("write params {}", path.display()))
    }

    pub fn read_params(&self, id: &ProgramId) -> Result<BTreeMap<String, String>> {
        let path = self.params_path(id);
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read params {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse params {}", path.display()))
    }

    /// Remove a program directory and everything in it. Missing directories
    /// are not an error: discard runs after a pipeline and may race with
    /// nothing having been produced.
    pub fn delete(&self, id: &ProgramId) {
        let dir = self.dir(id);
        if let Err(err) = fs::remove_dir_all(&dir)
            && dir.exists()
        {
            tracing::warn!(dir = %dir.display(), err = %err, "failed to delete program dir");
        }
    }
}
