//! Sandboxed execution of candidate scripts.
//!
//! Untrusted source text is sanitized, rewritten to the canonical export
//! shape, stripped for parameters, prefixed with the fixed import preamble,
//! and run as a separate OS process with a hard wall-clock timeout. Success
//! is determined solely by the expected export file existing afterwards —
//! not by exit code — because the CAD library prints warnings and keeps
//! going after partial failures.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::process::{CommandOutput, run_command_with_timeout};
use crate::programs::id::ProgramId;
use crate::programs::params::{apply_params, extract_params};
use crate::programs::rewrite::{canonicalize_export, replace_export_format, set_tolerance};
use crate::programs::sanitize::sanitize_code;
use crate::programs::storage::ProgramStore;
use crate::visual::Renderer;

/// Imports injected ahead of every candidate script. Candidates may not add
/// their own; sanitization strips them.
pub const PREAMBLE: &str = "\
from build123d import *
import build123d as bd
from bd_warehouse.thread import *
from bd_warehouse.gear import *
from bd_warehouse.fastener import *
import math
import numpy as np
import random
";

/// Canonical export target inside a program directory.
pub const EXPORT_FILENAME: &str = "render.stl";

/// Mesh tolerance forced onto every export call.
pub const EXPORT_TOLERANCE: u32 = 5;

const DEFAULT_FORMAT: &str = "stl";

/// Abstraction over the interpreter that runs a written script file.
///
/// Decouples the sandbox from the actual CAD runtime so tests can script
/// executions without an interpreter installed.
pub trait ScriptRuntime: Send + Sync {
    /// Run `script` with `workdir` as the working directory.
    fn run(&self, script: &Path, workdir: &Path, timeout: Duration) -> Result<CommandOutput>;
}

/// Runtime that spawns the configured interpreter command on the script.
pub struct InterpreterRuntime {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl InterpreterRuntime {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }
}

impl ScriptRuntime for InterpreterRuntime {
    #[instrument(skip_all, fields(script = %script.display()))]
    fn run(&self, script: &Path, workdir: &Path, timeout: Duration) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        // Scripts reference their export by bare filename, so run them from
        // inside the program directory.
        match script.file_name() {
            Some(name) => cmd.arg(name),
            None => cmd.arg(script),
        };
        cmd.current_dir(workdir);
        run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
    }
}

/// Outcome of the first execution of a fresh candidate.
#[derive(Debug)]
pub struct FirstRun {
    /// Id of the accepted program; `None` when execution failed (the
    /// allocated directory still holds the script for inspection).
    pub program_id: Option<ProgramId>,
    /// Combined interpreter output, or a fixed timeout message.
    pub diagnostic: String,
    pub success: bool,
}

/// The execution sandbox: turns candidate source text into an executed,
/// artifact-producing or diagnostically-failing program.
pub struct Sandbox {
    store: ProgramStore,
    runtime: Arc<dyn ScriptRuntime>,
    renderer: Arc<dyn Renderer>,
    timeout: Duration,
}

impl Sandbox {
    pub fn new(
        store: ProgramStore,
        runtime: Arc<dyn ScriptRuntime>,
        renderer: Arc<dyn Renderer>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            renderer,
            timeout,
        }
    }

    pub fn store(&self) -> &ProgramStore {
        &self.store
    }

    /// Sanitize, rewrite, store, and run a fresh candidate script.
    #[instrument(skip_all)]
    pub fn execute_first_time(&self, source: &str) -> Result<FirstRun> {
        let id = ProgramId::new();
        self.store.ensure_dir(&id)?;

        let mut script = sanitize_code(source);
        script = canonicalize_export(&script, EXPORT_FILENAME);
        script = set_tolerance(&script, EXPORT_TOLERANCE);
        let params = extract_params(&script);
        self.store.write_params(&id, &params)?;

        let script = format!("{PREAMBLE}\n{script}");
        let script_path = self.store.script_path(&id);
        fs::write(&script_path, &script)
            .with_context(|| format!("write script {}", script_path.display()))?;

        let (diagnostic, success) = self.execute(&id, Some(&params), DEFAULT_FORMAT)?;
        debug!(program = %id, success, "first execution finished");
        Ok(FirstRun {
            program_id: success.then_some(id),
            diagnostic,
            success,
        })
    }

    /// Re-render a stored program, optionally substituting parameter values
    /// and/or switching the export format.
    ///
    /// The previous export is kept aside until the new run succeeds, then
    /// either dropped (success) or restored (failure).
    #[instrument(skip_all, fields(program = %id, format))]
    pub fn execute(
        &self,
        id: &ProgramId,
        params: Option<&BTreeMap<String, String>>,
        format: &str,
    ) -> Result<(String, bool)> {
        let export = self.store.export_path(id, format);
        let backup = backup_path(&export);
        if export.exists() {
            fs::rename(&export, &backup)
                .with_context(|| format!("set aside previous export {}", export.display()))?;
        }

        let mut code = self.store.read_code(id)?;
        if let Some(params) = params {
            code = apply_params(&code, params);
        }
        if format != DEFAULT_FORMAT {
            code = replace_export_format(&code, format);
        }

        let workdir = self.store.dir(id);
        let tmp_path = workdir.join("script.py.tmp");
        fs::write(&tmp_path, &code)
            .with_context(|| format!("write temp script {}", tmp_path.display()))?;

        let (diagnostic, success) = match self.runtime.run(&tmp_path, &workdir, self.timeout) {
            Ok(output) if output.timed_out => (
                format!(
                    "Error: The script execution timed out after {} seconds.",
                    self.timeout.as_secs()
                ),
                false,
            ),
            Ok(output) => (output.combined_lossy(), export.exists()),
            Err(err) => (format!("{err:#}"), false),
        };

        if success {
            if backup.exists() {
                let _ = fs::remove_file(&backup);
            }
            if format == DEFAULT_FORMAT {
                self.render_thumbnail(id);
            }
        } else if backup.exists() {
            fs::rename(&backup, &export)
                .with_context(|| format!("restore previous export {}", export.display()))?;
        }

        Ok((diagnostic, success))
    }

    /// Thumbnail generation is a side effect of a successful stl export;
    /// renderer failure never flips the execution outcome.
    fn render_thumbnail(&self, id: &ProgramId) {
        let stl = self.store.stl_path(id);
        let thumb = self.store.thumbnail_path(id);
        match self.renderer.render(&stl, &thumb) {
            Ok(_) => info!(program = %id, "thumbnail rendered"),
            Err(err) => debug!(program = %id, err = %err, "thumbnail skipped"),
        }
    }
}

fn backup_path(export: &Path) -> PathBuf {
    let mut name = export.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}
