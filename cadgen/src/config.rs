//! Generator configuration stored in `cadgen.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Generator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CadConfig {
    /// Root directory for per-program artifact directories.
    pub storage_root: PathBuf,

    /// Interpreter command used to run generated scripts (argv prefix).
    pub interpreter: Vec<String>,

    /// Hard wall-clock budget for one script execution, in seconds.
    pub execution_timeout_secs: u64,

    /// Truncate captured subprocess output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Upper bound on concurrent fan-out workers per pipeline step.
    pub max_workers: usize,

    pub oracle: OracleConfig,
    pub retrieval: RetrievalConfig,
    pub renderer: RendererConfig,
    pub visual: VisualConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    /// Chat completions endpoint base URL.
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Main model used for initial generation and improvement.
    pub model: String,
    /// Cheaper model used at low precision and for fix-ups.
    pub model_fast: String,
    /// Network timeout for a single completion request, in seconds.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Directory of example part files (TOML: description + code). When
    /// unset, retrieval returns no examples.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_dir: Option<PathBuf>,
    /// Command producing a JSON array of floats for the text on stdin.
    pub embedder_command: Vec<String>,
    /// Persisted embedding cache location.
    pub cache_path: PathBuf,
}

/// External command rendering an STL file to images.
///
/// Invoked as `<command...> <stl_path> <output_path>`; empty command disables
/// thumbnail generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendererConfig {
    pub command: Vec<String>,
}

/// External command judging an STL against a prompt.
///
/// Invoked as `<command...> <mode> <stl_path>` with the prompt on stdin and a
/// JSON object on stdout; empty command disables visual critique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VisualConfig {
    pub command: Vec<String>,
    /// Judge command timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for CadConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("storage/programs"),
            interpreter: vec!["python".to_string()],
            execution_timeout_secs: 40,
            output_limit_bytes: 100_000,
            max_workers: 8,
            oracle: OracleConfig::default(),
            retrieval: RetrievalConfig::default(),
            renderer: RendererConfig::default(),
            visual: VisualConfig::default(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            model: "deepseek/deepseek-chat".to_string(),
            model_fast: "deepseek/deepseek-chat".to_string(),
            request_timeout_secs: 40,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dataset_dir: None,
            embedder_command: Vec::new(),
            cache_path: PathBuf::from("storage/embeddings-cache.json"),
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
        }
    }
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 60,
        }
    }
}

impl CadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.execution_timeout_secs == 0 {
            return Err(anyhow!("execution_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be > 0"));
        }
        if self.interpreter.is_empty() || self.interpreter[0].trim().is_empty() {
            return Err(anyhow!("interpreter must be a non-empty array"));
        }
        if self.oracle.request_timeout_secs == 0 {
            return Err(anyhow!("oracle.request_timeout_secs must be > 0"));
        }
        if self.oracle.model.trim().is_empty() || self.oracle.model_fast.trim().is_empty() {
            return Err(anyhow!("oracle.model and oracle.model_fast must be set"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CadConfig::default()`.
pub fn load_config(path: &Path) -> Result<CadConfig> {
    if !path.exists() {
        let cfg = CadConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CadConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CadConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
