//! Example retrieval for prompt grounding.
//!
//! The oracle's knowledge of the CAD scripting API is unreliable, so every
//! generation prompt carries a handful of known-good example parts retrieved
//! by semantic similarity. The embedding backend is external (an
//! [`Embedder`] command); computed vectors are memoized in a disk-persisted
//! [`EmbeddingCache`]. The cache is the one piece of shared mutable state in
//! the system: fan-out workers retrieve concurrently, so the
//! read-check-compute-write cycle is serialized behind a single mutex.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::process::run_command_with_timeout;

/// What the retrieved examples will be used for; changes the framing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    /// Seeding a fresh generation.
    Initial,
    /// Editing an existing model from a follow-up request.
    Iteration,
}

/// Produces a formatted example block for a prompt. Pure from the caller's
/// perspective; safe to call from multiple workers at once.
pub trait ExampleRetriever: Send + Sync {
    fn examples_for(&self, prompt: &str, top_n: usize, mode: RetrievalMode) -> Result<String>;
}

/// Retriever used when no dataset is configured.
pub struct NullRetriever;

impl ExampleRetriever for NullRetriever {
    fn examples_for(&self, _prompt: &str, _top_n: usize, _mode: RetrievalMode) -> Result<String> {
        Ok(String::new())
    }
}

/// Embeds a text into a similarity vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embedder that invokes a configured external command with the text on
/// stdin, expecting a JSON array of floats on stdout.
pub struct CommandEmbedder {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandEmbedder {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl Embedder for CommandEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.command.is_empty() {
            return Err(anyhow!("no embedder command configured"));
        }
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        let output = run_command_with_timeout(cmd, Some(text.as_bytes()), self.timeout, 1_000_000)
            .context("run embedder command")?;
        if output.timed_out || !output.status.success() {
            return Err(anyhow!("embedder command failed: {}", output.combined_lossy()));
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(raw.trim()).context("parse embedding vector")
    }
}

/// Disk-persisted memo of text → embedding vector.
///
/// Loaded once at startup; every new entry is persisted immediately so
/// concurrent processes and later runs reuse it. `get_or_compute` holds the
/// mutex across the whole read-check-compute-write cycle to avoid duplicate
/// computation and interleaved file writes.
pub struct EmbeddingCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read embedding cache {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parse embedding cache {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn get_or_compute(
        &self,
        key: &str,
        compute: impl FnOnce() -> Result<Vec<f32>>,
    ) -> Result<Vec<f32>> {
        let mut entries = self.entries.lock().expect("embedding cache poisoned");
        if let Some(found) = entries.get(key) {
            return Ok(found.clone());
        }
        let vector = compute()?;
        entries.insert(key.to_string(), vector.clone());
        self.persist(&entries)?;
        Ok(vector)
    }

    fn persist(&self, entries: &HashMap<String, Vec<f32>>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create cache dir {}", parent.display()))?;
        }
        let buf = serde_json::to_string(entries).context("serialize embedding cache")?;
        fs::write(&self.path, buf)
            .with_context(|| format!("write embedding cache {}", self.path.display()))
    }
}

/// One example part from the dataset directory (a TOML file with a
/// `description` and the known-good `code`).
#[derive(Debug, Clone, Deserialize)]
pub struct ExamplePart {
    pub description: String,
    pub code: String,
}

/// Retriever ranking a local dataset by cosine similarity of embeddings.
pub struct SimilarityRetriever {
    parts: Vec<ExamplePart>,
    embedder: Arc<dyn Embedder>,
    cache: Arc<EmbeddingCache>,
}

impl SimilarityRetriever {
    /// Load every `*.toml` part file under `dataset_dir`.
    pub fn load(
        dataset_dir: &Path,
        embedder: Arc<dyn Embedder>,
        cache: Arc<EmbeddingCache>,
    ) -> Result<Self> {
        let mut parts = Vec::new();
        let entries = fs::read_dir(dataset_dir)
            .with_context(|| format!("read dataset dir {}", dataset_dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "toml") {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read part {}", path.display()))?;
            match toml::from_str::<ExamplePart>(&contents) {
                Ok(part) => parts.push(part),
                Err(err) => warn!(path = %path.display(), err = %err, "skipping unparseable part"),
            }
        }
        debug!(parts = parts.len(), "loaded example dataset");
        Ok(Self {
            parts,
            embedder,
            cache,
        })
    }

    fn embedding_for(&self, text: &str) -> Result<Vec<f32>> {
        self.cache
            .get_or_compute(text, || self.embedder.embed(text))
    }
}

impl ExampleRetriever for SimilarityRetriever {
    #[instrument(skip_all, fields(top_n, ?mode))]
    fn examples_for(&self, prompt: &str, top_n: usize, mode: RetrievalMode) -> Result<String> {
        if self.parts.is_empty() || top_n == 0 {
            return Ok(String::new());
        }
        let prompt_embedding = self.embedding_for(prompt)?;

        let mut ranked: Vec<(&ExamplePart, f32)> = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let embedding = self.embedding_for(&part.description)?;
            ranked.push((part, cosine_similarity(&prompt_embedding, &embedding)));
        }
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        // Mostly the nearest parts, backfilled with the farthest ones so the
        // oracle also sees what out-of-scope solutions look like.
        let n_near = top_n.div_ceil(2).max(top_n * 7 / 10).min(ranked.len());
        let mut picked: Vec<&ExamplePart> = ranked[..n_near].iter().map(|(p, _)| *p).collect();
        let n_far = top_n.saturating_sub(n_near).min(ranked.len() - n_near);
        picked.extend(ranked.iter().rev().take(n_far).map(|(p, _)| *p));

        let header = match mode {
            RetrievalMode::Initial => {
                "Here are example parts showing how to model similar requests:\n\n"
            }
            RetrievalMode::Iteration => {
                "Here are example parts relevant to the model being edited:\n\n"
            }
        };
        let mut out = String::from(header);
        for part in picked {
            out.push_str(&format!(
                "<example>\n<prompt>{}</prompt>\n<code>\n{}\n</code>\n<critique>This is perfect</critique>\n</example>\n\n",
                part.description, part.code
            ));
        }
        Ok(out)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
