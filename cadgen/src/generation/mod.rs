//! Generation orchestration: fix loop, steps, pipelines, and the agent.

pub mod agent;
pub mod fix_loop;
pub mod pipeline;
pub mod prompting;
pub mod session;
pub mod steps;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::oracle::Oracle;
use crate::programs::{ProgramId, Sandbox};
use crate::rag::ExampleRetriever;
use crate::visual::VisualJudge;

/// One candidate solution flowing through a pipeline.
///
/// Owned by whichever step currently holds it; later steps attach critique
/// and rating in place. Discarded candidates keep their artifacts on disk
/// until the whole pipeline finishes.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub program_id: ProgramId,
    pub reasoning: String,
    pub code: String,
    pub comment: String,
    pub visual_critique: Option<String>,
    pub rating: i32,
}

impl GenerationResult {
    pub fn new(program_id: ProgramId, reasoning: String, code: String) -> Self {
        Self {
            program_id,
            reasoning,
            code,
            comment: String::new(),
            visual_critique: None,
            rating: 0,
        }
    }
}

/// One handled follow-up request in an agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub request: String,
    pub reasoning: String,
}

/// Model identifiers for the two cost tiers the pipelines choose between.
#[derive(Debug, Clone)]
pub struct ModelTiers {
    pub model: String,
    pub model_fast: String,
}

/// Shared collaborators for a generation run.
///
/// Cloned (via `Arc`) into every fan-out worker; all members are safe for
/// concurrent use.
pub struct GenerationContext {
    pub oracle: Arc<dyn Oracle>,
    pub retriever: Arc<dyn ExampleRetriever>,
    pub visual: Arc<dyn VisualJudge>,
    pub sandbox: Arc<Sandbox>,
    pub models: ModelTiers,
    /// Network timeout for a single oracle call.
    pub oracle_timeout: Duration,
    /// Bound on concurrent workers per fan-out step.
    pub max_workers: usize,
}
