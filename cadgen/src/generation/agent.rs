//! Agent session state and its two entry operations.

use std::sync::Arc;

use anyhow::{Result, bail};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::programs::ProgramId;
use crate::rag::RetrievalMode;

use super::fix_loop::{FixLoopOptions, code_run_fix_loop};
use super::pipeline::pipeline_for_precision;
use super::prompting;
use super::{GenerationContext, IterationRecord};

/// Number of examples retrieved for an iteration conversation.
const ITERATION_EXAMPLES: usize = 6;

/// Retry budget for a single iteration fix loop.
const ITERATION_MAX_FIXES: u32 = 4;

/// Conversational session state for one model being built and refined.
///
/// Both entry operations leave the session untouched on failure, so a failed
/// call never corrupts the ability to retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub initial_prompt: String,
    #[serde(default)]
    pub initial_reasoning: Option<String>,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
    #[serde(default)]
    pub last_program_id: Option<ProgramId>,
    #[serde(default)]
    pub initial_precision: u8,
}

impl Agent {
    pub fn initialize(initial_prompt: impl Into<String>) -> Self {
        Self {
            initial_prompt: initial_prompt.into(),
            initial_reasoning: None,
            iterations: Vec::new(),
            last_program_id: None,
            initial_precision: 0,
        }
    }

    /// Run the precision-selected pipeline once and adopt its best candidate
    /// as the session's current program.
    ///
    /// Returns `Ok(None)` on pipeline failure, leaving the session as it
    /// was.
    #[instrument(skip_all, fields(precision))]
    pub fn generate_initial(
        &mut self,
        precision: u8,
        ctx: &Arc<GenerationContext>,
    ) -> Result<Option<ProgramId>> {
        let pipeline = pipeline_for_precision(precision, &ctx.models);
        let pipeline_id: u64 = rand::thread_rng().gen_range(0..u64::MAX);
        info!(pipeline = pipeline_id, prompt = %self.initial_prompt, "generating initial solution");

        let Some(results) = pipeline.execute(pipeline_id, &self.initial_prompt, ctx)? else {
            info!(pipeline = pipeline_id, "initial generation failed");
            return Ok(None);
        };
        // The pipeline's final filter ranks by construction; the first kept
        // candidate is the best one.
        let Some(best) = results.into_iter().next() else {
            return Ok(None);
        };

        let id = best.program_id;
        self.initial_reasoning = Some(best.reasoning);
        self.last_program_id = Some(id.clone());
        self.initial_precision = precision;
        info!(program = %id, "initial solution accepted");
        Ok(Some(id))
    }

    /// Apply one follow-up request to the current program through a single
    /// fix loop.
    ///
    /// Precondition: a prior successful generation exists; calling without
    /// one is a usage error and fails fast.
    #[instrument(skip_all)]
    pub fn generate_iteration(
        &mut self,
        request: &str,
        ctx: &Arc<GenerationContext>,
    ) -> Result<Option<ProgramId>> {
        let Some(last) = self.last_program_id.clone() else {
            bail!("generate_iteration requires a prior successful generation");
        };

        let current_code = ctx.sandbox.store().read_code(&last)?;
        let examples = ctx
            .retriever
            .examples_for(&self.initial_prompt, ITERATION_EXAMPLES, RetrievalMode::Iteration)
            .unwrap_or_else(|err| {
                warn!(err = %err, "example retrieval failed, continuing without");
                String::new()
            });

        let messages = prompting::iteration_messages(
            &self.initial_prompt,
            self.initial_reasoning.as_deref().unwrap_or(""),
            &self.iterations,
            &current_code,
            &examples,
            request,
        )?;

        let opts = FixLoopOptions {
            max_iterations: ITERATION_MAX_FIXES,
            model: ctx.models.model.clone(),
            base_temperature: 0.4,
        };
        let outcome = code_run_fix_loop(ctx, messages, &opts)?;
        if !outcome.success {
            info!("iteration failed, session unchanged");
            return Ok(None);
        }
        let Some(id) = outcome.program_id else {
            return Ok(None);
        };

        self.iterations.push(IterationRecord {
            request: request.to_string(),
            reasoning: outcome.reasoning.unwrap_or_default(),
        });
        self.last_program_id = Some(id.clone());
        info!(program = %id, "iteration accepted");
        Ok(Some(id))
    }
}
