//! Pipeline steps: the polymorphic units of generation work.
//!
//! Every step maps an input candidate list to `(kept, discarded)` under the
//! same signature; a pipeline threads the kept list from one step to the
//! next. Fan-out steps run their tasks on a bounded worker pool and collect
//! results first-completed-first with a per-task deadline — a straggler is
//! dropped, never waited on.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::gather::{self, Task};
use crate::oracle::{CompletionRequest, Message};
use crate::rag::RetrievalMode;

use super::fix_loop::{FixLoopOptions, code_run_fix_loop};
use super::prompting;
use super::{GenerationContext, GenerationResult};

/// Collection deadline for tasks that run a whole fix loop.
const GENERATE_COLLECT_TIMEOUT: Duration = Duration::from_secs(300);

/// Collection deadline for critique and rating tasks.
const CRITIQUE_COLLECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Tiny secondary weight preferring longer code among equally rated
/// candidates; small enough to never override a real rating difference.
const LENGTH_EPSILON: f64 = 1e-7;

pub type StepOutput = (Vec<GenerationResult>, Vec<GenerationResult>);

/// One unit of pipeline work.
#[derive(Debug, Clone)]
pub enum GenerationStep {
    /// Generate `n` fresh candidates concurrently, appending successes to
    /// whatever was already present.
    Initial {
        n: usize,
        max_iterations: u32,
        model: String,
        n_examples: usize,
    },
    /// Generate `n` improved variants informed by the current candidates
    /// and their critiques. Falls back to passing through the first
    /// previous candidate when every attempt fails.
    Improve {
        n: usize,
        max_iterations: u32,
        model: String,
        n_examples: usize,
    },
    /// Keep the `top_n` candidates with the longest code (a crude
    /// complexity proxy), stable on ties.
    KeepComplex { top_n: usize },
    /// Keep the `top_n` best rated candidates, longer code winning ties.
    KeepBestRated { top_n: usize },
    /// Attach an oracle critique (and opportunistically a visual rating) to
    /// every candidate; candidates whose critique fails are dropped.
    Comment { model: String },
    /// Attach a visual critique and rating to every candidate, retrying
    /// once inline; failures are omitted from the kept set without entering
    /// the discarded list.
    VisualRate { model: String },
    /// Run branches concurrently against the same input snapshot and union
    /// their outputs.
    Parallel { branches: Vec<GenerationStep> },
    /// Run steps as a nested pipeline over its own evolving result,
    /// stopping early (keeping what accumulated) when a step comes back
    /// empty.
    Sequence { steps: Vec<GenerationStep> },
}

impl GenerationStep {
    /// Short name for log correlation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initial { .. } => "initial",
            Self::Improve { .. } => "improve",
            Self::KeepComplex { .. } => "keep_complex",
            Self::KeepBestRated { .. } => "keep_best_rated",
            Self::Comment { .. } => "comment",
            Self::VisualRate { .. } => "visual_rate",
            Self::Parallel { .. } => "parallel",
            Self::Sequence { .. } => "sequence",
        }
    }

    pub fn execute(
        &self,
        pipeline_id: u64,
        prompt: &str,
        previous: Vec<GenerationResult>,
        ctx: &Arc<GenerationContext>,
    ) -> Result<StepOutput> {
        match self {
            Self::Initial {
                n,
                max_iterations,
                model,
                n_examples,
            } => {
                info!(pipeline = pipeline_id, n, "generating solutions");
                let tasks = generate_tasks(ctx, prompt, *n, *max_iterations, model, *n_examples, None);
                let produced: Vec<GenerationResult> =
                    gather::run(tasks, GENERATE_COLLECT_TIMEOUT, ctx.max_workers)
                        .into_iter()
                        .flatten()
                        .collect();
                info!(
                    pipeline = pipeline_id,
                    produced = produced.len(),
                    "generated successful solutions"
                );
                let mut kept = produced;
                kept.extend(previous);
                Ok((kept, Vec::new()))
            }
            Self::Improve {
                n,
                max_iterations,
                model,
                n_examples,
            } => {
                info!(pipeline = pipeline_id, n, "improving solutions");
                let commented = prompting::solutions_as_examples(prompt, &previous)?;
                let tasks = generate_tasks(
                    ctx,
                    prompt,
                    *n,
                    *max_iterations,
                    model,
                    *n_examples,
                    Some(commented),
                );
                let produced: Vec<GenerationResult> =
                    gather::run(tasks, GENERATE_COLLECT_TIMEOUT, ctx.max_workers)
                        .into_iter()
                        .flatten()
                        .collect();
                info!(
                    pipeline = pipeline_id,
                    produced = produced.len(),
                    "improved successful solutions"
                );
                if produced.is_empty() {
                    // Improvement is best-effort: degrade to the first
                    // previous candidate rather than emptying the set.
                    info!(pipeline = pipeline_id, "improving all failed, keeping first previous");
                    let mut previous = previous;
                    if previous.is_empty() {
                        return Ok((Vec::new(), Vec::new()));
                    }
                    let first = previous.remove(0);
                    return Ok((vec![first], previous));
                }
                Ok((produced, previous))
            }
            Self::KeepComplex { top_n } => {
                info!(
                    pipeline = pipeline_id,
                    top_n,
                    total = previous.len(),
                    "keeping most complex solutions"
                );
                let mut kept = previous;
                kept.sort_by(|a, b| b.code.len().cmp(&a.code.len()));
                let discarded = kept.split_off((*top_n).min(kept.len()));
                Ok((kept, discarded))
            }
            Self::KeepBestRated { top_n } => {
                info!(
                    pipeline = pipeline_id,
                    top_n,
                    total = previous.len(),
                    "keeping best rated solutions"
                );
                let mut kept = previous;
                kept.sort_by(|a, b| {
                    score(b).partial_cmp(&score(a)).unwrap_or(std::cmp::Ordering::Equal)
                });
                let discarded = kept.split_off((*top_n).min(kept.len()));
                Ok((kept, discarded))
            }
            Self::Comment { model } => {
                info!(
                    pipeline = pipeline_id,
                    total = previous.len(),
                    "critiquing solutions"
                );
                let tasks = comment_tasks(ctx, prompt, model, previous);
                let kept: Vec<GenerationResult> =
                    gather::run(tasks, CRITIQUE_COLLECT_TIMEOUT, ctx.max_workers)
                        .into_iter()
                        .flatten()
                        .collect();
                info!(pipeline = pipeline_id, kept = kept.len(), "critiqued solutions");
                Ok((kept, Vec::new()))
            }
            Self::VisualRate { model } => {
                info!(
                    pipeline = pipeline_id,
                    total = previous.len(),
                    "visually rating solutions"
                );
                let tasks = rate_tasks(ctx, prompt, model, previous);
                let kept: Vec<GenerationResult> =
                    gather::run(tasks, CRITIQUE_COLLECT_TIMEOUT, ctx.max_workers)
                        .into_iter()
                        .flatten()
                        .collect();
                info!(pipeline = pipeline_id, kept = kept.len(), "visually rated solutions");
                // Rating failures vanish rather than moving to the discarded
                // list; their artifacts outlive the pipeline.
                Ok((kept, Vec::new()))
            }
            Self::Parallel { branches } => {
                info!(
                    pipeline = pipeline_id,
                    branches = branches.len(),
                    "running parallel branches"
                );
                let tasks: Vec<Task<Option<StepOutput>>> = branches
                    .iter()
                    .map(|branch| {
                        let branch = branch.clone();
                        let ctx = Arc::clone(ctx);
                        let prompt = prompt.to_string();
                        let snapshot = previous.clone();
                        Box::new(move || match branch.execute(pipeline_id, &prompt, snapshot, &ctx) {
                            Ok(output) => Some(output),
                            Err(err) => {
                                warn!(pipeline = pipeline_id, err = %err, "parallel branch failed");
                                None
                            }
                        }) as Task<Option<StepOutput>>
                    })
                    .collect();

                let mut kept = Vec::new();
                let mut discarded = Vec::new();
                for (branch_kept, branch_discarded) in
                    gather::run(tasks, GENERATE_COLLECT_TIMEOUT, ctx.max_workers)
                        .into_iter()
                        .flatten()
                {
                    kept.extend(branch_kept);
                    discarded.extend(branch_discarded);
                }
                Ok((kept, discarded))
            }
            Self::Sequence { steps } => {
                let mut accumulated: Vec<GenerationResult> = Vec::new();
                let mut discarded: Vec<GenerationResult> = Vec::new();
                let mut input = previous;
                for step in steps {
                    info!(pipeline = pipeline_id, step = step.name(), "executing sub step");
                    let (kept, new_discarded) =
                        step.execute(pipeline_id, prompt, input.clone(), ctx)?;
                    info!(
                        pipeline = pipeline_id,
                        step = step.name(),
                        kept = kept.len(),
                        "finished sub step"
                    );
                    if kept.is_empty() {
                        return Ok((accumulated, discarded));
                    }
                    discarded.extend(new_discarded);
                    accumulated = kept;
                    input = accumulated.clone();
                }
                Ok((accumulated, discarded))
            }
        }
    }
}

fn score(result: &GenerationResult) -> f64 {
    f64::from(result.rating) + LENGTH_EPSILON * result.code.len() as f64
}

/// Build the fan-out tasks shared by the Initial and Improve steps: retrieve
/// examples, seed a conversation, run a full fix loop. `commented` carries
/// the rendered current candidates for improvement runs.
fn generate_tasks(
    ctx: &Arc<GenerationContext>,
    prompt: &str,
    n: usize,
    max_iterations: u32,
    model: &str,
    n_examples: usize,
    commented: Option<String>,
) -> Vec<Task<Option<GenerationResult>>> {
    (0..n)
        .map(|_| {
            let ctx = Arc::clone(ctx);
            let prompt = prompt.to_string();
            let model = model.to_string();
            let commented = commented.clone();
            Box::new(move || {
                let examples = ctx
                    .retriever
                    .examples_for(&prompt, n_examples, RetrievalMode::Initial)
                    .unwrap_or_else(|err| {
                        warn!(err = %err, "example retrieval failed, continuing without");
                        String::new()
                    });

                let messages = match &commented {
                    Some(commented) => prompting::improvement_messages(
                        &prompt,
                        &format!("{examples}\n{commented}"),
                    ),
                    None => prompting::initial_messages(&prompt, &examples),
                };
                let messages = match messages {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!(err = %err, "prompt rendering failed");
                        return None;
                    }
                };

                let opts = FixLoopOptions {
                    max_iterations,
                    model,
                    base_temperature: 0.4,
                };
                let outcome = match code_run_fix_loop(&ctx, messages, &opts) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(err = %err, "fix loop errored, dropping candidate");
                        return None;
                    }
                };
                if !outcome.success {
                    return None;
                }
                let program_id = outcome.program_id?;
                let code = match ctx.sandbox.store().read_code(&program_id) {
                    Ok(code) => code,
                    Err(err) => {
                        warn!(err = %err, "accepted program unreadable, dropping candidate");
                        return None;
                    }
                };
                Some(GenerationResult::new(
                    program_id,
                    outcome.reasoning.unwrap_or_default(),
                    code,
                ))
            }) as Task<Option<GenerationResult>>
        })
        .collect()
}

fn comment_tasks(
    ctx: &Arc<GenerationContext>,
    prompt: &str,
    model: &str,
    previous: Vec<GenerationResult>,
) -> Vec<Task<Option<GenerationResult>>> {
    previous
        .into_iter()
        .map(|mut result| {
            let ctx = Arc::clone(ctx);
            let prompt = prompt.to_string();
            let model = model.to_string();
            Box::new(move || {
                let stl = ctx.sandbox.store().stl_path(&result.program_id);
                let description = ctx
                    .visual
                    .describe(&stl, &model)
                    .unwrap_or_else(|| "No description available".to_string());
                if result.visual_critique.is_none()
                    && let Some((critique, rating)) = ctx.visual.compare(&stl, &prompt, &model)
                {
                    result.visual_critique = Some(critique);
                    result.rating = rating;
                }

                let critique_prompt = match prompting::critique_prompt(&prompt, &result, &description)
                {
                    Ok(rendered) => rendered,
                    Err(err) => {
                        warn!(err = %err, "critique prompt rendering failed");
                        return None;
                    }
                };
                let request = CompletionRequest {
                    model: &model,
                    temperature: 0.4,
                    timeout: ctx.oracle_timeout,
                };
                let response = match ctx
                    .oracle
                    .complete(&[Message::user(critique_prompt)], &request)
                {
                    Ok(response) => response,
                    Err(err) => {
                        warn!(err = %err, "critique call failed, dropping candidate");
                        return None;
                    }
                };
                result.comment = extract_final_summary(&response);
                Some(result)
            }) as Task<Option<GenerationResult>>
        })
        .collect()
}

fn rate_tasks(
    ctx: &Arc<GenerationContext>,
    prompt: &str,
    model: &str,
    previous: Vec<GenerationResult>,
) -> Vec<Task<Option<GenerationResult>>> {
    previous
        .into_iter()
        .map(|mut result| {
            let ctx = Arc::clone(ctx);
            let prompt = prompt.to_string();
            let model = model.to_string();
            Box::new(move || {
                let stl = ctx.sandbox.store().stl_path(&result.program_id);
                let (critique, rating) = ctx
                    .visual
                    .compare(&stl, &prompt, &model)
                    .or_else(|| ctx.visual.compare(&stl, &prompt, &model))?;
                result.visual_critique = Some(critique);
                result.rating = rating;
                Some(result)
            }) as Task<Option<GenerationResult>>
        })
        .collect()
}

/// The critique's `<final-summary>` block; a response without the tags is
/// taken whole.
fn extract_final_summary(response: &str) -> String {
    let after = response
        .rsplit("<final-summary>")
        .next()
        .unwrap_or(response);
    after
        .split("</final-summary>")
        .next()
        .unwrap_or(after)
        .trim()
        .to_string()
}
