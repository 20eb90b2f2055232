//! Step sequencing and the precision-indexed pipeline table.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, instrument};

use super::steps::GenerationStep;
use super::{GenerationContext, GenerationResult, ModelTiers};

/// A fixed sequence of steps threading one evolving candidate list.
///
/// Fail-fast: a step that keeps nothing poisons the whole run, since every
/// later step assumes a non-empty working set. Discarded candidates
/// accumulate across the run and their artifacts are deleted only once the
/// final step has finished, so a candidate is never deleted while a later
/// step might still reference it.
#[derive(Debug, Clone)]
pub struct GenerationPipeline {
    pub steps: Vec<GenerationStep>,
}

impl GenerationPipeline {
    #[instrument(skip_all, fields(pipeline = pipeline_id))]
    pub fn execute(
        &self,
        pipeline_id: u64,
        prompt: &str,
        ctx: &Arc<GenerationContext>,
    ) -> Result<Option<Vec<GenerationResult>>> {
        let mut previous: Vec<GenerationResult> = Vec::new();
        let mut all_discarded: Vec<GenerationResult> = Vec::new();

        for step in &self.steps {
            info!(pipeline = pipeline_id, step = step.name(), "executing step");
            let (results, discarded) = step.execute(pipeline_id, prompt, previous, ctx)?;
            info!(
                pipeline = pipeline_id,
                step = step.name(),
                results = results.len(),
                discarded = discarded.len(),
                "finished step"
            );
            if results.is_empty() {
                return Ok(None);
            }
            all_discarded.extend(discarded);
            previous = results;
        }

        info!(
            pipeline = pipeline_id,
            discarded = all_discarded.len(),
            "deleting discarded programs"
        );
        for result in &all_discarded {
            ctx.sandbox.store().delete(&result.program_id);
        }
        Ok(Some(previous))
    }
}

/// Build the tuned pipeline for a precision level (clamped to 0-6).
///
/// Higher levels add candidates, refinement rounds, visual selection, and
/// (at the top) parallel sub-pipeline fan-out, trading cost and latency for
/// quality. Every sequence ends in a filter that reduces to exactly one
/// candidate.
pub fn pipeline_for_precision(precision: u8, models: &ModelTiers) -> GenerationPipeline {
    use GenerationStep::{Comment, Improve, Initial, KeepBestRated, KeepComplex, Parallel, Sequence, VisualRate};

    let fast = || models.model_fast.clone();
    let main = || models.model.clone();

    let initial = |n: usize, max_iterations: u32, model: String, n_examples: usize| Initial {
        n,
        max_iterations,
        model,
        n_examples,
    };
    let improve = |n: usize, max_iterations: u32, model: String, n_examples: usize| Improve {
        n,
        max_iterations,
        model,
        n_examples,
    };

    let steps = match precision.min(6) {
        0 => vec![initial(1, 4, fast(), 6), KeepComplex { top_n: 1 }],
        1 => vec![initial(2, 4, main(), 8), KeepComplex { top_n: 1 }],
        2 => vec![
            initial(3, 4, main(), 8),
            KeepComplex { top_n: 2 },
            Comment { model: fast() },
            improve(2, 4, main(), 8),
            KeepComplex { top_n: 1 },
        ],
        3 => vec![
            initial(4, 4, main(), 8),
            KeepComplex { top_n: 3 },
            Comment { model: fast() },
            improve(3, 4, main(), 8),
            VisualRate { model: main() },
            KeepBestRated { top_n: 1 },
        ],
        4 => vec![
            initial(5, 5, main(), 10),
            VisualRate { model: main() },
            KeepBestRated { top_n: 3 },
            Comment { model: main() },
            improve(3, 5, main(), 10),
            VisualRate { model: main() },
            KeepBestRated { top_n: 1 },
        ],
        5 => vec![
            initial(6, 5, main(), 10),
            VisualRate { model: main() },
            KeepBestRated { top_n: 4 },
            Comment { model: main() },
            improve(4, 5, main(), 10),
            VisualRate { model: main() },
            KeepBestRated { top_n: 2 },
            Comment { model: main() },
            improve(2, 5, main(), 10),
            VisualRate { model: main() },
            KeepBestRated { top_n: 1 },
        ],
        _ => vec![
            Parallel {
                branches: vec![
                    Sequence {
                        steps: vec![
                            initial(4, 5, main(), 10),
                            VisualRate { model: main() },
                            KeepBestRated { top_n: 2 },
                            Comment { model: main() },
                            improve(2, 5, main(), 10),
                        ],
                    },
                    Sequence {
                        steps: vec![
                            initial(4, 5, main(), 8),
                            KeepComplex { top_n: 2 },
                            Comment { model: main() },
                            improve(2, 5, main(), 8),
                        ],
                    },
                ],
            },
            VisualRate { model: main() },
            KeepBestRated { top_n: 1 },
        ],
    };

    GenerationPipeline { steps }
}
