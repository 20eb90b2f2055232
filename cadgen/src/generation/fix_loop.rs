//! The code-run-fix retry loop.
//!
//! Converts a conversation seed into a working program by repeatedly asking
//! the oracle for code, executing it in the sandbox, and feeding the failure
//! diagnostic back as corrective context. The retry budget bounds oracle
//! calls; oracle flakiness and bad generated code are both soft failures
//! that consume budget without ever raising.

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::oracle::{CompletionRequest, Message};
use crate::programs::ProgramId;

use super::GenerationContext;
use super::prompting;

/// Feedback used when execution "succeeds" silently without geometry.
const EMPTY_RESULT_FEEDBACK: &str = "No errors, but nothing was rendered: the resulting object is empty. Check whether you subtracted or cut away too much.";

#[derive(Debug, Clone)]
pub struct FixLoopOptions {
    /// Maximum number of oracle calls before giving up.
    pub max_iterations: u32,
    /// Model identifier for every call in this loop.
    pub model: String,
    /// Starting sampling temperature; halves on every retry so later
    /// attempts drift less once close to a fix.
    pub base_temperature: f64,
}

#[derive(Debug)]
pub struct FixLoopOutcome {
    /// Id of the accepted program, when the loop converged.
    pub program_id: Option<ProgramId>,
    /// Reasoning from the first attempt that produced any.
    pub reasoning: Option<String>,
    pub success: bool,
}

/// Run the retry loop until a candidate executes or the budget is spent.
///
/// Exhausting the budget is a normal outcome signalled through
/// [`FixLoopOutcome::success`]; only filesystem-level sandbox failures
/// return an error.
#[instrument(skip_all, fields(max_iterations = opts.max_iterations, model = %opts.model))]
pub fn code_run_fix_loop(
    ctx: &GenerationContext,
    messages: Vec<Message>,
    opts: &FixLoopOptions,
) -> Result<FixLoopOutcome> {
    let mut messages = messages;
    let mut iterations = 0u32;
    let mut first_reasoning: Option<String> = None;

    while iterations < opts.max_iterations {
        let temperature = opts.base_temperature * 0.5f64.powi(iterations as i32);
        let request = CompletionRequest {
            model: &opts.model,
            temperature,
            timeout: ctx.oracle_timeout,
        };

        let response = match ctx.oracle.complete(&messages, &request) {
            Ok(response) => response,
            Err(err) => {
                // A dead oracle call teaches nothing; skip the attempt
                // without appending feedback.
                warn!(iteration = iterations, err = %err, "oracle call failed, skipping attempt");
                iterations += 1;
                continue;
            }
        };

        let (code, reasoning) = parse_completion(&response);
        let code = code.replace(".add(", ".union(");
        if first_reasoning.is_none() && !reasoning.is_empty() {
            first_reasoning = Some(reasoning.clone());
        }

        let run = ctx.sandbox.execute_first_time(&code)?;
        if run.success {
            debug!(iteration = iterations, "fix loop converged");
            return Ok(FixLoopOutcome {
                program_id: run.program_id,
                reasoning: first_reasoning,
                success: true,
            });
        }

        let diagnostic = if run.diagnostic.trim().is_empty() {
            EMPTY_RESULT_FEEDBACK.to_string()
        } else {
            run.diagnostic
        };
        // The next attempt is the final one when two tries would overrun the
        // budget; phrase its feedback to permit aggressive simplification.
        let last_try = iterations + 2 >= opts.max_iterations;
        let feedback = prompting::error_feedback(&diagnostic, last_try)?;

        let mut grown = messages;
        grown.push(prompting::rejected_attempt(&reasoning, &code));
        grown.push(feedback);
        messages = grown;
        iterations += 1;
    }

    debug!("fix loop exhausted its budget");
    Ok(FixLoopOutcome {
        program_id: None,
        reasoning: first_reasoning,
        success: false,
    })
}

/// Extract the code and reasoning blocks from a free-form oracle response.
///
/// Delimiter conventions are tried in fixed priority order: explicit
/// `<code>` tags, anything after `</reasoning>`, then the common fenced-code
/// markers. No match means empty code, which fails execution and flows
/// through the normal feedback path.
pub(crate) fn parse_completion(response: &str) -> (String, String) {
    let code = if response.contains("<code>") {
        between(response, "<code>", "</code>")
    } else if response.contains("</reasoning>") {
        response
            .split_once("</reasoning>")
            .map(|(_, rest)| rest.trim().to_string())
    } else if response.contains("```python") {
        between(response, "```python", "```")
    } else if response.contains("```py") {
        between(response, "```py", "```")
    } else if response.contains("```") {
        between(response, "```", "```")
    } else {
        debug!("no code found in oracle response");
        None
    };

    let reasoning = between(response, "<reasoning>", "</reasoning>").unwrap_or_default();
    (code.unwrap_or_default(), reasoning)
}

fn between(text: &str, open: &str, close: &str) -> Option<String> {
    let (_, rest) = text.split_once(open)?;
    let inner = match rest.split_once(close) {
        Some((inner, _)) => inner,
        None => rest,
    };
    Some(inner.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        ScriptedCompletion, ScriptedExecution, ScriptedOracle, ScriptedRuntime, scripted_context,
    };
    use std::sync::Arc;

    fn opts(max_iterations: u32) -> FixLoopOptions {
        FixLoopOptions {
            max_iterations,
            model: "test/model".to_string(),
            base_temperature: 0.4,
        }
    }

    fn seed() -> Vec<Message> {
        vec![Message::user("make a cube")]
    }

    #[test]
    fn parses_tagged_response() {
        let response = "<reasoning>stack two boxes</reasoning>\n<code>\npart = Box(1, 1, 1)\n</code>";
        let (code, reasoning) = parse_completion(response);
        assert_eq!(code, "part = Box(1, 1, 1)");
        assert_eq!(reasoning, "stack two boxes");
    }

    #[test]
    fn falls_back_to_fenced_code() {
        let (code, _) = parse_completion("here you go\n```python\npart = Box(2, 2, 2)\n```");
        assert_eq!(code, "part = Box(2, 2, 2)");
        let (code, _) = parse_completion("```\npart = Box(3, 3, 3)\n```");
        assert_eq!(code, "part = Box(3, 3, 3)");
    }

    #[test]
    fn takes_remainder_after_reasoning_when_code_tags_missing() {
        let (code, reasoning) =
            parse_completion("<reasoning>simple</reasoning>\npart = Box(4, 4, 4)");
        assert_eq!(code, "part = Box(4, 4, 4)");
        assert_eq!(reasoning, "simple");
    }

    #[test]
    fn no_code_at_all_is_empty() {
        let (code, reasoning) = parse_completion("I cannot help with that");
        assert!(code.is_empty());
        assert!(reasoning.is_empty());
    }

    #[test]
    fn converges_on_first_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let oracle = Arc::new(ScriptedOracle::new(vec![ScriptedCompletion::Text(
            "<reasoning>a box</reasoning><code>result = Box(1, 1, 1)</code>".to_string(),
        )]));
        let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptedExecution::Success {
            artifact: "solid".to_string(),
            output: String::new(),
        }]));
        let ctx = scripted_context(temp.path(), Arc::clone(&oracle), Arc::clone(&runtime));

        let outcome = code_run_fix_loop(&ctx, seed(), &opts(4)).expect("loop");
        assert!(outcome.success);
        assert!(outcome.program_id.is_some());
        assert_eq!(outcome.reasoning.as_deref(), Some("a box"));
        assert_eq!(oracle.calls(), 1);
        assert_eq!(runtime.runs(), 1);
    }

    #[test]
    fn budget_bounds_oracle_calls_and_returns_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let oracle = Arc::new(ScriptedOracle::new(vec![ScriptedCompletion::Fail; 10]));
        let runtime = Arc::new(ScriptedRuntime::new(Vec::new()));
        let ctx = scripted_context(temp.path(), Arc::clone(&oracle), runtime);

        let outcome = code_run_fix_loop(&ctx, seed(), &opts(3)).expect("loop");
        assert!(!outcome.success);
        assert!(outcome.program_id.is_none());
        assert_eq!(oracle.calls(), 3);
    }

    #[test]
    fn diagnostic_feedback_grows_the_conversation_and_second_attempt_succeeds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let oracle = Arc::new(ScriptedOracle::new(vec![
            ScriptedCompletion::Text(
                "<code>result = Box(1, 1, 1)\nresult.bogus_call()</code>".to_string(),
            ),
            ScriptedCompletion::Text("<code>result = Box(1, 1, 1)</code>".to_string()),
        ]));
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            ScriptedExecution::Failure {
                output: "AttributeError: 'Part' object has no attribute 'bogus_call'".to_string(),
            },
            ScriptedExecution::Success {
                artifact: "solid".to_string(),
                output: String::new(),
            },
        ]));
        let ctx = scripted_context(temp.path(), Arc::clone(&oracle), Arc::clone(&runtime));

        let outcome = code_run_fix_loop(&ctx, seed(), &opts(4)).expect("loop");
        assert!(outcome.success);
        assert_eq!(runtime.runs(), 2);

        // The second call saw the rejected attempt and the diagnostic.
        let second = oracle.conversation_at(1).expect("second conversation");
        assert_eq!(second.len(), 3);
        assert!(second[1].content.contains("bogus_call()"));
        assert!(second[2].content.contains("has no attribute 'bogus_call'"));
    }

    #[test]
    fn empty_diagnostic_is_replaced_with_empty_geometry_feedback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let oracle = Arc::new(ScriptedOracle::new(vec![
            ScriptedCompletion::Text("<code>result = Box(1, 1, 1)</code>".to_string()),
            ScriptedCompletion::Fail,
        ]));
        let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptedExecution::Failure {
            output: String::new(),
        }]));
        let ctx = scripted_context(temp.path(), Arc::clone(&oracle), runtime);

        let outcome = code_run_fix_loop(&ctx, seed(), &opts(2)).expect("loop");
        assert!(!outcome.success);
        let second = oracle.conversation_at(1).expect("second conversation");
        assert!(second[2].content.contains("nothing was rendered"));
    }

    #[test]
    fn legacy_add_call_is_rewritten_to_union() {
        let temp = tempfile::tempdir().expect("tempdir");
        let oracle = Arc::new(ScriptedOracle::new(vec![ScriptedCompletion::Text(
            "<code>result = a.add(b)</code>".to_string(),
        )]));
        let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptedExecution::Success {
            artifact: "solid".to_string(),
            output: String::new(),
        }]));
        let ctx = scripted_context(temp.path(), Arc::clone(&oracle), Arc::clone(&runtime));

        let outcome = code_run_fix_loop(&ctx, seed(), &opts(1)).expect("loop");
        let id = outcome.program_id.expect("id");
        let stored = ctx.sandbox.store().read_code(&id).expect("code");
        assert!(stored.contains("a.union(b)"));
        assert!(!stored.contains("a.add(b)"));
    }
}
