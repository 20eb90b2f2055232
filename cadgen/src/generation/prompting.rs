//! Prompt builders for oracle conversations.
//!
//! All prompt text lives in minijinja templates under `prompts/` and is
//! rendered through a single shared engine. Builders return role-tagged
//! message sequences ready for the oracle.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::oracle::Message;
use crate::programs::executor::PREAMBLE;

use super::{GenerationResult, IterationRecord};

const INITIAL_TEMPLATE: &str = include_str!("prompts/initial.md");
const IMPROVEMENT_TEMPLATE: &str = include_str!("prompts/improvement.md");
const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");
const ERROR_TEMPLATE: &str = include_str!("prompts/error.md");
const ERROR_LAST_TRY_TEMPLATE: &str = include_str!("prompts/error_last_try.md");
const CRITIQUE_TEMPLATE: &str = include_str!("prompts/critique.md");
const SOLUTIONS_TEMPLATE: &str = include_str!("prompts/solutions.md");

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    for (name, template) in [
        ("initial", INITIAL_TEMPLATE),
        ("improvement", IMPROVEMENT_TEMPLATE),
        ("iteration", ITERATION_TEMPLATE),
        ("error", ERROR_TEMPLATE),
        ("error_last_try", ERROR_LAST_TRY_TEMPLATE),
        ("critique", CRITIQUE_TEMPLATE),
        ("solutions", SOLUTIONS_TEMPLATE),
    ] {
        env.add_template(name, template)
            .expect("prompt template should be valid");
    }
    env
});

fn render(name: &str, ctx: minijinja::Value) -> Result<String> {
    let template = ENGINE
        .get_template(name)
        .with_context(|| format!("missing template {name}"))?;
    template
        .render(ctx)
        .with_context(|| format!("render template {name}"))
}

/// Conversation seed for generating a fresh model.
pub fn initial_messages(prompt: &str, examples: &str) -> Result<Vec<Message>> {
    let body = render(
        "initial",
        context! {
            examples => non_empty(examples),
            preamble => PREAMBLE.trim(),
        },
    )?;
    Ok(vec![
        Message::user(body),
        Message::user(format!("Initial user request:\n{prompt}")),
    ])
}

/// Conversation seed for producing a strictly better variant, given examples
/// that include the current candidates and their critiques.
pub fn improvement_messages(prompt: &str, examples: &str) -> Result<Vec<Message>> {
    let body = render(
        "improvement",
        context! {
            examples => non_empty(examples),
            preamble => PREAMBLE.trim(),
        },
    )?;
    Ok(vec![
        Message::user(body),
        Message::user(format!("Initial user request:\n{prompt}")),
    ])
}

/// Conversation seed for editing the current model from a follow-up request.
pub fn iteration_messages(
    initial_prompt: &str,
    initial_reasoning: &str,
    past_iterations: &[IterationRecord],
    current_code: &str,
    examples: &str,
    request: &str,
) -> Result<Vec<Message>> {
    let body = render(
        "iteration",
        context! {
            initial_prompt,
            initial_reasoning => non_empty(initial_reasoning),
            past_iterations,
            current_code,
            examples => non_empty(examples),
        },
    )?;
    Ok(vec![
        Message::user(body),
        Message::user(format!("New follow-up request:\n{request}")),
    ])
}

/// Corrective user message fed back after a failed execution.
///
/// The last attempt gets the aggressive variant that permits gutting the
/// model down to whatever will run.
pub fn error_feedback(diagnostic: &str, last_try: bool) -> Result<Message> {
    let name = if last_try { "error_last_try" } else { "error" };
    let body = render(name, context! { diagnostic })?;
    Ok(Message::user(body))
}

/// The rejected attempt, replayed as the assistant's turn in the growing
/// conversation.
pub fn rejected_attempt(reasoning: &str, code: &str) -> Message {
    Message::assistant(format!(
        "<reasoning>\n{reasoning}\n</reasoning>\n<code>\n{code}\n</code>"
    ))
}

/// Prompt asking the oracle to critique one candidate.
pub fn critique_prompt(
    prompt: &str,
    result: &GenerationResult,
    description: &str,
) -> Result<String> {
    render(
        "critique",
        context! {
            prompt,
            result,
            description,
        },
    )
}

/// Render the current candidates, with critiques, as examples for the
/// improvement prompt.
pub fn solutions_as_examples(prompt: &str, results: &[GenerationResult]) -> Result<String> {
    render(
        "solutions",
        context! {
            prompt,
            results,
        },
    )
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programs::ProgramId;

    fn result() -> GenerationResult {
        GenerationResult {
            program_id: ProgramId::from("1"),
            reasoning: "two cylinders".to_string(),
            code: "part = Cylinder(1, 2)".to_string(),
            comment: "too small".to_string(),
            visual_critique: Some("squat".to_string()),
            rating: 4,
        }
    }

    #[test]
    fn initial_messages_embed_examples_and_preamble() {
        let messages = initial_messages("a cube", "<example>box</example>").expect("messages");
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("<example>box</example>"));
        assert!(messages[0].content.contains("from build123d import *"));
        assert!(messages[1].content.contains("a cube"));
    }

    #[test]
    fn initial_messages_without_examples_skip_the_section() {
        let messages = initial_messages("a cube", "").expect("messages");
        assert!(!messages[0].content.contains("examples to help you succeed"));
    }

    #[test]
    fn iteration_messages_render_history_and_code() {
        let past = vec![IterationRecord {
            request: "add a lid".to_string(),
            reasoning: "extruded a cap".to_string(),
        }];
        let messages = iteration_messages(
            "a jar",
            "cylinder with walls",
            &past,
            "part = Cylinder(5, 9)",
            "",
            "make it taller",
        )
        .expect("messages");
        assert!(messages[0].content.contains("add a lid"));
        assert!(messages[0].content.contains("extruded a cap"));
        assert!(messages[0].content.contains("part = Cylinder(5, 9)"));
        assert!(messages[1].content.contains("make it taller"));
    }

    #[test]
    fn error_feedback_has_two_severities() {
        let normal = error_feedback("NameError: foo", false).expect("normal");
        assert!(normal.content.contains("NameError: foo"));
        assert!(normal.content.contains("fix the code"));

        let last = error_feedback("NameError: foo", true).expect("last");
        assert!(last.content.contains("LAST TRY"));
    }

    #[test]
    fn solutions_render_each_candidate_with_critique() {
        let out = solutions_as_examples("a jar", &[result()]).expect("render");
        assert!(out.contains("two cylinders"));
        assert!(out.contains("part = Cylinder(1, 2)"));
        assert!(out.contains("too small"));
    }

    #[test]
    fn critique_prompt_includes_visual_sections_when_rated() {
        let out = critique_prompt("a jar", &result(), "a short cylinder").expect("render");
        assert!(out.contains("a short cylinder"));
        assert!(out.contains("squat"));
        assert!(out.contains("4/10"));
    }
}
