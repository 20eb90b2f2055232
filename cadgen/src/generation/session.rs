//! Session persistence for agent state across process restarts.
//!
//! Sessions are plain JSON files validated against an embedded schema before
//! parsing, so a hand-edited or corrupted file fails with a clear message
//! instead of half-loading.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;

use super::agent::Agent;

const SESSION_SCHEMA: &str = include_str!("../schemas/agent_session.schema.json");

/// Load and validate a session file.
pub fn load_session(path: &Path) -> Result<Agent> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
    let instance: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse session json {}", path.display()))?;
    validate_schema(&instance)?;
    serde_json::from_value(instance)
        .with_context(|| format!("parse session as agent state {}", path.display()))
}

/// Serialize the session to pretty-printed JSON with a trailing newline.
pub fn write_session(path: &Path, agent: &Agent) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create session dir {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(agent).context("serialize session")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write session {}", path.display()))
}

/// Validate a session JSON instance against the embedded schema
/// (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(SESSION_SCHEMA).context("parse session schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile session schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("session validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::IterationRecord;
    use crate::programs::ProgramId;

    fn agent() -> Agent {
        Agent {
            initial_prompt: "a cube".to_string(),
            initial_reasoning: Some("one box".to_string()),
            iterations: vec![IterationRecord {
                request: "taller".to_string(),
                reasoning: "stretched".to_string(),
            }],
            last_program_id: Some(ProgramId::from("1234567890123")),
            initial_precision: 2,
        }
    }

    #[test]
    fn session_round_trips_through_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.json");

        write_session(&path, &agent()).expect("write");
        let loaded = load_session(&path).expect("load");
        assert_eq!(loaded, agent());
    }

    #[test]
    fn rejects_session_missing_required_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.json");
        fs::write(&path, r#"{"iterations": []}"#).expect("write");

        let err = load_session(&path).unwrap_err();
        assert!(err.to_string().contains("session validation failed"));
    }

    #[test]
    fn rejects_session_with_unknown_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.json");
        fs::write(
            &path,
            r#"{"initial_prompt": "x", "iterations": [], "initial_precision": 0, "surprise": 1}"#,
        )
        .expect("write");

        let err = load_session(&path).unwrap_err();
        assert!(err.to_string().contains("session validation failed"));
    }
}
