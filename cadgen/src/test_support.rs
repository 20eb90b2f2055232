//! Test-only scripted collaborators.
//!
//! Scripted doubles return predetermined outcomes in order, so orchestration
//! tests run without a network, an interpreter, or a rendering stack.

use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::generation::{GenerationContext, ModelTiers};
use crate::oracle::{CompletionRequest, Message, Oracle};
use crate::process::CommandOutput;
use crate::programs::executor::EXPORT_FILENAME;
use crate::programs::{ProgramStore, Sandbox, ScriptRuntime};
use crate::rag::{ExampleRetriever, RetrievalMode};
use crate::visual::{DisabledRenderer, DisabledVisualJudge, VisualJudge};

/// One scripted oracle response.
#[derive(Debug, Clone)]
pub enum ScriptedCompletion {
    Text(String),
    Fail,
}

/// Oracle returning scripted responses in order; an exhausted script fails
/// like a dead backend. Records every conversation it was shown.
pub struct ScriptedOracle {
    responses: Mutex<VecDeque<ScriptedCompletion>>,
    conversations: Mutex<Vec<Vec<Message>>>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new(responses: Vec<ScriptedCompletion>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            conversations: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The conversation passed to the `index`-th completion call.
    pub fn conversation_at(&self, index: usize) -> Option<Vec<Message>> {
        self.conversations.lock().unwrap().get(index).cloned()
    }
}

impl Oracle for ScriptedOracle {
    fn complete(&self, messages: &[Message], _request: &CompletionRequest<'_>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.conversations.lock().unwrap().push(messages.to_vec());
        match self.responses.lock().unwrap().pop_front() {
            Some(ScriptedCompletion::Text(text)) => Ok(text),
            Some(ScriptedCompletion::Fail) => Err(anyhow!("scripted oracle failure")),
            None => Err(anyhow!("scripted oracle exhausted")),
        }
    }
}

/// One scripted sandbox execution.
#[derive(Debug, Clone)]
pub enum ScriptedExecution {
    /// Write the export artifact, then report `output`.
    Success { artifact: String, output: String },
    /// Report `output` without producing an artifact.
    Failure { output: String },
    /// Simulate a killed, timed-out run.
    Timeout,
}

/// Script runtime returning scripted executions in order; an exhausted
/// script behaves like a failing interpreter.
pub struct ScriptedRuntime {
    executions: Mutex<VecDeque<ScriptedExecution>>,
    runs: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(executions: Vec<ScriptedExecution>) -> Self {
        Self {
            executions: Mutex::new(executions.into()),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl ScriptRuntime for ScriptedRuntime {
    fn run(&self, _script: &Path, workdir: &Path, _timeout: Duration) -> Result<CommandOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let execution = self
            .executions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedExecution::Failure {
                output: "scripted runtime exhausted".to_string(),
            });

        let (stdout, timed_out) = match execution {
            ScriptedExecution::Success { artifact, output } => {
                std::fs::write(workdir.join(EXPORT_FILENAME), artifact)?;
                (output, false)
            }
            ScriptedExecution::Failure { output } => (output, false),
            ScriptedExecution::Timeout => (String::new(), true),
        };

        Ok(CommandOutput {
            status: ExitStatus::from_raw(0),
            stdout: stdout.into_bytes(),
            stderr: Vec::new(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out,
        })
    }
}

/// Visual judge answering `compare` from a scripted queue and `describe`
/// with a fixed description.
pub struct ScriptedVisual {
    compares: Mutex<VecDeque<Option<(String, i32)>>>,
    description: Option<String>,
}

impl ScriptedVisual {
    pub fn new(compares: Vec<Option<(String, i32)>>, description: Option<String>) -> Self {
        Self {
            compares: Mutex::new(compares.into()),
            description,
        }
    }
}

impl VisualJudge for ScriptedVisual {
    fn compare(&self, _stl_path: &Path, _prompt: &str, _model: &str) -> Option<(String, i32)> {
        self.compares.lock().unwrap().pop_front().flatten()
    }

    fn describe(&self, _stl_path: &Path, _model: &str) -> Option<String> {
        self.description.clone()
    }
}

/// Retriever returning a fixed example block.
pub struct StaticRetriever {
    pub text: String,
}

impl ExampleRetriever for StaticRetriever {
    fn examples_for(&self, _prompt: &str, _top_n: usize, _mode: RetrievalMode) -> Result<String> {
        Ok(self.text.clone())
    }
}

/// A generation context wired entirely from scripted collaborators, storing
/// programs under `root`.
pub fn scripted_context(
    root: &Path,
    oracle: Arc<ScriptedOracle>,
    runtime: Arc<ScriptedRuntime>,
) -> Arc<GenerationContext> {
    scripted_context_with_visual(root, oracle, runtime, Arc::new(DisabledVisualJudge))
}

pub fn scripted_context_with_visual(
    root: &Path,
    oracle: Arc<ScriptedOracle>,
    runtime: Arc<ScriptedRuntime>,
    visual: Arc<dyn VisualJudge>,
) -> Arc<GenerationContext> {
    Arc::new(GenerationContext {
        oracle,
        retriever: Arc::new(StaticRetriever {
            text: String::new(),
        }),
        visual,
        sandbox: Arc::new(Sandbox::new(
            ProgramStore::new(root),
            runtime,
            Arc::new(DisabledRenderer),
            Duration::from_secs(5),
        )),
        models: ModelTiers {
            model: "test/model".to_string(),
            model_fast: "test/fast".to_string(),
        },
        oracle_timeout: Duration::from_secs(5),
        max_workers: 4,
    })
}
