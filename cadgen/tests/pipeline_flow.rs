//! End-to-end pipeline flows with scripted collaborators.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cadgen::generation::agent::Agent;
use cadgen::generation::pipeline::GenerationPipeline;
use cadgen::generation::steps::GenerationStep;
use cadgen::test_support::{
    ScriptedCompletion, ScriptedExecution, ScriptedOracle, ScriptedRuntime, scripted_context,
    scripted_context_with_visual,
};
use cadgen::visual::VisualJudge;

const CUBE_RESPONSE: &str = "\
<reasoning>A cube is a single box primitive; one size parameter drives all three dimensions.</reasoning>
<code>
# <parameters>
size = 10
# </parameters>
part = Box(size, size, size)
result = part
filename = \"render.stl\"
export_stl(result, filename)
</code>";

/// A "10mm cube" request at precision 0 produces exactly one candidate with
/// a single length parameter valued 10 and an artifact on disk.
#[test]
fn precision_zero_cube_request_produces_one_parameterized_candidate() {
    let temp = tempfile::tempdir().expect("tempdir");
    let oracle = Arc::new(ScriptedOracle::new(vec![ScriptedCompletion::Text(
        CUBE_RESPONSE.to_string(),
    )]));
    let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptedExecution::Success {
        artifact: "solid cube".to_string(),
        output: String::new(),
    }]));
    let ctx = scripted_context(temp.path(), Arc::clone(&oracle), Arc::clone(&runtime));

    let mut agent = Agent::initialize("a 10mm cube");
    let id = agent
        .generate_initial(0, &ctx)
        .expect("generate")
        .expect("program id");

    assert_eq!(oracle.calls(), 1);
    assert_eq!(runtime.runs(), 1);

    let params = ctx.sandbox.store().read_params(&id).expect("params");
    assert_eq!(params.len(), 1);
    assert_eq!(params["size"], "10");
    assert!(ctx.sandbox.store().stl_path(&id).exists());

    let script = ctx.sandbox.store().read_code(&id).expect("script");
    assert!(script.contains("export_stl(result, filename, tolerance=5)"));
}

/// A candidate calling a nonexistent method fails with a diagnostic naming
/// the offending call; after the diagnostic is fed back, the corrected
/// second attempt succeeds — exactly two sandbox invocations.
#[test]
fn fix_loop_recovers_from_a_nonexistent_method_in_two_runs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let oracle = Arc::new(ScriptedOracle::new(vec![
        ScriptedCompletion::Text(
            "<code>part = Box(1, 1, 1)\nresult = part.polish()\n</code>".to_string(),
        ),
        ScriptedCompletion::Text("<code>part = Box(1, 1, 1)\nresult = part\n</code>".to_string()),
    ]));
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        ScriptedExecution::Failure {
            output: "AttributeError: 'Part' object has no attribute 'polish'".to_string(),
        },
        ScriptedExecution::Success {
            artifact: "solid".to_string(),
            output: String::new(),
        },
    ]));
    let ctx = scripted_context(temp.path(), Arc::clone(&oracle), Arc::clone(&runtime));

    let mut agent = Agent::initialize("a polished cube");
    let id = agent.generate_initial(0, &ctx).expect("generate");

    assert!(id.is_some());
    assert_eq!(runtime.runs(), 2);

    // The second oracle call carried the diagnostic naming the bad call.
    let second = oracle.conversation_at(1).expect("second conversation");
    let feedback = &second[second.len() - 1].content;
    assert!(feedback.contains("has no attribute 'polish'"));
}

/// Visual judge that snapshots how many program directories exist each time
/// a candidate is described, proving early-discarded artifacts are still on
/// disk while later steps run.
struct ProbeVisual {
    root: PathBuf,
    dirs_seen: Mutex<Vec<usize>>,
}

impl ProbeVisual {
    fn count_dirs(&self) -> usize {
        std::fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_dir())
                    .count()
            })
            .unwrap_or(0)
    }
}

impl VisualJudge for ProbeVisual {
    fn compare(&self, _stl_path: &Path, _prompt: &str, _model: &str) -> Option<(String, i32)> {
        None
    }

    fn describe(&self, _stl_path: &Path, _model: &str) -> Option<String> {
        self.dirs_seen.lock().unwrap().push(self.count_dirs());
        Some("a shape".to_string())
    }
}

/// Artifacts discarded by an early filter survive while later steps run and
/// are removed only once the whole pipeline has finished.
#[test]
fn discarded_artifacts_survive_until_the_pipeline_completes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let oracle = Arc::new(ScriptedOracle::new(vec![
        ScriptedCompletion::Text("<code>result = Box(1, 1, 1)</code>".to_string()),
        ScriptedCompletion::Text(
            "<code>result = Box(2, 2, 2)\npadding = result\n</code>".to_string(),
        ),
        ScriptedCompletion::Text(
            "<final-summary>looks reasonable</final-summary>".to_string(),
        ),
    ]));
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        ScriptedExecution::Success {
            artifact: "solid".to_string(),
            output: String::new(),
        },
        ScriptedExecution::Success {
            artifact: "solid".to_string(),
            output: String::new(),
        },
    ]));
    let probe = Arc::new(ProbeVisual {
        root: temp.path().to_path_buf(),
        dirs_seen: Mutex::new(Vec::new()),
    });
    let ctx = scripted_context_with_visual(
        temp.path(),
        oracle,
        runtime,
        Arc::clone(&probe) as Arc<dyn VisualJudge>,
    );

    let pipeline = GenerationPipeline {
        steps: vec![
            GenerationStep::Initial {
                n: 2,
                max_iterations: 1,
                model: "test/model".to_string(),
                n_examples: 0,
            },
            GenerationStep::KeepComplex { top_n: 1 },
            GenerationStep::Comment {
                model: "test/model".to_string(),
            },
        ],
    };

    let kept = pipeline
        .execute(11, "a cube", &ctx)
        .expect("pipeline")
        .expect("results");
    assert_eq!(kept.len(), 1);

    // While Comment ran, both program directories were still on disk.
    let seen = probe.dirs_seen.lock().unwrap().clone();
    assert_eq!(seen, vec![2]);

    // After the run, only the kept program's directory remains.
    assert_eq!(probe.count_dirs(), 1);
    assert!(ctx.sandbox.store().dir(&kept[0].program_id).exists());
}

/// Improve with every concurrent attempt failing keeps the first previous
/// candidate and discards the rest (which the pipeline then deletes).
#[test]
fn improvement_collapse_degrades_to_the_first_candidate() {
    let temp = tempfile::tempdir().expect("tempdir");
    let oracle = Arc::new(ScriptedOracle::new(vec![
        // Three initial generations succeed...
        ScriptedCompletion::Text("<code>result = Box(1, 1, 1)\n# aaaa\n</code>".to_string()),
        ScriptedCompletion::Text("<code>result = Box(2, 2, 2)\n</code>".to_string()),
        ScriptedCompletion::Text("<code>result = Box(3, 3, 3)\n</code>".to_string()),
        // ...and all three improvement attempts fail outright.
        ScriptedCompletion::Fail,
        ScriptedCompletion::Fail,
        ScriptedCompletion::Fail,
    ]));
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        ScriptedExecution::Success {
            artifact: "solid".to_string(),
            output: String::new(),
        },
        ScriptedExecution::Success {
            artifact: "solid".to_string(),
            output: String::new(),
        },
        ScriptedExecution::Success {
            artifact: "solid".to_string(),
            output: String::new(),
        },
    ]));
    let ctx = scripted_context(temp.path(), oracle, Arc::clone(&runtime));

    let pipeline = GenerationPipeline {
        steps: vec![
            GenerationStep::Initial {
                n: 3,
                max_iterations: 1,
                model: "test/model".to_string(),
                n_examples: 0,
            },
            GenerationStep::Improve {
                n: 3,
                max_iterations: 1,
                model: "test/model".to_string(),
                n_examples: 0,
            },
        ],
    };

    let kept = pipeline
        .execute(13, "a cube", &ctx)
        .expect("pipeline")
        .expect("results");

    assert_eq!(kept.len(), 1);
    assert_eq!(runtime.runs(), 3);

    // The two pass-through discards were deleted after the run.
    let remaining = std::fs::read_dir(temp.path())
        .expect("read root")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .count();
    assert_eq!(remaining, 1);
}
