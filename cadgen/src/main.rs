//! LLM-driven parametric CAD model generator.
//!
//! Thin CLI over the library's [`Agent`] operations: `generate` builds a
//! model from a text prompt through the precision-selected pipeline,
//! `iterate` applies a follow-up request to the session's current model.
//! Prints the artifact path on success.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};

use cadgen::config::{CadConfig, load_config};
use cadgen::generation::agent::Agent;
use cadgen::generation::session::{load_session, write_session};
use cadgen::generation::{GenerationContext, ModelTiers};
use cadgen::oracle::OpenRouterClient;
use cadgen::programs::{InterpreterRuntime, ProgramStore, Sandbox};
use cadgen::rag::{
    CommandEmbedder, EmbeddingCache, ExampleRetriever, NullRetriever, SimilarityRetriever,
};
use cadgen::visual::{
    CommandRenderer, CommandVisualJudge, DisabledRenderer, Renderer, VisualJudge,
};

#[derive(Parser)]
#[command(
    name = "cadgen",
    version,
    about = "Generate parametric CAD models from natural-language prompts"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "cadgen.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new model from a prompt.
    Generate {
        /// The model description.
        #[arg(long)]
        prompt: String,
        /// Precision level 0 (cheapest) to 6 (most refined).
        #[arg(long, default_value_t = 0)]
        precision: u8,
        /// Session file to create for later iteration.
        #[arg(long)]
        session: Option<PathBuf>,
    },
    /// Apply a follow-up request to an existing session's model.
    Iterate {
        /// The change request.
        #[arg(long)]
        request: String,
        /// Session file created by `generate`.
        #[arg(long)]
        session: PathBuf,
    },
}

fn main() {
    cadgen::logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let ctx = build_context(&config)?;

    match cli.command {
        Command::Generate {
            prompt,
            precision,
            session,
        } => cmd_generate(&ctx, &prompt, precision, session.as_deref()),
        Command::Iterate { request, session } => cmd_iterate(&ctx, &request, &session),
    }
}

fn cmd_generate(
    ctx: &Arc<GenerationContext>,
    prompt: &str,
    precision: u8,
    session: Option<&Path>,
) -> Result<()> {
    let mut agent = Agent::initialize(prompt);
    let Some(program_id) = agent.generate_initial(precision, ctx)? else {
        bail!("generation failed: no candidate survived the pipeline");
    };
    if let Some(path) = session {
        write_session(path, &agent)?;
    }
    println!("{}", ctx.sandbox.store().stl_path(&program_id).display());
    Ok(())
}

fn cmd_iterate(ctx: &Arc<GenerationContext>, request: &str, session: &Path) -> Result<()> {
    let mut agent = load_session(session)?;
    let Some(program_id) = agent.generate_iteration(request, ctx)? else {
        bail!("iteration failed: the model was left unchanged");
    };
    write_session(session, &agent)?;
    println!("{}", ctx.sandbox.store().stl_path(&program_id).display());
    Ok(())
}

fn build_context(config: &CadConfig) -> Result<Arc<GenerationContext>> {
    let api_key = env::var(&config.oracle.api_key_env)
        .map_err(|_| anyhow!("missing {} in the environment", config.oracle.api_key_env))?;
    let oracle = Arc::new(OpenRouterClient::new(&config.oracle.base_url, api_key));

    let retriever = build_retriever(config)?;

    let renderer: Arc<dyn Renderer> = if config.renderer.command.is_empty() {
        Arc::new(DisabledRenderer)
    } else {
        Arc::new(CommandRenderer::new(
            config.renderer.command.clone(),
            Duration::from_secs(config.visual.timeout_secs),
            config.output_limit_bytes,
        ))
    };
    let visual: Arc<dyn VisualJudge> = Arc::new(CommandVisualJudge::new(
        config.visual.command.clone(),
        Duration::from_secs(config.visual.timeout_secs),
        config.output_limit_bytes,
    ));

    let sandbox = Arc::new(Sandbox::new(
        ProgramStore::new(&config.storage_root),
        Arc::new(InterpreterRuntime::new(
            config.interpreter.clone(),
            config.output_limit_bytes,
        )),
        renderer,
        Duration::from_secs(config.execution_timeout_secs),
    ));

    Ok(Arc::new(GenerationContext {
        oracle,
        retriever,
        visual,
        sandbox,
        models: ModelTiers {
            model: config.oracle.model.clone(),
            model_fast: config.oracle.model_fast.clone(),
        },
        oracle_timeout: Duration::from_secs(config.oracle.request_timeout_secs),
        max_workers: config.max_workers,
    }))
}

fn build_retriever(config: &CadConfig) -> Result<Arc<dyn ExampleRetriever>> {
    let Some(dataset_dir) = &config.retrieval.dataset_dir else {
        return Ok(Arc::new(NullRetriever));
    };
    if config.retrieval.embedder_command.is_empty() {
        bail!("retrieval.dataset_dir is set but retrieval.embedder_command is empty");
    }
    let embedder = Arc::new(CommandEmbedder::new(
        config.retrieval.embedder_command.clone(),
        Duration::from_secs(config.oracle.request_timeout_secs),
    ));
    let cache = Arc::new(
        EmbeddingCache::load(&config.retrieval.cache_path).context("load embedding cache")?,
    );
    let retriever = SimilarityRetriever::load(dataset_dir, embedder, cache)
        .context("load example dataset")?;
    Ok(Arc::new(retriever))
}
