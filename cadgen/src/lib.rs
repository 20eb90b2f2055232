//! LLM-driven parametric CAD model generation.
//!
//! This crate turns a natural-language request into a parametric CAD script
//! by iteratively driving an LLM oracle, executing candidate scripts in a
//! subprocess sandbox, and feeding execution diagnostics back until a working
//! artifact converges. The architecture enforces a strict separation:
//!
//! - **[`programs`]**: the execution sandbox — code sanitization, export
//!   canonicalization, parameter extraction, subprocess execution, artifact
//!   lifecycle.
//! - **[`generation`]**: orchestration — the code-run-fix loop, generation
//!   steps, precision-indexed pipelines, and the agent session.
//! - **[`oracle`]**, **[`rag`]**, **[`visual`]**: boundary collaborators
//!   (LLM completion, example retrieval, visual critique/rendering) behind
//!   traits so tests can script them.

pub mod config;
pub mod gather;
pub mod generation;
pub mod logging;
pub mod oracle;
pub mod process;
pub mod programs;
pub mod rag;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod visual;
