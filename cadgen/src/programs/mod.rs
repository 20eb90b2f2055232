//! The program execution sandbox.
//!
//! A "program" is one generated CAD script plus the artifacts its execution
//! produced, keyed by a [`id::ProgramId`] and stored in its own directory.
//! Candidate source text goes through sanitization, export canonicalization,
//! and parameter extraction before it is ever run; execution happens in a
//! subprocess with a hard timeout, and success is judged solely by the
//! exported geometry file existing afterwards.

pub mod executor;
pub mod id;
pub mod params;
pub mod rewrite;
pub mod sanitize;
pub mod storage;

pub use executor::{FirstRun, InterpreterRuntime, Sandbox, ScriptRuntime};
pub use id::ProgramId;
pub use storage::ProgramStore;
