//! The dit language engine: a streaming tokenizer and evaluator for `.dit`
//! files, a class and Lang object model, and an out-of-process daemon that
//! runs guest-language functions and lets them call back into dit.

pub mod daemon;
pub mod diagnostics;
pub mod environment;
mod evaluator;
pub mod grammar;
pub mod inheritance;
pub mod lexer;
pub mod object;
pub mod preprocessor;
pub mod repl;
pub mod runtime;
pub mod stdlib;
pub mod value;

pub use daemon::{GuestDaemonJob, JobKind, LaunchSpec, WorkerLauncher, WorkerProcess};
pub use diagnostics::{CodeLocation, Diagnostic, DiagnosticKind, DitError, FileFailure};
pub use evaluator::Signal;
pub use repl::Repl;
pub use runtime::{ExecutionContext, Interpreter};
pub use value::Value;
