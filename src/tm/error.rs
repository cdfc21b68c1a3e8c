//! Fault kinds surfaced by the supervisor core.
//!
//! The RPC layer maps these to numeric fault codes; inside the core they
//! are ordinary typed errors. Log/rotation I/O problems are deliberately
//! NOT here: those are reported to the ops log and swallowed, they never
//! fail the process they belong to.

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum Fault {
    /// No process is registered under this name.
    #[error("no such process: {0}")]
    BadName(String),

    /// The signal name does not resolve to a platform signal.
    #[error("unknown signal: {0}")]
    BadSignal(String),

    /// The operation requires a live child and the process has none.
    #[error("process {0} is not running")]
    NotRunning(String),

    /// `start` was issued while the process already has a child.
    #[error("process {0} is already started")]
    AlreadyStarted(String),

    /// The process failed to reach RUNNING within its retry budget.
    #[error("process {name} failed to start: {detail}")]
    SpawnError {
        name: String,
        detail: String,
        /// Exit status of the last failed attempt, when one was observed.
        last_exit: Option<i32>,
    },

    #[error("i/o error: {0}")]
    Io(String),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("operation failed: {0}")]
    Failed(String),
}

impl Fault {
    /// Short stable label (snake_case) for logs and the RPC fault table.
    pub fn as_label(&self) -> &'static str {
        match self {
            Fault::BadName(_) => "bad_name",
            Fault::BadSignal(_) => "bad_signal",
            Fault::NotRunning(_) => "not_running",
            Fault::AlreadyStarted(_) => "already_started",
            Fault::SpawnError { .. } => "spawn_error",
            Fault::Io(_) => "io_error",
            Fault::BadArguments(_) => "bad_arguments",
            Fault::Failed(_) => "failed",
        }
    }
}

impl From<std::io::Error> for Fault {
    fn from(e: std::io::Error) -> Self {
        Fault::Io(e.to_string())
    }
}
