//! # taskmaster
//!
//! Process supervisor core: launches, monitors, restarts, and stops a
//! configured set of child programs on a single host.
//!
//! This crate is the engine behind a supervisord-style daemon. It owns the
//! per-process state machine, the process registry and its group
//! operations, autorestart policy and backoff, zombie reaping, signal
//! dispatch, and per-stream log capture with numbered rotation. It does
//! NOT own the operator-facing surfaces: config-file parsing, the RPC
//! wire encoding, CLI, and daemonization are callers of this crate.
//!
//! The entry point is [`Supervisor`]: hand it an [`EventSink`] (or leave
//! the default no-op sink), feed it [`Program`] descriptors via
//! [`Supervisor::apply_config`], and drive it through the programmatic
//! API (`start_process`, `stop_process`, `signal_process`, ...). Each
//! operation exists in a by-name, by-group, and all-processes form, and
//! group forms return per-process results so partial success stays
//! visible.

pub mod tm;

pub use tm::error::Fault;
pub use tm::events::{BusSink, Event, EventSink, LogChannel, NoopSink, OpsLog};
pub use tm::logsink::LogSink;
pub use tm::manager::Manager;
pub use tm::process::{Process, ProcessState};
pub use tm::program::{Program, RestartPolicy};
pub use tm::supervisor::{GroupResult, ProcessInfo, ReloadOutcome, Supervisor};
