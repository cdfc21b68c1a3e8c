//! Lifecycle events and the sinks they are delivered to.
//!
//! The core never talks to a transport: every emission point goes through
//! an [`EventSink`] injected at construction. [`NoopSink`] is the default;
//! [`BusSink`] fans events out on a tokio broadcast channel for event
//! listeners. [`OpsLog`] is the supervisor's own operational log — an
//! injected rotating sink written one line per decision, not a global.

use std::sync::Arc;

use chrono::Local;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::tm::logsink::LogSink;
use crate::tm::process::ProcessState;

/// Output channel of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogChannel {
    Stdout,
    Stderr,
}

impl LogChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogChannel::Stdout => "stdout",
            LogChannel::Stderr => "stderr",
        }
    }
}

/// A lifecycle event emitted by the core.
///
/// `kind()` yields the wire name the event-listener protocol uses
/// (`PROCESS_STATE_RUNNING`, `PROCESS_LOG_STDOUT`, `TICK_60`, ...).
#[derive(Debug, Clone, Serialize)]
pub enum Event {
    ProcessState {
        name: String,
        group: String,
        from: ProcessState,
        to: ProcessState,
        pid: u32,
    },
    ProcessLog {
        name: String,
        group: String,
        channel: LogChannel,
        pid: u32,
        data: String,
    },
    ProcessCommunication {
        name: String,
        group: String,
        channel: LogChannel,
        pid: u32,
        data: String,
    },
    Tick {
        period: u64,
        when: i64,
    },
}

impl Event {
    pub fn kind(&self) -> String {
        match self {
            Event::ProcessState { to, .. } => format!("PROCESS_STATE_{}", to.as_str()),
            Event::ProcessLog { channel, .. } => {
                format!("PROCESS_LOG_{}", channel.as_str().to_uppercase())
            }
            Event::ProcessCommunication { channel, .. } => {
                format!("PROCESS_COMMUNICATION_{}", channel.as_str().to_uppercase())
            }
            Event::Tick { period, .. } => format!("TICK_{period}"),
        }
    }
}

/// Destination for lifecycle events. Emission must not block: the state
/// machine calls this while holding the process runtime lock.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Default sink: discards everything.
#[derive(Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &Event) {}
}

/// Broadcast fan-out sink. Subscribers that fall behind lose the oldest
/// events; the emitter never waits for them.
pub struct BusSink {
    tx: broadcast::Sender<Event>,
}

impl BusSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for BusSink {
    fn emit(&self, event: &Event) {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
    }
}

/// Operational log of the supervisor itself.
///
/// One line per decision: `ts [component] app=<name> key=value ...`.
/// Constructed over a rotating [`LogSink`]; without one, lines are
/// dropped.
#[derive(Clone, Default)]
pub struct OpsLog {
    sink: Option<Arc<LogSink>>,
}

impl OpsLog {
    pub fn new(sink: Option<Arc<LogSink>>) -> Self {
        Self { sink }
    }

    pub fn log(&self, component: &str, app: Option<&str>, msg: impl AsRef<str>) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };
        let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
        let line = match app {
            Some(a) => format!("{ts} [{component}] app={a} {}\n", msg.as_ref()),
            None => format!("{ts} [{component}] {}\n", msg.as_ref()),
        };
        sink.append(line.as_bytes());
    }
}
