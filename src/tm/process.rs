//! A supervised process: one runtime instance of a [`Program`].
//!
//! Owns the state machine, the spawned child and its pipes, the log
//! sinks, and the per-process locks. All state transitions happen under
//! the runtime mutex and are announced on a watch channel, which is the
//! condition variable operators wait on (`start(wait)`, `stop(wait)`).
//! An operation lock serializes operator start/stop/restart; it is never
//! held across a wait for child exit.
//!
//! Child exit has two claim paths: the per-process waiter (blocking
//! `Child::wait` on the blocking pool) claims first; when the global
//! reaper consumed the status instead, the waiter picks up the status the
//! manager parked here. Duplicate deliveries and stale timers are
//! discarded by a per-spawn epoch.

use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use chrono::Local;
use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::tm::error::Fault;
use crate::tm::events::{Event, EventSink, LogChannel, OpsLog};
use crate::tm::logsink::LogSink;
use crate::tm::program::{expand_tokens, Program, RestartPolicy};
use crate::tm::signals::send_signal;
use crate::tm::tasks::Tasks;

/// Longest delay between a failed start and the next attempt.
const BACKOFF_CAP_SECS: u32 = 10;
/// Grace period for an exit to be observed after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(10);
/// How long the waiter polls for a reaper-parked status after `ECHILD`.
const PARKED_EXIT_WAIT: Duration = Duration::from_secs(1);

pub const CAPTURE_BEGIN: &[u8] = b"<!--XSUPERVISOR:BEGIN-->";
pub const CAPTURE_END: &[u8] = b"<!--XSUPERVISOR:END-->";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "STOPPED",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Backoff => "BACKOFF",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Exited => "EXITED",
            ProcessState::Fatal => "FATAL",
            ProcessState::Unknown => "UNKNOWN",
        }
    }

    /// Numeric code the RPC layer reports (supervisor-compatible).
    pub fn code(&self) -> i32 {
        match self {
            ProcessState::Stopped => 0,
            ProcessState::Starting => 10,
            ProcessState::Running => 20,
            ProcessState::Backoff => 30,
            ProcessState::Stopping => 40,
            ProcessState::Exited => 100,
            ProcessState::Fatal => 200,
            ProcessState::Unknown => 1000,
        }
    }

    /// True for the states that own a live child (and a pid).
    pub fn has_child(&self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of the mutable runtime fields.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub state: ProcessState,
    pub pid: u32,
    pub start_time: Option<i64>,
    pub stop_time: Option<i64>,
    pub exit_status: Option<i32>,
    pub retry_count: u32,
    pub admin_stopped: bool,
    pub spawn_err: Option<String>,
}

#[derive(Debug)]
struct Runtime {
    state: ProcessState,
    pid: u32,
    start_time: Option<i64>,
    stop_time: Option<i64>,
    exit_status: Option<i32>,
    retry_count: u32,
    admin_stopped: bool,
    spawn_err: Option<String>,
    stdin: Option<ChildStdin>,
    /// Bumped on every spawn and on every cancellation point; timers,
    /// waiters, and parked statuses carrying a stale epoch are ignored.
    epoch: u64,
    exit_claimed: bool,
    parked_exit: Option<i32>,
    /// Whether the current spawn made it to RUNNING; a fast exit after
    /// that is still a successful start.
    reached_running: bool,
}

pub struct Process {
    program: Program,
    group: String,
    rt: Mutex<Runtime>,
    state_tx: watch::Sender<ProcessState>,
    state_rx: watch::Receiver<ProcessState>,
    op_lock: tokio::sync::Mutex<()>,
    stdout_sink: Arc<LogSink>,
    stderr_sink: Arc<LogSink>,
    events: Arc<dyn EventSink>,
    ops: OpsLog,
    tasks: Tasks,
}

impl Process {
    pub fn new(
        program: Program,
        events: Arc<dyn EventSink>,
        ops: OpsLog,
        tasks: Tasks,
    ) -> Arc<Self> {
        let stdout_sink = Arc::new(LogSink::new(
            program.stdout_log_path(),
            program.stdout_logfile_maxbytes,
            program.stdout_logfile_backups,
        ));
        let stderr_sink = Arc::new(LogSink::new(
            program.stderr_log_path(),
            program.stderr_logfile_maxbytes,
            program.stderr_logfile_backups,
        ));
        let (state_tx, state_rx) = watch::channel(ProcessState::Stopped);
        let group = program.group_name().to_string();
        Arc::new(Self {
            program,
            group,
            rt: Mutex::new(Runtime {
                state: ProcessState::Stopped,
                pid: 0,
                start_time: None,
                stop_time: None,
                exit_status: None,
                retry_count: 0,
                admin_stopped: false,
                spawn_err: None,
                stdin: None,
                epoch: 0,
                exit_claimed: false,
                parked_exit: None,
                reached_running: false,
            }),
            state_tx,
            state_rx,
            op_lock: tokio::sync::Mutex::new(()),
            stdout_sink,
            stderr_sink,
            events,
            ops,
            tasks,
        })
    }

    pub fn name(&self) -> &str {
        &self.program.name
    }

    pub fn group_name(&self) -> &str {
        &self.group
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn state(&self) -> ProcessState {
        self.lock_rt().state
    }

    pub fn pid(&self) -> u32 {
        self.lock_rt().pid
    }

    pub fn stdout_sink(&self) -> &Arc<LogSink> {
        &self.stdout_sink
    }

    pub fn stderr_sink(&self) -> &Arc<LogSink> {
        &self.stderr_sink
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let rt = self.lock_rt();
        ProcessSnapshot {
            state: rt.state,
            pid: rt.pid,
            start_time: rt.start_time,
            stop_time: rt.stop_time,
            exit_status: rt.exit_status,
            retry_count: rt.retry_count,
            admin_stopped: rt.admin_stopped,
            spawn_err: rt.spawn_err.clone(),
        }
    }

    /// Subscribe to state transitions (the per-process condition variable).
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    fn lock_rt(&self) -> std::sync::MutexGuard<'_, Runtime> {
        self.rt.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state_locked(&self, rt: &mut Runtime, to: ProcessState) {
        let from = rt.state;
        if from == to {
            return;
        }
        rt.state = to;
        self.state_tx.send_replace(to);
        self.events.emit(&Event::ProcessState {
            name: self.program.name.clone(),
            group: self.group.clone(),
            from,
            to,
            pid: rt.pid,
        });
        self.ops.log(
            "state",
            Some(&self.program.name),
            format!("from={} to={}", from.as_str(), to.as_str()),
        );
    }

    // ---- start ----

    /// Starts the process. With `wait`, suspends until it reaches RUNNING
    /// (success) or exhausts its retry budget (SPAWN_ERROR).
    pub async fn start(self: &Arc<Self>, wait: bool) -> Result<(), Fault> {
        {
            let _op = self.op_lock.lock().await;
            {
                let mut rt = self.lock_rt();
                if rt.state.has_child() {
                    return Err(Fault::AlreadyStarted(self.program.name.clone()));
                }
                rt.retry_count = 0;
                rt.admin_stopped = false;
            }
            self.spawn_attempt().await?;
        }
        if !wait {
            return Ok(());
        }
        self.wait_start_outcome().await
    }

    async fn wait_start_outcome(&self) -> Result<(), Fault> {
        let mut rx = self.state_rx.clone();
        let settled = rx
            .wait_for(|s| {
                matches!(
                    s,
                    ProcessState::Running
                        | ProcessState::Fatal
                        | ProcessState::Exited
                        | ProcessState::Stopped
                )
            })
            .await;
        let state = settled.map(|s| *s).unwrap_or_else(|_| self.state());
        if state == ProcessState::Running {
            return Ok(());
        }
        let rt = self.lock_rt();
        if rt.reached_running {
            // The start itself succeeded; the child just finished (or was
            // stopped) before we looked.
            return Ok(());
        }
        match state {
            ProcessState::Stopped => Err(Fault::Failed(format!(
                "{}: stopped before reaching RUNNING",
                self.program.name
            ))),
            _ => Err(Fault::SpawnError {
                name: self.program.name.clone(),
                detail: rt
                    .spawn_err
                    .clone()
                    .unwrap_or_else(|| "exited before start deadline".to_string()),
                last_exit: rt.exit_status,
            }),
        }
    }

    /// One spawn attempt. Caller holds the op lock (or is the backoff
    /// timer, which takes it). Only an empty command is an immediate
    /// fault; other spawn failures feed the backoff cycle.
    async fn spawn_attempt(self: &Arc<Self>) -> Result<(), Fault> {
        let argv = self.program.expanded_command();
        if argv.is_empty() || argv[0].trim().is_empty() {
            let mut rt = self.lock_rt();
            rt.spawn_err = Some("command is empty".to_string());
            self.set_state_locked(&mut rt, ProcessState::Fatal);
            return Err(Fault::SpawnError {
                name: self.program.name.clone(),
                detail: "command is empty".to_string(),
                last_exit: None,
            });
        }

        let epoch = {
            let mut rt = self.lock_rt();
            rt.epoch += 1;
            rt.exit_claimed = false;
            rt.parked_exit = None;
            rt.reached_running = false;
            rt.exit_status = None;
            rt.spawn_err = None;
            rt.start_time = Some(Local::now().timestamp());
            rt.admin_stopped = false;
            self.set_state_locked(&mut rt, ProcessState::Starting);
            rt.epoch
        };

        let prog = self.program.clone();
        let spawned = match self.tasks.spawn_blocking(move || spawn_child(&prog)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                self.ops.log(
                    "spawn",
                    Some(&self.program.name),
                    format!("outcome=error err={e:#}"),
                );
                let mut rt = self.lock_rt();
                rt.spawn_err = Some(format!("{e:#}"));
                self.enter_backoff_locked(&mut rt);
                return Ok(());
            }
            Err(e) => {
                let mut rt = self.lock_rt();
                rt.spawn_err = Some(format!("spawn task failed: {e}"));
                self.enter_backoff_locked(&mut rt);
                return Ok(());
            }
        };

        let pid = spawned.child.id();
        {
            let mut rt = self.lock_rt();
            rt.pid = pid;
            rt.stdin = spawned.stdin;
        }
        self.ops.log(
            "spawn",
            Some(&self.program.name),
            format!("outcome=spawned pid={pid} argv={}", argv.join(" ")),
        );

        // Readers attach before any RUNNING transition so log events never
        // precede the state event of the spawn they belong to.
        if let Some(out) = spawned.stdout {
            self.start_pump(LogChannel::Stdout, out, pid);
        }
        if let Some(err) = spawned.stderr {
            let channel = if self.program.redirect_stderr {
                LogChannel::Stdout
            } else {
                LogChannel::Stderr
            };
            self.start_pump(channel, err, pid);
        }

        // startsecs 0: RUNNING as soon as the spawn succeeded. This must
        // land before the exit waiter attaches, so a child that exits
        // instantly is classified as a RUNNING exit, not a failed start.
        if self.program.startsecs == 0 {
            let mut rt = self.lock_rt();
            if rt.epoch == epoch && rt.state == ProcessState::Starting {
                rt.retry_count = 0;
                rt.reached_running = true;
                self.set_state_locked(&mut rt, ProcessState::Running);
            }
        }
        self.start_exit_waiter(spawned.child, epoch);

        if self.program.startsecs > 0 {
            let this = Arc::clone(self);
            let secs = self.program.startsecs;
            self.tasks.spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                let mut rt = this.lock_rt();
                if rt.epoch == epoch && rt.state == ProcessState::Starting {
                    rt.retry_count = 0;
                    rt.reached_running = true;
                    this.set_state_locked(&mut rt, ProcessState::Running);
                }
            });
        }
        Ok(())
    }

    /// Failed start (spawn error or exit before the start deadline).
    /// BACKOFF with a capped delay, FATAL once retries are exhausted,
    /// STOPPED when the operator asked for a stop meanwhile.
    fn enter_backoff_locked(self: &Arc<Self>, rt: &mut Runtime) {
        rt.retry_count += 1;
        if rt.admin_stopped {
            self.set_state_locked(rt, ProcessState::Stopped);
            return;
        }
        self.set_state_locked(rt, ProcessState::Backoff);
        if rt.retry_count > self.program.startretries {
            self.set_state_locked(rt, ProcessState::Fatal);
            self.ops.log(
                "start",
                Some(&self.program.name),
                format!("outcome=fatal retries={}", rt.retry_count),
            );
            return;
        }
        let delay = Duration::from_secs(u64::from(rt.retry_count.min(BACKOFF_CAP_SECS)));
        let epoch = rt.epoch;
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            this.backoff_respawn(epoch).await;
        });
    }

    async fn backoff_respawn(self: Arc<Self>, epoch: u64) {
        let _op = self.op_lock.lock().await;
        {
            let rt = self.lock_rt();
            if rt.epoch != epoch || rt.state != ProcessState::Backoff || rt.admin_stopped {
                return;
            }
        }
        let _ = self.spawn_attempt().await;
    }

    // ---- stop ----

    /// Stops the process: graceful signals first, SIGKILL after the stop
    /// budget. Idempotent: already-stopped states return success. A stop
    /// from BACKOFF cancels the pending respawn.
    pub async fn stop(self: &Arc<Self>, wait: bool) -> Result<(), Fault> {
        let escalation = {
            let _op = self.op_lock.lock().await;
            let mut rt = self.lock_rt();
            rt.admin_stopped = true;
            match rt.state {
                ProcessState::Stopped
                | ProcessState::Exited
                | ProcessState::Fatal
                | ProcessState::Unknown => return Ok(()),
                ProcessState::Backoff => {
                    rt.epoch += 1;
                    self.set_state_locked(&mut rt, ProcessState::Stopped);
                    return Ok(());
                }
                ProcessState::Stopping => None,
                ProcessState::Starting | ProcessState::Running => {
                    self.set_state_locked(&mut rt, ProcessState::Stopping);
                    Some((rt.pid, rt.epoch))
                }
            }
        };

        match (escalation, wait) {
            (Some((pid, epoch)), true) => {
                self.escalate_stop(pid, epoch).await;
                Ok(())
            }
            (Some((pid, epoch)), false) => {
                let this = Arc::clone(self);
                self.tasks.spawn(async move {
                    this.escalate_stop(pid, epoch).await;
                });
                Ok(())
            }
            (None, true) => {
                // An earlier stop is escalating; just wait it out.
                let budget = Duration::from_secs(self.program.stopwaitsecs) + KILL_GRACE;
                let _ = self.wait_no_child(budget).await;
                Ok(())
            }
            (None, false) => Ok(()),
        }
    }

    async fn escalate_stop(&self, pid: u32, epoch: u64) {
        let sigs = self.program.stop_signal_list();
        let per_signal = Duration::from_millis(
            (self.program.stopwaitsecs.max(1) * 1000 / sigs.len() as u64).max(1),
        );
        for sig in sigs {
            if self.exit_claimed(epoch) {
                return;
            }
            self.ops.log(
                "stop",
                Some(&self.program.name),
                format!(
                    "attempt=signal sig={} as_group={}",
                    sig.as_str(),
                    self.program.stopasgroup
                ),
            );
            let _ = send_signal(pid, sig, self.program.stopasgroup);
            if self.wait_no_child(per_signal).await {
                return;
            }
        }
        self.ops.log(
            "stop",
            Some(&self.program.name),
            format!("attempt=kill as_group={}", self.program.killasgroup()),
        );
        let _ = send_signal(pid, Signal::SIGKILL, self.program.killasgroup());
        let _ = self.wait_no_child(KILL_GRACE).await;
    }

    fn exit_claimed(&self, epoch: u64) -> bool {
        let rt = self.lock_rt();
        rt.epoch != epoch || rt.exit_claimed
    }

    /// Waits on the state channel until no child is owned; true when that
    /// happened within the deadline.
    async fn wait_no_child(&self, dur: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let result = timeout(dur, rx.wait_for(|s| !s.has_child())).await.is_ok();
        result
    }

    // ---- signals / stdin ----

    /// Sends an arbitrary signal to the child. No state change.
    pub fn signal(&self, sig: Signal) -> Result<(), Fault> {
        let rt = self.lock_rt();
        if !rt.state.has_child() || rt.pid == 0 {
            return Err(Fault::NotRunning(self.program.name.clone()));
        }
        send_signal(rt.pid, sig, false).map_err(|e| {
            if e == nix::errno::Errno::ESRCH {
                Fault::NotRunning(self.program.name.clone())
            } else {
                Fault::Failed(format!("kill pid={}: {e}", rt.pid))
            }
        })
    }

    /// Writes bytes to the child's stdin.
    pub async fn write_stdin(self: &Arc<Self>, data: Vec<u8>) -> Result<(), Fault> {
        let mut stdin = {
            let mut rt = self.lock_rt();
            if !rt.state.has_child() {
                return Err(Fault::NotRunning(self.program.name.clone()));
            }
            match rt.stdin.take() {
                Some(s) => s,
                None => return Err(Fault::NotRunning(self.program.name.clone())),
            }
        };
        let joined = self
            .tasks
            .spawn_blocking(move || {
                let res = stdin.write_all(&data).and_then(|()| stdin.flush());
                (stdin, res)
            })
            .await;
        match joined {
            Ok((stdin, Ok(()))) => {
                let mut rt = self.lock_rt();
                if rt.state.has_child() {
                    rt.stdin = Some(stdin);
                }
                Ok(())
            }
            Ok((_, Err(e))) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(Fault::NotRunning(self.program.name.clone()))
            }
            Ok((_, Err(e))) => Err(Fault::Io(e.to_string())),
            Err(e) => Err(Fault::Failed(format!("stdin task failed: {e}"))),
        }
    }

    // ---- exit plumbing ----

    /// Reaper delivery: parks the status for the waiter when this process
    /// currently owns `pid`.
    pub(crate) fn offer_exit(&self, pid: u32, status: i32) -> bool {
        let mut rt = self.lock_rt();
        if rt.pid == pid && rt.state.has_child() {
            rt.parked_exit = Some(status);
            true
        } else {
            false
        }
    }

    fn start_exit_waiter(self: &Arc<Self>, mut child: Child, epoch: u64) {
        let this = Arc::clone(self);
        self.tasks.spawn_blocking(move || {
            let status = match child.wait() {
                Ok(st) => encode_exit_status(st),
                // ECHILD: the reaper won the race; its status arrives via
                // offer_exit.
                Err(_) => this.await_parked_exit(epoch),
            };
            this.handle_exit(epoch, status);
        });
    }

    fn await_parked_exit(&self, epoch: u64) -> i32 {
        let deadline = std::time::Instant::now() + PARKED_EXIT_WAIT;
        loop {
            {
                let rt = self.lock_rt();
                if rt.epoch != epoch {
                    return 1;
                }
                if let Some(code) = rt.parked_exit {
                    return code;
                }
            }
            if std::time::Instant::now() >= deadline {
                return 1;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Single entry point for a claimed child exit; drives the state
    /// machine. Never called with a lock held.
    fn handle_exit(self: &Arc<Self>, epoch: u64, status: i32) {
        let mut rt = self.lock_rt();
        if rt.epoch != epoch || rt.exit_claimed {
            return;
        }
        rt.exit_claimed = true;
        rt.pid = 0;
        rt.stdin = None;
        rt.exit_status = Some(status);
        rt.stop_time = Some(Local::now().timestamp());
        self.ops.log(
            "exit",
            Some(&self.program.name),
            format!("status={status} during={}", rt.state.as_str()),
        );
        match rt.state {
            ProcessState::Stopping => {
                self.set_state_locked(&mut rt, ProcessState::Stopped);
            }
            ProcessState::Starting => {
                // Exited before the start deadline.
                self.enter_backoff_locked(&mut rt);
            }
            ProcessState::Running => {
                if rt.admin_stopped {
                    self.set_state_locked(&mut rt, ProcessState::Stopped);
                    return;
                }
                let expected = self.program.exitcodes.contains(&status);
                match self.program.autorestart {
                    RestartPolicy::Never => {
                        self.set_state_locked(&mut rt, ProcessState::Exited)
                    }
                    RestartPolicy::Unexpected if expected => {
                        self.set_state_locked(&mut rt, ProcessState::Exited)
                    }
                    // Always, or Unexpected with an unexpected code:
                    // re-enter STARTING through backoff bookkeeping.
                    _ => self.enter_backoff_locked(&mut rt),
                }
            }
            _ => {}
        }
    }

    // ---- output plumbing ----

    fn start_pump<R: Read + Send + 'static>(
        self: &Arc<Self>,
        channel: LogChannel,
        mut pipe: R,
        pid: u32,
    ) {
        let this = Arc::clone(self);
        self.tasks.spawn_blocking(move || {
            let capture_max = match channel {
                LogChannel::Stdout => this.program.stdout_capture_maxbytes,
                LogChannel::Stderr => this.program.stderr_capture_maxbytes,
            };
            let mut scanner = CaptureScanner::new(capture_max);
            let mut buf = [0u8; 8192];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => this.handle_output(channel, pid, &buf[..n], &mut scanner),
                }
            }
        });
    }

    fn handle_output(
        &self,
        channel: LogChannel,
        pid: u32,
        data: &[u8],
        scanner: &mut CaptureScanner,
    ) {
        let (sink, events_enabled) = match channel {
            LogChannel::Stdout => (&self.stdout_sink, self.program.stdout_events_enabled),
            LogChannel::Stderr => (&self.stderr_sink, self.program.stderr_events_enabled),
        };
        for segment in scanner.feed(data) {
            match segment {
                Segment::Normal(bytes) => {
                    sink.append(&bytes);
                    if events_enabled {
                        self.events.emit(&Event::ProcessLog {
                            name: self.program.name.clone(),
                            group: self.group.clone(),
                            channel,
                            pid,
                            data: String::from_utf8_lossy(&bytes).into_owned(),
                        });
                    }
                }
                Segment::Capture(bytes) => {
                    self.events.emit(&Event::ProcessCommunication {
                        name: self.program.name.clone(),
                        group: self.group.clone(),
                        channel,
                        pid,
                        data: String::from_utf8_lossy(&bytes).into_owned(),
                    });
                }
            }
        }
        if let Some(e) = sink.take_error() {
            self.ops.log(
                "log",
                Some(&self.program.name),
                format!("stream={} append_error err={e}", channel.as_str()),
            );
        }
    }
}

fn encode_exit_status(st: std::process::ExitStatus) -> i32 {
    // Signal deaths use the shell convention so exitcodes stays an
    // integer-set test.
    st.code().unwrap_or_else(|| 128 + st.signal().unwrap_or(0))
}

struct SpawnedChild {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<std::process::ChildStdout>,
    stderr: Option<std::process::ChildStderr>,
}

/// Builds and forks the child. Runs on the blocking pool.
fn spawn_child(prog: &Program) -> anyhow::Result<SpawnedChild> {
    let argv = prog.expanded_command();
    anyhow::ensure!(!argv.is_empty(), "command is empty");

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);

    if let Some(dir) = prog.expanded_directory() {
        anyhow::ensure!(
            dir.is_dir(),
            "working directory {} does not exist (refuse to start {})",
            dir.display(),
            prog.name
        );
        cmd.current_dir(&dir);
    }

    let here = prog.here();
    for (k, v) in &prog.environment {
        cmd.env(k, expand_tokens(v, prog, &here));
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    // Resolve identities before the fork; lookups are not fork-safe.
    let ids: Option<(u32, u32)> = match prog.user.as_deref() {
        Some(name) => {
            let user = users::get_user_by_name(name)
                .ok_or_else(|| anyhow::anyhow!("unknown user: {name}"))?;
            Some((user.uid(), user.primary_group_id()))
        }
        None => None,
    };
    let umask = prog.umask;

    unsafe {
        cmd.pre_exec(move || {
            // New session: the child leads its own process group, so
            // stopasgroup/killasgroup can target the whole tree.
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(m) = umask {
                libc::umask(m as libc::mode_t);
            }
            if let Some((uid, gid)) = ids {
                if libc::setgid(gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setuid(uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    // Spawn failures include pre_exec errors; keep the OS error visible.
    let mut child = cmd.spawn().with_context(|| {
        format!("spawn {} cwd={:?}", argv.join(" "), prog.directory)
    })?;
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    Ok(SpawnedChild {
        child,
        stdin,
        stdout,
        stderr,
    })
}

enum Segment {
    Normal(Vec<u8>),
    Capture(Vec<u8>),
}

/// Splits an output stream into plain bytes and capture-mode segments
/// bounded by the BEGIN/END tokens, tolerating tokens split across read
/// chunks. `max == 0` disables capture entirely.
struct CaptureScanner {
    max: u64,
    capturing: bool,
    pending: Vec<u8>,
    body: Vec<u8>,
}

impl CaptureScanner {
    fn new(max: u64) -> Self {
        Self {
            max,
            capturing: false,
            pending: Vec::new(),
            body: Vec::new(),
        }
    }

    fn feed(&mut self, data: &[u8]) -> Vec<Segment> {
        if self.max == 0 {
            return vec![Segment::Normal(data.to_vec())];
        }
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(data);
        let mut out = Vec::new();
        let mut rest: &[u8] = &input;
        loop {
            let token: &[u8] = if self.capturing { CAPTURE_END } else { CAPTURE_BEGIN };
            match find(rest, token) {
                Some(i) => {
                    if self.capturing {
                        self.push_body(&rest[..i]);
                        out.push(Segment::Capture(std::mem::take(&mut self.body)));
                    } else if i > 0 {
                        out.push(Segment::Normal(rest[..i].to_vec()));
                    }
                    self.capturing = !self.capturing;
                    rest = &rest[i + token.len()..];
                }
                None => {
                    // Hold back a trailing partial token for the next chunk.
                    let keep = partial_suffix(rest, token);
                    let emit = &rest[..rest.len() - keep];
                    if !emit.is_empty() {
                        if self.capturing {
                            self.push_body(emit);
                        } else {
                            out.push(Segment::Normal(emit.to_vec()));
                        }
                    }
                    self.pending = rest[rest.len() - keep..].to_vec();
                    break;
                }
            }
        }
        out
    }

    fn push_body(&mut self, bytes: &[u8]) {
        let room = (self.max as usize).saturating_sub(self.body.len());
        self.body.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

/// Length of the longest strict prefix of `token` that `data` ends with.
fn partial_suffix(data: &[u8], token: &[u8]) -> usize {
    let max = data.len().min(token.len() - 1);
    for k in (1..=max).rev() {
        if data[data.len() - k..] == token[..k] {
            return k;
        }
    }
    0
}
