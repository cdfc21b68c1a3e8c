//! Supervisor facade: the programmatic API the RPC layer adapts.
//!
//! Owns the manager, the injected sinks, and the reload/tick machinery.
//! Group and all-process operations return per-process result lists;
//! partial success is normal and stays visible to the caller.
//!
//! Construct inside a tokio runtime: the reaper and tick tasks are
//! spawned here.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::tm::error::Fault;
use crate::tm::events::{Event, EventSink, OpsLog};
use crate::tm::logsink::LogSink;
use crate::tm::manager::Manager;
use crate::tm::process::{Process, ProcessSnapshot, ProcessState};
use crate::tm::program::Program;
use crate::tm::reaper;
use crate::tm::signals::parse_signal;

/// Heartbeat periods, in seconds.
const TICK_PERIODS: [i64; 3] = [5, 60, 3600];

/// Snapshot of one process for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub group: String,
    pub description: String,
    pub start: i64,
    pub stop: i64,
    pub now: i64,
    pub state: i32,
    pub statename: String,
    pub spawnerr: String,
    pub exitstatus: i32,
    pub pid: u32,
    pub stdout_logfile: String,
    pub stderr_logfile: String,
}

/// Outcome of one process in a group/all operation.
#[derive(Debug, Clone, Serialize)]
pub struct GroupResult {
    pub name: String,
    pub group: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl GroupResult {
    fn new(name: &str, group: &str, res: Result<(), Fault>) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            ok: res.is_ok(),
            fault: res.err().map(|f| f.to_string()),
        }
    }
}

/// Group names touched by a reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReloadOutcome {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

pub struct Supervisor {
    manager: Arc<Manager>,
    events: Arc<dyn EventSink>,
    ops: OpsLog,
    restarting: AtomicBool,
    shutting_down: AtomicBool,
}

impl Supervisor {
    /// `ops_sink` receives the supervisor's own activity log; `events`
    /// receives lifecycle events. Both default to doing nothing.
    pub fn new(events: Arc<dyn EventSink>, ops_sink: Option<Arc<LogSink>>) -> Arc<Self> {
        let ops = OpsLog::new(ops_sink);
        let manager = Manager::new(Arc::clone(&events), ops.clone());
        reaper::spawn_reaper(&manager);
        let sup = Arc::new(Self {
            manager,
            events,
            ops,
            restarting: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });
        Self::spawn_ticker(&sup);
        sup
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// True while a reload is being applied.
    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Orderly exit path for the outer shell's signal handler.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.ops.log("shutdown", None, "attempt=stop_all");
        self.manager.stop_all_processes().await;
        self.ops.log("shutdown", None, "outcome=done");
    }

    fn spawn_ticker(sup: &Arc<Self>) {
        let weak = Arc::downgrade(sup);
        let tasks = sup.manager.tasks().clone();
        tasks.spawn(async move {
            let mut last = Local::now().timestamp();
            loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let Some(sup) = weak.upgrade() else { break };
                let now = Local::now().timestamp();
                for period in TICK_PERIODS {
                    if now / period != last / period {
                        sup.events.emit(&Event::Tick {
                            period: period as u64,
                            when: now,
                        });
                    }
                }
                last = now;
            }
        });
    }

    fn proc(&self, name: &str) -> Result<Arc<Process>, Fault> {
        self.manager
            .find(name)
            .ok_or_else(|| Fault::BadName(name.to_string()))
    }

    // ---- info ----

    pub fn get_all_process_info(&self) -> Vec<ProcessInfo> {
        let mut v: Vec<ProcessInfo> = self
            .manager
            .processes()
            .iter()
            .map(build_info)
            .collect();
        v.sort_by(|a, b| (&a.group, &a.name).cmp(&(&b.group, &b.name)));
        v
    }

    pub fn get_process_info(&self, name: &str) -> Result<ProcessInfo, Fault> {
        Ok(build_info(&self.proc(name)?))
    }

    // ---- start / stop / restart ----

    pub async fn start_process(&self, name: &str, wait: bool) -> Result<(), Fault> {
        self.proc(name)?.start(wait).await
    }

    pub async fn start_process_group(&self, group: &str, wait: bool) -> Vec<GroupResult> {
        let procs = self.manager.find_match(&format!("{group}:*"));
        self.fan_out(procs, wait, |p, wait| async move { p.start(wait).await })
            .await
    }

    pub async fn start_all_processes(&self, wait: bool) -> Vec<GroupResult> {
        let procs = self.manager.processes();
        self.fan_out(procs, wait, |p, wait| async move { p.start(wait).await })
            .await
    }

    pub async fn stop_process(&self, name: &str, wait: bool) -> Result<(), Fault> {
        self.proc(name)?.stop(wait).await
    }

    pub async fn stop_process_group(&self, group: &str, wait: bool) -> Vec<GroupResult> {
        let procs = self.manager.find_match(&format!("{group}:*"));
        self.fan_out(procs, wait, |p, wait| async move { p.stop(wait).await })
            .await
    }

    pub async fn stop_all_processes(&self, wait: bool) -> Vec<GroupResult> {
        let procs = self.manager.processes();
        self.fan_out(procs, wait, |p, wait| async move { p.stop(wait).await })
            .await
    }

    /// Stop (graceful, waited) then start again.
    pub async fn restart_process(&self, name: &str, wait: bool) -> Result<(), Fault> {
        let p = self.proc(name)?;
        p.stop(true).await?;
        p.start(wait).await
    }

    async fn fan_out<F, Fut>(
        &self,
        procs: Vec<Arc<Process>>,
        wait: bool,
        op: F,
    ) -> Vec<GroupResult>
    where
        F: Fn(Arc<Process>, bool) -> Fut,
        Fut: std::future::Future<Output = Result<(), Fault>> + Send + 'static,
    {
        let mut js: JoinSet<GroupResult> = JoinSet::new();
        for p in procs {
            let name = p.name().to_string();
            let group = p.group_name().to_string();
            let fut = op(Arc::clone(&p), wait);
            js.spawn(async move { GroupResult::new(&name, &group, fut.await) });
        }
        let mut out = Vec::new();
        while let Some(joined) = js.join_next().await {
            if let Ok(r) = joined {
                out.push(r);
            }
        }
        out.sort_by(|a, b| (&a.group, &a.name).cmp(&(&b.group, &b.name)));
        out
    }

    // ---- signals / stdin ----

    pub fn signal_process(&self, name: &str, signal: &str) -> Result<(), Fault> {
        let sig = parse_signal(signal)?;
        self.proc(name)?.signal(sig)
    }

    pub fn signal_process_group(&self, group: &str, signal: &str) -> Vec<GroupResult> {
        let procs = self.manager.find_match(&format!("{group}:*"));
        self.signal_many(procs, signal)
    }

    pub fn signal_all_processes(&self, signal: &str) -> Vec<GroupResult> {
        self.signal_many(self.manager.processes(), signal)
    }

    fn signal_many(&self, procs: Vec<Arc<Process>>, signal: &str) -> Vec<GroupResult> {
        let sig = match parse_signal(signal) {
            Ok(s) => s,
            Err(f) => {
                return procs
                    .iter()
                    .map(|p| GroupResult::new(p.name(), p.group_name(), Err(f.clone())))
                    .collect()
            }
        };
        procs
            .iter()
            .map(|p| GroupResult::new(p.name(), p.group_name(), p.signal(sig)))
            .collect()
    }

    pub async fn send_process_stdin(&self, name: &str, chars: &str) -> Result<(), Fault> {
        self.proc(name)?
            .write_stdin(chars.as_bytes().to_vec())
            .await
    }

    // ---- logs ----

    pub fn tail_process_stdout_log(
        &self,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<(String, u64, bool), Fault> {
        Ok(self.proc(name)?.stdout_sink().tail_log(offset, length))
    }

    pub fn tail_process_stderr_log(
        &self,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<(String, u64, bool), Fault> {
        Ok(self.proc(name)?.stderr_sink().tail_log(offset, length))
    }

    pub fn read_process_stdout_log(
        &self,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<String, Fault> {
        Ok(self.proc(name)?.stdout_sink().read_log(offset, length))
    }

    pub fn read_process_stderr_log(
        &self,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<String, Fault> {
        Ok(self.proc(name)?.stderr_sink().read_log(offset, length))
    }

    pub fn clear_process_logs(&self, name: &str) -> Result<(), Fault> {
        let p = self.proc(name)?;
        p.stdout_sink().clear();
        p.stderr_sink().clear();
        Ok(())
    }

    pub fn clear_all_process_logs(&self) -> Vec<GroupResult> {
        self.manager
            .processes()
            .iter()
            .map(|p| {
                p.stdout_sink().clear();
                p.stderr_sink().clear();
                GroupResult::new(p.name(), p.group_name(), Ok(()))
            })
            .collect()
    }

    // ---- reload ----

    /// Applies a new program set: changed descriptors are stopped and
    /// recreated, new ones created (and autostarted), vanished ones
    /// stopped and removed. Steps overlap; per-process locks keep each
    /// name race-free.
    pub async fn apply_config(&self, programs: Vec<Program>) -> ReloadOutcome {
        self.restarting.store(true, Ordering::SeqCst);
        let prev: HashMap<String, Arc<Process>> = self
            .manager
            .processes()
            .iter()
            .map(|p| (p.name().to_string(), Arc::clone(p)))
            .collect();
        let new_names: HashSet<String> = programs.iter().map(|p| p.name.clone()).collect();

        let mut added: BTreeSet<String> = BTreeSet::new();
        let mut changed: BTreeSet<String> = BTreeSet::new();
        let mut removed: BTreeSet<String> = BTreeSet::new();
        let mut js: JoinSet<()> = JoinSet::new();

        for prog in programs {
            match prev.get(&prog.name) {
                Some(existing) if *existing.program() == prog => {}
                Some(existing) => {
                    changed.insert(prog.group_name().to_string());
                    self.ops
                        .log("reload", Some(&prog.name), "decision=recreate reason=changed");
                    let old = Arc::clone(existing);
                    let mgr = Arc::clone(&self.manager);
                    js.spawn(async move {
                        let _ = old.stop(true).await;
                        mgr.remove(old.name());
                        let autostart = prog.autostart;
                        let p = mgr.create_process(prog);
                        if autostart {
                            let _ = p.start(true).await;
                        }
                    });
                }
                None => {
                    added.insert(prog.group_name().to_string());
                    self.ops
                        .log("reload", Some(&prog.name), "decision=create reason=new");
                    let mgr = Arc::clone(&self.manager);
                    js.spawn(async move {
                        let autostart = prog.autostart;
                        let p = mgr.create_process(prog);
                        if autostart {
                            let _ = p.start(true).await;
                        }
                    });
                }
            }
        }

        for (name, p) in prev.iter() {
            if new_names.contains(name) {
                continue;
            }
            removed.insert(p.group_name().to_string());
            self.ops
                .log("reload", Some(name), "decision=remove reason=vanished");
            let old = Arc::clone(p);
            let mgr = Arc::clone(&self.manager);
            js.spawn(async move {
                let _ = old.stop(true).await;
                mgr.remove(old.name());
            });
        }

        while js.join_next().await.is_some() {}
        self.restarting.store(false, Ordering::SeqCst);
        ReloadOutcome {
            added: added.into_iter().collect(),
            changed: changed.into_iter().collect(),
            removed: removed.into_iter().collect(),
        }
    }

    /// Convenience: start everything flagged autostart, waiting for each
    /// to settle.
    pub async fn start_autostart_programs(&self) {
        self.manager.start_autostart_programs().await;
    }
}

fn build_info(p: &Arc<Process>) -> ProcessInfo {
    let snap = p.snapshot();
    let now = Local::now().timestamp();
    ProcessInfo {
        name: p.name().to_string(),
        group: p.group_name().to_string(),
        description: describe(&snap, now),
        start: snap.start_time.unwrap_or(0),
        stop: snap.stop_time.unwrap_or(0),
        now,
        state: snap.state.code(),
        statename: snap.state.as_str().to_string(),
        spawnerr: snap.spawn_err.clone().unwrap_or_default(),
        exitstatus: snap.exit_status.unwrap_or(0),
        pid: snap.pid,
        stdout_logfile: p
            .stdout_sink()
            .path()
            .map(|q| q.display().to_string())
            .unwrap_or_default(),
        stderr_logfile: p
            .stderr_sink()
            .path()
            .map(|q| q.display().to_string())
            .unwrap_or_default(),
    }
}

fn describe(snap: &ProcessSnapshot, now: i64) -> String {
    match snap.state {
        ProcessState::Running => {
            let up = now - snap.start_time.unwrap_or(now);
            format!("pid {}, uptime {}", snap.pid, fmt_uptime(up.max(0)))
        }
        ProcessState::Backoff | ProcessState::Fatal => snap
            .spawn_err
            .clone()
            .unwrap_or_else(|| "exited too quickly".to_string()),
        ProcessState::Exited | ProcessState::Stopped => match snap.stop_time {
            Some(ts) => chrono::DateTime::from_timestamp(ts, 0)
                .map(|t| t.format("%b %d %H:%M %p").to_string())
                .unwrap_or_default(),
            None => "Not started".to_string(),
        },
        _ => String::new(),
    }
}

fn fmt_uptime(secs: i64) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tm::events::NoopSink;

    fn supervisor() -> Arc<Supervisor> {
        Supervisor::new(Arc::new(NoopSink), None)
    }

    fn prog(name: &str, group: Option<&str>) -> Program {
        let mut p = Program::new(name, vec!["/bin/true".into()]);
        p.group = group.map(|g| g.to_string());
        p.autostart = false;
        p
    }

    #[tokio::test]
    async fn unknown_names_fault_with_bad_name() {
        let sup = supervisor();
        assert!(matches!(
            sup.get_process_info("ghost"),
            Err(Fault::BadName(_))
        ));
        assert!(matches!(
            sup.start_process("ghost", false).await,
            Err(Fault::BadName(_))
        ));
        assert!(matches!(
            sup.signal_process("ghost", "TERM"),
            Err(Fault::BadName(_))
        ));
        assert!(matches!(
            sup.tail_process_stdout_log("ghost", 0, 10),
            Err(Fault::BadName(_))
        ));
    }

    #[tokio::test]
    async fn bad_signal_is_checked_before_state() {
        let sup = supervisor();
        sup.manager().create_process(prog("a", None));
        assert!(matches!(
            sup.signal_process("a", "NOPE"),
            Err(Fault::BadSignal(_))
        ));
        // Known signal, not running: NOT_RUNNING with no side effects.
        assert!(matches!(
            sup.signal_process("a", "USR1"),
            Err(Fault::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn info_is_sorted_by_group_then_name() {
        let sup = supervisor();
        sup.manager().create_process(prog("zz", Some("aa")));
        sup.manager().create_process(prog("mm", None));
        sup.manager().create_process(prog("bb", Some("aa")));
        let infos = sup.get_all_process_info();
        let keys: Vec<(String, String)> = infos
            .iter()
            .map(|i| (i.group.clone(), i.name.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("aa".to_string(), "bb".to_string()),
                ("aa".to_string(), "zz".to_string()),
                ("mm".to_string(), "mm".to_string()),
            ]
        );
        assert_eq!(infos[0].statename, "STOPPED");
        assert_eq!(infos[0].state, 0);
    }

    #[tokio::test]
    async fn reload_reports_added_changed_removed_groups() {
        let sup = supervisor();
        let out = sup
            .apply_config(vec![prog("a", None), prog("b", None)])
            .await;
        assert_eq!(out.added, vec!["a".to_string(), "b".to_string()]);
        assert!(out.changed.is_empty());
        assert!(out.removed.is_empty());

        // b changes command; c appears; a vanishes.
        let mut b2 = prog("b", None);
        b2.command = vec!["/bin/true".into(), "-x".into()];
        let out = sup.apply_config(vec![b2.clone(), prog("c", None)]).await;
        assert_eq!(out.added, vec!["c".to_string()]);
        assert_eq!(out.changed, vec!["b".to_string()]);
        assert_eq!(out.removed, vec!["a".to_string()]);

        assert!(sup.manager().find("a").is_none());
        assert_eq!(
            sup.manager().find("b").unwrap().program().command,
            b2.command
        );
        assert!(sup.manager().find("c").is_some());
        assert!(!sup.is_restarting());
    }

    #[tokio::test]
    async fn reload_is_a_no_op_for_identical_descriptors() {
        let sup = supervisor();
        sup.apply_config(vec![prog("a", None)]).await;
        let before = Arc::as_ptr(&sup.manager().find("a").unwrap());
        let out = sup.apply_config(vec![prog("a", None)]).await;
        assert_eq!(out, ReloadOutcome::default());
        let after = Arc::as_ptr(&sup.manager().find("a").unwrap());
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn group_results_cover_every_member() {
        let sup = supervisor();
        sup.manager().create_process(prog("a", Some("g")));
        sup.manager().create_process(prog("b", Some("g")));
        sup.manager().create_process(prog("x", None));
        let res = sup.stop_process_group("g", true).await;
        let names: Vec<_> = res.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert!(res.iter().all(|r| r.ok));
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(fmt_uptime(0), "0:00:00");
        assert_eq!(fmt_uptime(3661), "1:01:01");
        assert_eq!(fmt_uptime(7322), "2:02:02");
    }
}
