//! Process registry and group operations.
//!
//! The registry mutex protects the name→process map only; per-process
//! state has its own lock. Lock order is registry → process, never the
//! reverse, and the registry lock is never held across an await, so group
//! operations on different processes run concurrently while per-process
//! locks keep each process serialized.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::tm::events::{EventSink, OpsLog};
use crate::tm::process::Process;
use crate::tm::program::Program;
use crate::tm::tasks::Tasks;

pub struct Manager {
    procs: Mutex<HashMap<String, Arc<Process>>>,
    events: Arc<dyn EventSink>,
    ops: OpsLog,
    tasks: Tasks,
    reaper_started: AtomicBool,
}

impl Manager {
    pub fn new(events: Arc<dyn EventSink>, ops: OpsLog) -> Arc<Self> {
        Arc::new(Self {
            procs: Mutex::new(HashMap::new()),
            events,
            ops,
            tasks: Tasks::new(),
            reaper_started: AtomicBool::new(false),
        })
    }

    pub fn tasks(&self) -> &Tasks {
        &self.tasks
    }

    pub(crate) fn mark_reaper_started(&self) -> bool {
        self.reaper_started.swap(true, Ordering::SeqCst)
    }

    fn lock_procs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Process>>> {
        self.procs.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers a process for `program`. Idempotent by name: an existing
    /// process is returned untouched.
    pub fn create_process(&self, program: Program) -> Arc<Process> {
        let mut g = self.lock_procs();
        if let Some(existing) = g.get(&program.name) {
            return Arc::clone(existing);
        }
        let name = program.name.clone();
        let proc = Process::new(
            program,
            Arc::clone(&self.events),
            self.ops.clone(),
            self.tasks.clone(),
        );
        g.insert(name.clone(), Arc::clone(&proc));
        drop(g);
        self.ops.log("manager", Some(&name), "created");
        proc
    }

    /// Unregisters and returns the process; the caller is responsible for
    /// stopping it.
    pub fn remove(&self, name: &str) -> Option<Arc<Process>> {
        let removed = self.lock_procs().remove(name);
        if removed.is_some() {
            self.ops.log("manager", Some(name), "removed");
        }
        removed
    }

    pub fn find(&self, name: &str) -> Option<Arc<Process>> {
        self.lock_procs().get(name).cloned()
    }

    /// Matches `name`, `group:name`, or `group:*`.
    pub fn find_match(&self, pattern: &str) -> Vec<Arc<Process>> {
        let mut out: Vec<Arc<Process>> = match pattern.split_once(':') {
            None => self
                .lock_procs()
                .get(pattern)
                .cloned()
                .into_iter()
                .collect(),
            Some((group, "*")) => self
                .lock_procs()
                .values()
                .filter(|p| p.group_name() == group)
                .cloned()
                .collect(),
            Some((group, name)) => self
                .lock_procs()
                .values()
                .filter(|p| p.group_name() == group && p.name() == name)
                .cloned()
                .collect(),
        };
        sort_for_dispatch(&mut out);
        out
    }

    /// All processes in `(priority, name)` order.
    pub fn processes(&self) -> Vec<Arc<Process>> {
        let mut v: Vec<Arc<Process>> = self.lock_procs().values().cloned().collect();
        sort_for_dispatch(&mut v);
        v
    }

    pub fn len(&self) -> usize {
        self.lock_procs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_procs().is_empty()
    }

    /// Synchronous iteration in `(priority, name)` order.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Process>)) {
        for p in self.processes() {
            f(&p);
        }
    }

    /// Fans `f` out across all processes on the worker pool. Each
    /// completion sends the process on `done`; the returned count is how
    /// many completions the caller should drain.
    pub fn async_for_each<F, Fut>(
        &self,
        f: F,
        done: mpsc::UnboundedSender<Arc<Process>>,
    ) -> usize
    where
        F: Fn(Arc<Process>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let procs = self.processes();
        let n = procs.len();
        for p in procs {
            let fut = f(Arc::clone(&p));
            let done = done.clone();
            self.tasks.spawn(async move {
                fut.await;
                let _ = done.send(p);
            });
        }
        n
    }

    /// Starts every autostart process concurrently, dispatching in
    /// priority order, and waits for all of them to settle (RUNNING or
    /// FATAL). Per-process failures are the processes' own business here.
    pub async fn start_autostart_programs(&self) {
        let mut js: JoinSet<()> = JoinSet::new();
        for p in self.processes() {
            if !p.program().autostart {
                continue;
            }
            js.spawn(async move {
                let _ = p.start(true).await;
            });
        }
        while js.join_next().await.is_some() {}
    }

    /// Concurrent stop of everything; returns once all processes are in a
    /// terminal non-running state.
    pub async fn stop_all_processes(&self) {
        let mut js: JoinSet<()> = JoinSet::new();
        for p in self.processes() {
            js.spawn(async move {
                let _ = p.stop(true).await;
            });
        }
        while js.join_next().await.is_some() {}
        self.ops.log("manager", None, "stop_all outcome=done");
    }

    /// Reaper delivery path: offers an exit status to the process owning
    /// `pid`. False when no process claims it (orphan, already handled).
    pub fn route_exit(&self, pid: u32, status: i32) -> bool {
        let procs: Vec<Arc<Process>> = self.lock_procs().values().cloned().collect();
        for p in procs {
            if p.offer_exit(pid, status) {
                return true;
            }
        }
        false
    }
}

fn sort_for_dispatch(v: &mut [Arc<Process>]) {
    v.sort_by(|a, b| {
        (a.program().priority, a.name().to_string())
            .cmp(&(b.program().priority, b.name().to_string()))
    });
}
