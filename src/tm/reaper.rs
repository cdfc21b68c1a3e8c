//! Zombie reaper.
//!
//! SIGCHLD is process-wide: any `waitpid(-1)` consumes exits for every
//! child in the host process, including children owned by a process's own
//! waiter. The reaper therefore keeps a process-wide registry of live
//! managers and offers every harvested status to each of them; the owning
//! process parks it for its waiter (which sees `ECHILD` instead of a
//! status). Statuses nobody claims belong to adopted orphans and are
//! discarded.
//!
//! Each manager runs its own reaper task (wakes on SIGCHLD, with a coarse
//! fallback tick since SIGCHLD coalesces); the task exits when its
//! manager is dropped. Draining never blocks and treats `ECHILD` as
//! "nothing left to reap".

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use tokio::signal::unix::{signal, SignalKind};

use crate::tm::manager::Manager;

const FALLBACK_TICK: Duration = Duration::from_millis(500);

/// Live managers exit statuses are offered to. Process-wide by necessity:
/// `waitpid(-1)` cannot be scoped to one manager.
static REGISTRY: Mutex<Vec<Weak<Manager>>> = Mutex::new(Vec::new());

/// Starts the reaper task for this manager. Idempotent per manager.
pub fn spawn_reaper(manager: &Arc<Manager>) {
    if manager.mark_reaper_started() {
        return;
    }
    {
        let mut reg = REGISTRY.lock().unwrap_or_else(|p| p.into_inner());
        reg.retain(|w| w.strong_count() > 0);
        reg.push(Arc::downgrade(manager));
    }
    let weak = Arc::downgrade(manager);
    let tasks = manager.tasks().clone();
    tasks.spawn(async move {
        let mut sigchld = match signal(SignalKind::child()) {
            Ok(s) => s,
            Err(_) => return,
        };
        loop {
            tokio::select! {
                _ = sigchld.recv() => {}
                _ = tokio::time::sleep(FALLBACK_TICK) => {}
            }
            if weak.upgrade().is_none() {
                break;
            }
            drain_exits();
        }
    });
}

/// Consumes every already-exited child, non-blocking.
fn drain_exits() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(WaitStatus::Exited(pid, code)) => route(pid.as_raw() as u32, code),
            Ok(WaitStatus::Signaled(pid, sig, _core)) => {
                route(pid.as_raw() as u32, 128 + sig as i32)
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

/// First manager to claim the pid wins; unclaimed statuses are dropped.
fn route(pid: u32, status: i32) {
    let managers: Vec<Arc<Manager>> = {
        let mut reg = REGISTRY.lock().unwrap_or_else(|p| p.into_inner());
        reg.retain(|w| w.strong_count() > 0);
        reg.iter().filter_map(|w| w.upgrade()).collect()
    };
    for m in managers {
        if m.route_exit(pid, status) {
            return;
        }
    }
}
