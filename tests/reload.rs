//! Reload integration: add/change/remove with running children.

use std::sync::Arc;

use taskmaster::{NoopSink, Program, Supervisor};

fn running_prog(name: &str, secs: &str) -> Program {
    let mut p = Program::new(
        name,
        vec!["/bin/sleep".to_string(), secs.to_string()],
    );
    p.startsecs = 0;
    p.autostart = true;
    p
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reload_add_change_remove() {
    let sup = Supervisor::new(Arc::new(NoopSink), None);

    let out = sup
        .apply_config(vec![running_prog("a", "60"), running_prog("b", "60")])
        .await;
    assert_eq!(out.added, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(sup.get_process_info("a").unwrap().statename, "RUNNING");
    assert_eq!(sup.get_process_info("b").unwrap().statename, "RUNNING");
    let old_b_pid = sup.get_process_info("b").unwrap().pid;

    // b changes its command, c is new, a vanishes.
    let out = sup
        .apply_config(vec![running_prog("b", "61"), running_prog("c", "60")])
        .await;
    assert_eq!(out.added, vec!["c".to_string()]);
    assert_eq!(out.changed, vec!["b".to_string()]);
    assert_eq!(out.removed, vec!["a".to_string()]);

    assert!(sup.get_process_info("a").is_err());
    let b = sup.get_process_info("b").unwrap();
    assert_eq!(b.statename, "RUNNING");
    assert_ne!(b.pid, old_b_pid, "changed program must run a fresh child");
    assert_eq!(
        sup.manager().find("b").unwrap().program().command,
        vec!["/bin/sleep".to_string(), "61".to_string()]
    );
    assert_eq!(sup.get_process_info("c").unwrap().statename, "RUNNING");

    sup.shutdown().await;
    for name in ["b", "c"] {
        assert_eq!(sup.get_process_info(name).unwrap().statename, "STOPPED");
    }
    assert!(sup.is_shutting_down());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reload_keeps_unchanged_processes_running() {
    let sup = Supervisor::new(Arc::new(NoopSink), None);
    sup.apply_config(vec![running_prog("keep", "60")]).await;
    let pid = sup.get_process_info("keep").unwrap().pid;
    assert!(pid > 0);

    let out = sup.apply_config(vec![running_prog("keep", "60")]).await;
    assert!(out.added.is_empty() && out.changed.is_empty() && out.removed.is_empty());
    assert_eq!(sup.get_process_info("keep").unwrap().pid, pid);

    sup.shutdown().await;
}
