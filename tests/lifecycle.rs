//! End-to-end lifecycle scenarios with real children.

use std::sync::Arc;
use std::time::{Duration, Instant};

use taskmaster::{
    BusSink, Event, EventSink, Fault, NoopSink, ProcessState, Program, Supervisor,
};
use tempfile::TempDir;

fn noop_supervisor() -> Arc<Supervisor> {
    Supervisor::new(Arc::new(NoopSink), None)
}

fn program(name: &str, argv: &[&str]) -> Program {
    let mut p = Program::new(name, argv.iter().map(|s| s.to_string()).collect());
    p.autostart = false;
    p
}

fn sh(name: &str, script: &str) -> Program {
    program(name, &["/bin/sh", "-c", script])
}

fn drain_state_names(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        if let Event::ProcessState { to, .. } = ev {
            out.push(to.as_str().to_string());
        }
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn normal_start_reaches_running() {
    let sup = noop_supervisor();
    let mut p = program("ok", &["/bin/sleep", "60"]);
    p.startsecs = 1;
    sup.manager().create_process(p);

    sup.start_process("ok", true).await.unwrap();
    let info = sup.get_process_info("ok").unwrap();
    assert_eq!(info.statename, "RUNNING");
    assert!(info.pid > 0);
    assert!(info.description.starts_with(&format!("pid {}", info.pid)));

    // A second start is rejected without side effects.
    assert!(matches!(
        sup.start_process("ok", true).await,
        Err(Fault::AlreadyStarted(_))
    ));
    assert_eq!(sup.get_process_info("ok").unwrap().pid, info.pid);

    sup.stop_process("ok", true).await.unwrap();
    let info = sup.get_process_info("ok").unwrap();
    assert_eq!(info.statename, "STOPPED");
    assert_eq!(info.pid, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_start_walks_backoff_to_fatal() {
    let bus = Arc::new(BusSink::new(256));
    let mut rx = bus.subscribe();
    let sink: Arc<dyn EventSink> = bus.clone();
    let sup = Supervisor::new(sink, None);

    let mut p = program("bad", &["/bin/false"]);
    p.startsecs = 1;
    p.startretries = 2;
    sup.manager().create_process(p);

    let err = sup.start_process("bad", true).await.unwrap_err();
    match err {
        Fault::SpawnError { last_exit, .. } => assert_eq!(last_exit, Some(1)),
        other => panic!("expected SpawnError, got {other:?}"),
    }

    let proc = sup.manager().find("bad").unwrap();
    assert_eq!(proc.state(), ProcessState::Fatal);
    assert_eq!(proc.snapshot().retry_count, 3);

    let states = drain_state_names(&mut rx);
    assert_eq!(
        states,
        vec![
            "STARTING", "BACKOFF", "STARTING", "BACKOFF", "STARTING", "BACKOFF", "FATAL"
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_stop_delivers_one_term() {
    let sup = noop_supervisor();
    let mut p = sh("srv", "trap 'exit 0' TERM; while :; do sleep 1; done");
    p.startsecs = 0;
    p.stopwaitsecs = 10;
    sup.manager().create_process(p);

    sup.start_process("srv", true).await.unwrap();
    let t0 = Instant::now();
    sup.stop_process("srv", true).await.unwrap();
    assert!(t0.elapsed() < Duration::from_secs(8));

    let info = sup.get_process_info("srv").unwrap();
    assert_eq!(info.statename, "STOPPED");
    assert_eq!(info.exitstatus, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stubborn_child_is_killed_after_the_stop_budget() {
    let sup = noop_supervisor();
    let mut p = sh("stubborn", "trap '' TERM; while :; do sleep 1; done");
    p.startsecs = 0;
    p.stopwaitsecs = 2;
    sup.manager().create_process(p);

    sup.start_process("stubborn", true).await.unwrap();
    let t0 = Instant::now();
    sup.stop_process("stubborn", true).await.unwrap();
    let elapsed = t0.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "killed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "killed too late: {elapsed:?}");

    let info = sup.get_process_info("stubborn").unwrap();
    assert_eq!(info.statename, "STOPPED");
    assert_eq!(info.exitstatus, 128 + 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_start_covers_every_member() {
    let sup = noop_supervisor();
    for (name, startsecs) in [("g1", 0u64), ("g2", 1), ("g3", 2)] {
        let mut p = program(name, &["/bin/sleep", "60"]);
        p.group = Some("g".to_string());
        p.startsecs = startsecs;
        sup.manager().create_process(p);
    }

    let results = sup.start_process_group("g", true).await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.ok), "{results:?}");
    for name in ["g1", "g2", "g3"] {
        assert_eq!(sup.get_process_info(name).unwrap().statename, "RUNNING");
    }

    let results = sup.stop_process_group("g", true).await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.ok));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_is_idempotent() {
    let sup = noop_supervisor();
    let mut p = program("idem", &["/bin/sleep", "60"]);
    p.startsecs = 0;
    sup.manager().create_process(p);

    sup.start_process("idem", true).await.unwrap();
    sup.stop_process("idem", true).await.unwrap();
    sup.stop_process("idem", true).await.unwrap();
    assert_eq!(sup.get_process_info("idem").unwrap().statename, "STOPPED");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expected_exit_lands_in_exited_and_stays() {
    let sup = noop_supervisor();
    let mut p = sh("oneshot", "exit 0");
    p.startsecs = 0;
    sup.manager().create_process(p);

    sup.start_process("oneshot", true).await.unwrap();
    let proc = sup.manager().find("oneshot").unwrap();
    let mut rx = proc.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| *s == ProcessState::Exited),
    )
    .await
    .expect("exit observed")
    .unwrap();

    // autorestart=unexpected with code 0 expected: no respawn.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(proc.state(), ProcessState::Exited);
    assert_eq!(proc.snapshot().exit_status, Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admin_stop_cancels_backoff_respawn() {
    let sup = noop_supervisor();
    let mut p = program("flappy", &["/bin/false"]);
    p.startsecs = 1;
    p.startretries = 10;
    sup.manager().create_process(p);

    sup.start_process("flappy", false).await.unwrap();
    let proc = sup.manager().find("flappy").unwrap();
    let mut rx = proc.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| *s == ProcessState::Backoff),
    )
    .await
    .expect("backoff observed")
    .unwrap();

    sup.stop_process("flappy", true).await.unwrap();
    assert_eq!(proc.state(), ProcessState::Stopped);

    // Past the respawn delay: admin stop still wins.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(proc.state(), ProcessState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stdin_reaches_the_child_and_stdout_reaches_the_sink() {
    let dir = TempDir::new().unwrap();
    let sup = noop_supervisor();
    let mut p = program("cat", &["/bin/cat"]);
    p.startsecs = 0;
    p.stdout_logfile = Some(dir.path().join("cat.out"));
    sup.manager().create_process(p);

    sup.start_process("cat", true).await.unwrap();
    sup.send_process_stdin("cat", "hello from the operator\n")
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let data = sup.read_process_stdout_log("cat", 0, 4096).unwrap();
        if data.contains("hello from the operator") {
            break;
        }
        assert!(Instant::now() < deadline, "stdout never reached the sink");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    sup.stop_process("cat", true).await.unwrap();
    // Dead child: stdin writes report NOT_RUNNING.
    assert!(matches!(
        sup.send_process_stdin("cat", "late\n").await,
        Err(Fault::NotRunning(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capture_segments_become_communication_events() {
    let bus = Arc::new(BusSink::new(256));
    let mut rx = bus.subscribe();
    let sink: Arc<dyn EventSink> = bus.clone();
    let sup = Supervisor::new(sink, None);

    let mut p = sh(
        "talker",
        "printf 'plain<!--XSUPERVISOR:BEGIN-->secret payload<!--XSUPERVISOR:END-->more'; sleep 30",
    );
    p.startsecs = 0;
    p.stdout_capture_maxbytes = 4096;
    p.stdout_events_enabled = true;
    sup.manager().create_process(p);
    sup.start_process("talker", true).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut captured = None;
    while captured.is_none() && Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Ok(Event::ProcessCommunication { data, .. })) => captured = Some(data),
            _ => {}
        }
    }
    assert_eq!(captured.as_deref(), Some("secret payload"));

    sup.stop_process("talker", true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn signal_is_delivered_to_a_running_child() {
    let sup = noop_supervisor();
    let mut p = sh("sig", "trap 'exit 42' USR1; while :; do sleep 1; done");
    p.startsecs = 0;
    p.exitcodes = vec![42];
    sup.manager().create_process(p);

    sup.start_process("sig", true).await.unwrap();
    sup.signal_process("sig", "USR1").unwrap();

    let proc = sup.manager().find("sig").unwrap();
    let mut rx = proc.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| *s == ProcessState::Exited),
    )
    .await
    .expect("exit observed")
    .unwrap();
    assert_eq!(proc.snapshot().exit_status, Some(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ticks_are_emitted() {
    let bus = Arc::new(BusSink::new(256));
    let mut rx = bus.subscribe();
    let sink: Arc<dyn EventSink> = bus.clone();
    let _sup = Supervisor::new(sink, None);

    let deadline = Instant::now() + Duration::from_secs(7);
    loop {
        match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Ok(Event::Tick { period: 5, .. })) => break,
            _ => assert!(Instant::now() < deadline, "no TICK_5 within 7s"),
        }
    }
}
