
use std::sync::Arc;
use std::time::Duration;

use halyard_proto::{CallType, FrameworkId};
use halyard_scheduler::connection::{ConnectionState, SessionEnd};
use halyard_scheduler::context::SchedulerContext;
use halyard_scheduler::state::{KvStore, MemoryKv};
use halyard_scheduler::supervisor::Supervisor;
use harness::{
    bare_subscribed_event, config_for, subscribed_event, update_event, FakeMaster, Scheduler, WAIT,
};
use tokio::sync::watch;
use tokio::time::timeout;

#[tokio::test]
async fn stream_eof_ends_session_and_disconnects() {
    let master = FakeMaster::spawn().await.unwrap();
    let sched = Scheduler::build(config_for(&master), Arc::new(MemoryKv::new())).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = sched.manager.clone();
    let run = tokio::spawn(async move { manager.run_session(shutdown_rx).await });

    let session = master.next_session().await;
    session.send(subscribed_event("fw-1"));
    master.next_call(CallType::Reconcile).await;
    assert_eq!(sched.ctx.connection_state(), ConnectionState::Subscribed);
    assert_eq!(
        sched.ctx.identity().await.stream_id.as_deref(),
        Some(session.stream_id.as_str())
    );

    session.close();
    let end = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(end, SessionEnd::StreamClosed);
    assert_eq!(sched.ctx.connection_state(), ConnectionState::Disconnected);
    assert!(sched.ctx.identity().await.stream_id.is_none());
    assert!(!sched.ctx.outbox().is_attached().await);
}

#[tokio::test]
async fn error_event_ends_session() {
    let master = FakeMaster::spawn().await.unwrap();
    let sched = Scheduler::build(config_for(&master), Arc::new(MemoryKv::new())).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = sched.manager.clone();
    let run = tokio::spawn(async move { manager.run_session(shutdown_rx).await });

    let session = master.next_session().await;
    session.send(subscribed_event("fw-1"));
    session.send(serde_json::json!({
        "type": "ERROR",
        "error": {"message": "framework has been removed"}
    }));

    let end = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(
        end,
        SessionEnd::MasterError("framework has been removed".to_string())
    );
}

#[tokio::test]
async fn first_event_must_be_subscribed() {
    let master = FakeMaster::spawn().await.unwrap();
    let sched = Scheduler::build(config_for(&master), Arc::new(MemoryKv::new())).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = sched.manager.clone();
    let run = tokio::spawn(async move { manager.run_session(shutdown_rx).await });

    let session = master.next_session().await;
    session.send(serde_json::json!({"type": "HEARTBEAT"}));

    let result = timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.is_err());
    assert!(sched.ctx.framework_id().await.is_none());
}

#[tokio::test]
async fn garbage_and_unknown_updates_do_not_end_the_stream() {
    let master = FakeMaster::spawn().await.unwrap();
    let sched = Scheduler::build(config_for(&master), Arc::new(MemoryKv::new())).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = sched.manager.clone();
    let _run = tokio::spawn(async move { manager.run_session(shutdown_rx).await });

    let session = master.next_session().await;
    session.send(subscribed_event("fw-1"));
    session.send_raw("this is not json\n");
    session.send(update_event(
        "task_01HV4Z2WQXKJNM8GPQY6VBKC3D",
        "agent-x",
        "TASK_RUNNING",
        "uuid-unknown",
    ));

    let ack = master.next_call(CallType::Acknowledge).await;
    assert_eq!(ack.call.acknowledge.unwrap().uuid, "uuid-unknown");
    assert_eq!(sched.ctx.connection_state(), ConnectionState::Subscribed);
    assert_eq!(sched.ctx.store().all_tasks().await.unwrap(), Vec::new());
}

#[tokio::test]
async fn resubscription_reuses_persisted_identity() {
    let master = FakeMaster::spawn().await.unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let sched = Scheduler::build(config_for(&master), kv.clone()).await;

    let supervisor = Supervisor::new(sched.manager.clone(), Duration::from_millis(50));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    let first = master.next_session().await;
    assert!(first.subscribe.framework_id.is_none());
    first.send(subscribed_event("fw-42"));
    let heartbeat = master.next_call(CallType::Reconcile).await;
    assert_eq!(heartbeat.stream_id.as_deref(), Some(first.stream_id.as_str()));
    let first_id = first.stream_id.clone();
    first.close();

    let second = master.next_session().await;
    let expected = Some(FrameworkId::new("fw-42"));
    assert_eq!(second.subscribe.framework_id, expected);
    assert_eq!(
        second.subscribe.subscribe.as_ref().unwrap().framework_info.id,
        expected
    );

    // Calls on the new session carry the new stream id.
    second.send(subscribed_event("fw-42"));
    let heartbeat = master.next_call(CallType::Reconcile).await;
    assert_eq!(heartbeat.stream_id.as_deref(), Some(second.stream_id.as_str()));
    assert_ne!(second.stream_id, first_id);

    shutdown_tx.send(true).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap();

    // A restarted process resumes the same identity.
    let restarted = SchedulerContext::restore(config_for(&master), kv).await.unwrap();
    assert_eq!(restarted.framework_id().await, expected);
    assert!(restarted.identity().await.stream_id.is_none());
}

#[tokio::test]
async fn shutdown_during_handshake_returns_promptly() {
    let master = FakeMaster::spawn().await.unwrap();
    let sched = Scheduler::build(config_for(&master), Arc::new(MemoryKv::new())).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = sched.manager.clone();
    let run = tokio::spawn(async move { manager.run_session(shutdown_rx).await });

    let _session = master.next_session().await;
    shutdown_tx.send(true).unwrap();

    let end = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(end, SessionEnd::Shutdown);
    assert_eq!(sched.ctx.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn invalid_utf8_line_is_skipped() {
    let master = FakeMaster::spawn().await.unwrap();
    let sched = Scheduler::build(config_for(&master), Arc::new(MemoryKv::new())).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = sched.manager.clone();
    let run = tokio::spawn(async move { manager.run_session(shutdown_rx).await });

    let session = master.next_session().await;
    session.send(subscribed_event("fw-1"));
    master.next_call(CallType::Reconcile).await;

    session.send_raw(b"{\"type\":\"MESSAGE\",\"x\":\"\xff\xfe\"}\n");
    session.send(update_event(
        "task_01HV4Z2WQXKJNM8GPQY6VBKC3D",
        "agent-x",
        "TASK_RUNNING",
        "uuid-after-bad-line",
    ));

    let ack = master.next_call(CallType::Acknowledge).await;
    assert_eq!(ack.call.acknowledge.unwrap().uuid, "uuid-after-bad-line");
    assert_eq!(sched.ctx.connection_state(), ConnectionState::Subscribed);
    assert!(!run.is_finished());
}

#[tokio::test]
async fn silent_stream_times_out_and_disconnects() {
    let master = FakeMaster::spawn().await.unwrap();
    let mut config = config_for(&master);
    config.read_timeout = Duration::from_millis(300);
    let sched = Scheduler::build(config, Arc::new(MemoryKv::new())).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = sched.manager.clone();
    let run = tokio::spawn(async move { manager.run_session(shutdown_rx).await });

    // The connection stays open but nothing more is written to it.
    let session = master.next_session().await;
    session.send(bare_subscribed_event("fw-1"));
    master.next_call(CallType::Reconcile).await;

    let end = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(end, SessionEnd::ReadTimeout);
    assert_eq!(sched.ctx.connection_state(), ConnectionState::Disconnected);
    assert!(sched.ctx.identity().await.stream_id.is_none());
    assert!(!sched.ctx.outbox().is_attached().await);
    drop(session);
}

#[tokio::test]
async fn silent_stream_is_resubscribed() {
    let master = FakeMaster::spawn().await.unwrap();
    let mut config = config_for(&master);
    config.read_timeout = Duration::from_millis(300);
    let sched = Scheduler::build(config, Arc::new(MemoryKv::new())).await;

    let supervisor = Supervisor::new(sched.manager.clone(), Duration::from_millis(50));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    let first = master.next_session().await;
    first.send(bare_subscribed_event("fw-7"));
    master.next_call(CallType::Reconcile).await;

    let second = master.next_session().await;
    assert_eq!(second.subscribe.framework_id, Some(FrameworkId::new("fw-7")));
    assert_ne!(second.stream_id, first.stream_id);

    shutdown_tx.send(true).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap();
    drop(first);
}

#[tokio::test]
async fn failing_heartbeats_end_session() {
    let master = FakeMaster::spawn().await.unwrap();
    master.fail_calls(CallType::Reconcile, u32::MAX);
    let mut config = config_for(&master);
    config.heartbeat_interval = Duration::from_millis(50);
    config.heartbeat_max_failures = 2;
    let sched = Scheduler::build(config, Arc::new(MemoryKv::new())).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = sched.manager.clone();
    let run = tokio::spawn(async move { manager.run_session(shutdown_rx).await });

    // The stream itself stays healthy; only the keep-alives fail.
    let session = master.next_session().await;
    session.send(subscribed_event("fw-1"));
    assert!(master.next_call(CallType::Reconcile).await.rejected);
    assert!(master.next_call(CallType::Reconcile).await.rejected);

    let end = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(end, SessionEnd::HeartbeatFailed);
    assert_eq!(sched.ctx.connection_state(), ConnectionState::Disconnected);
    assert!(!sched.ctx.outbox().is_attached().await);
    drop(session);
}

#[tokio::test]
async fn failing_heartbeats_lead_to_resubscription() {
    let master = FakeMaster::spawn().await.unwrap();
    master.fail_calls(CallType::Reconcile, 2);
    let mut config = config_for(&master);
    config.heartbeat_interval = Duration::from_millis(50);
    config.heartbeat_max_failures = 2;
    let sched = Scheduler::build(config, Arc::new(MemoryKv::new())).await;

    let supervisor = Supervisor::new(sched.manager.clone(), Duration::from_millis(50));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    let first = master.next_session().await;
    first.send(subscribed_event("fw-3"));
    assert!(master.next_call(CallType::Reconcile).await.rejected);
    assert!(master.next_call(CallType::Reconcile).await.rejected);

    let second = master.next_session().await;
    assert_eq!(second.subscribe.framework_id, Some(FrameworkId::new("fw-3")));
    second.send(subscribed_event("fw-3"));
    let heartbeat = master.next_call(CallType::Reconcile).await;
    assert!(!heartbeat.rejected);
    assert_eq!(heartbeat.stream_id.as_deref(), Some(second.stream_id.as_str()));
    assert_eq!(sched.ctx.connection_state(), ConnectionState::Subscribed);

    shutdown_tx.send(true).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap();
    drop(first);
}
