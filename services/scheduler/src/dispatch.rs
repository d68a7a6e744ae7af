//! Routes decoded stream events to their handlers.

use halyard_id::TaskId;
use halyard_proto::{Call, Event, Subscribed, TaskStatus};
use tracing::{debug, error, info, warn};

use crate::context::SchedulerContext;
use crate::offers::OfferEvaluator;
use crate::scale::ScaleController;
use crate::state::StoreError;
use crate::task::Transition;

/// What the read loop should do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The resource manager rejected the framework.
    EndSession(String),
}

/// Event handlers for one scheduler.
#[derive(Clone)]
pub struct EventDispatcher {
    ctx: SchedulerContext,
    offers: OfferEvaluator,
    scale: ScaleController,
}

impl EventDispatcher {
    pub fn new(ctx: SchedulerContext, offers: OfferEvaluator, scale: ScaleController) -> Self {
        Self { ctx, offers, scale }
    }

    /// Handle one event of the session identified by `stream_id`.
    ///
    /// Only a failure to persist a newly granted identity is returned as an
    /// error; everything else is logged and the stream continues.
    pub async fn dispatch(&self, event: Event, stream_id: &str) -> Result<Flow, StoreError> {
        match event {
            Event::Subscribed(subscribed) => {
                self.on_subscribed(subscribed, stream_id).await?;
            }
            Event::Update(update) => self.on_update(update.status).await,
            Event::Offers(batch) => match self.offers.evaluate(batch.offers).await {
                Ok(summary) if !summary.launched.is_empty() => {
                    info!(launched = ?summary.launched, "Offers accepted");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Offer batch dropped"),
            },
            Event::Rescind(rescind) => {
                debug!(offer_id = %rescind.offer_id, "Offer rescinded");
            }
            Event::Message(message) => {
                debug!(
                    agent_id = %message.agent_id,
                    executor_id = %message.executor_id,
                    bytes = message.data.len(),
                    "Executor message"
                );
            }
            Event::Failure(failure) => {
                warn!(
                    agent_id = ?failure.agent_id.as_ref().map(|a| a.as_str()),
                    executor_id = ?failure.executor_id.as_ref().map(|e| e.as_str()),
                    status = ?failure.status,
                    "Agent or executor failure"
                );
            }
            Event::Error(err) => {
                error!(message = %err.message, "Resource manager reported an error");
                return Ok(Flow::EndSession(err.message));
            }
            Event::Heartbeat => debug!("Heartbeat"),
            Event::Unknown(kind) => debug!(kind = %kind, "Ignoring unknown event"),
        }
        Ok(Flow::Continue)
    }

    async fn on_subscribed(&self, subscribed: Subscribed, stream_id: &str) -> Result<(), StoreError> {
        self.ctx
            .adopt_identity(subscribed.framework_id.clone(), stream_id.to_string())
            .await?;
        self.ctx.persist_snapshot().await?;

        info!(
            framework_id = %subscribed.framework_id,
            heartbeat_interval_secs = ?subscribed.heartbeat_interval_seconds,
            "Subscribed"
        );

        match self.scale.resend_pending_kills().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Re-issued pending kills"),
            Err(e) => warn!(error = %e, "Could not re-issue pending kills"),
        }
        Ok(())
    }

    async fn on_update(&self, status: TaskStatus) {
        let persisted = match TaskId::parse(&status.task_id.value) {
            Ok(id) => self.apply_update(&id, &status).await,
            Err(_) => {
                info!(task_id = %status.task_id, state = ?status.state, "Update for untracked task");
                Ok(false)
            }
        };

        let acknowledge = match persisted {
            Ok(true) => {
                if let Err(e) = self.ctx.persist_snapshot().await {
                    warn!(error = %e, "Failed to persist configuration snapshot");
                }
                true
            }
            Ok(false) => true,
            // Leave it unacknowledged so the update is redelivered.
            Err(e) => {
                error!(task_id = %status.task_id, error = %e, "Failed to persist task update");
                false
            }
        };

        if acknowledge {
            self.acknowledge(&status).await;
        }
    }

    /// Returns whether a tracked task was touched.
    async fn apply_update(&self, id: &TaskId, status: &TaskStatus) -> Result<bool, StoreError> {
        let guard = self.ctx.lock_reconcile().await;

        let Some(mut task) = self.ctx.store().find_task(id).await? else {
            info!(task_id = %id, state = ?status.state, "Update for untracked task");
            return Ok(false);
        };

        match task.apply_status(status) {
            Transition::Advanced { from, to } => {
                self.ctx.store().put_task(&task).await?;
                info!(
                    task_id = %id,
                    role = %task.role,
                    from = %from,
                    to = %to,
                    message = ?status.message,
                    "Task state changed"
                );
                if to.is_terminal() {
                    self.scale.reconcile_terminal(&guard, task.role).await?;
                }
            }
            Transition::Unchanged => {
                self.ctx.store().put_task(&task).await?;
            }
            Transition::Ignored => {
                debug!(task_id = %id, state = ?status.state, current = %task.state, "Stale update ignored");
            }
        }

        // A kill that was lost on the way shows up as a live task that
        // still reports in; ask again.
        if task.kill_requested && !task.is_terminal() {
            debug!(task_id = %id, state = %task.state, "Re-issuing kill");
            self.scale.send_kill(self.ctx.framework_id().await, &task).await;
        }
        Ok(true)
    }

    async fn acknowledge(&self, status: &TaskStatus) {
        let (Some(uuid), Some(agent_id)) = (&status.uuid, &status.agent_id) else {
            return;
        };
        let Some(framework_id) = self.ctx.framework_id().await else {
            return;
        };
        let call = Call::acknowledge(
            framework_id,
            agent_id.clone(),
            status.task_id.clone(),
            uuid.clone(),
        );
        if let Err(e) = self.ctx.outbox().send(call).await {
            warn!(task_id = %status.task_id, error = %e, "Acknowledgement not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;
    use crate::state::KvStore;
    use crate::task::{Role, Task, TaskState};
    use halyard_proto::{
        AgentId, CallType, ErrorEvent, FrameworkId, TaskIdValue, TaskInfo, TaskState as Wire,
        Update,
    };
    use tokio::sync::mpsc;

    fn dispatcher(ctx: &SchedulerContext) -> EventDispatcher {
        EventDispatcher::new(
            ctx.clone(),
            OfferEvaluator::new(ctx.clone()),
            ScaleController::new(ctx.clone()),
        )
    }

    async fn subscribed() -> (SchedulerContext, mpsc::Receiver<Call>) {
        let ctx = testing::context().await;
        ctx.adopt_identity(FrameworkId::new("fw"), "s".to_string())
            .await
            .unwrap();
        let rx = ctx.outbox().attach(64).await;
        (ctx, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Call>) -> Vec<Call> {
        let mut calls = Vec::new();
        while let Ok(call) = rx.try_recv() {
            calls.push(call);
        }
        calls
    }

    fn update(task_id: &str, state: Wire, uuid: Option<&str>) -> Event {
        Event::Update(Update {
            status: TaskStatus {
                task_id: TaskIdValue::new(task_id),
                state,
                agent_id: Some(AgentId::new("agent-1")),
                message: None,
                reason: None,
                source: None,
                uuid: uuid.map(str::to_string),
                timestamp: None,
            },
        })
    }

    async fn stored_task(ctx: &SchedulerContext, role: Role) -> Task {
        let id = TaskId::new();
        let info = TaskInfo {
            name: role.to_string(),
            task_id: TaskIdValue::new(id.to_string()),
            agent_id: AgentId::new("agent-1"),
            resources: Vec::new(),
            command: None,
            container: None,
            discovery: None,
        };
        let task = Task::staging(id, role, "node-1", info);
        ctx.store().put_task(&task).await.unwrap();
        task
    }

    async fn dump(ctx: &SchedulerContext, kv: &dyn KvStore) -> Vec<(String, String)> {
        kv.scan_prefix(&format!("{}:", ctx.config().framework_name))
            .await
            .unwrap()
            .collect()
    }

    #[tokio::test]
    async fn test_update_advances_and_acknowledges() {
        let (ctx, mut rx) = subscribed().await;
        let task = stored_task(&ctx, Role::Agent).await;
        let revision = ctx.snapshot().await.revision;

        let flow = dispatcher(&ctx)
            .dispatch(update(&task.id.to_string(), Wire::TaskRunning, Some("u-1")), "s")
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);

        let stored = ctx.store().get_task(Role::Agent, &task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Running);
        assert!(ctx.snapshot().await.revision > revision);

        let calls = drain(&mut rx);
        assert_eq!(calls.len(), 1);
        let ack = calls[0].acknowledge.as_ref().unwrap();
        assert_eq!(ack.uuid, "u-1");
        assert_eq!(ack.task_id.value, task.id.to_string());
    }

    #[tokio::test]
    async fn test_update_for_unknown_task_leaves_store_unchanged() {
        let kv = std::sync::Arc::new(crate::state::MemoryKv::new());
        let ctx = SchedulerContext::restore(crate::config::Config::default(), kv.clone())
            .await
            .unwrap();
        ctx.adopt_identity(FrameworkId::new("fw"), "s".to_string())
            .await
            .unwrap();
        let mut rx = ctx.outbox().attach(8).await;
        stored_task(&ctx, Role::Server).await;
        let before = dump(&ctx, kv.as_ref()).await;

        let d = dispatcher(&ctx);
        let unknown_ulid = TaskId::new().to_string();
        for id in [unknown_ulid.as_str(), "not-one-of-ours"] {
            let flow = d.dispatch(update(id, Wire::TaskFailed, Some("u")), "s").await.unwrap();
            assert_eq!(flow, Flow::Continue);
        }

        assert_eq!(dump(&ctx, kv.as_ref()).await, before);
        // Still acknowledged so the resource manager stops resending.
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_update_keeps_record_for_relaunch() {
        let (ctx, _rx) = subscribed().await;
        let task = stored_task(&ctx, Role::Server).await;

        dispatcher(&ctx)
            .dispatch(update(&task.id.to_string(), Wire::TaskFailed, None), "s")
            .await
            .unwrap();

        let stored = ctx.store().get_task(Role::Server, &task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_killed_task_is_removed_on_terminal_update() {
        let (ctx, _rx) = subscribed().await;
        let mut task = stored_task(&ctx, Role::Agent).await;
        task.kill_requested = true;
        ctx.store().put_task(&task).await.unwrap();

        dispatcher(&ctx)
            .dispatch(update(&task.id.to_string(), Wire::TaskKilled, None), "s")
            .await
            .unwrap();

        assert!(ctx.store().get_task(Role::Agent, &task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_update_for_kill_requested_task_reissues_kill() {
        let (ctx, mut rx) = subscribed().await;
        let mut task = stored_task(&ctx, Role::Server).await;
        task.kill_requested = true;
        ctx.store().put_task(&task).await.unwrap();

        let d = dispatcher(&ctx);
        d.dispatch(update(&task.id.to_string(), Wire::TaskRunning, Some("u-1")), "s")
            .await
            .unwrap();
        let calls = drain(&mut rx);
        let kinds: Vec<CallType> = calls.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallType::Kill, CallType::Acknowledge]);
        let kill = calls[0].kill.as_ref().unwrap();
        assert_eq!(kill.task_id.value, task.id.to_string());

        // Once it is gone there is nothing left to kill.
        d.dispatch(update(&task.id.to_string(), Wire::TaskKilled, None), "s")
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_unrecognised_state_is_acknowledged_without_change() {
        let (ctx, mut rx) = subscribed().await;
        let task = stored_task(&ctx, Role::Agent).await;

        dispatcher(&ctx)
            .dispatch(update(&task.id.to_string(), Wire::TaskUnknown, Some("u-9")), "s")
            .await
            .unwrap();

        let stored = ctx.store().get_task(Role::Agent, &task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Staging);
        let calls = drain(&mut rx);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].acknowledge.as_ref().unwrap().uuid, "u-9");
    }

    #[tokio::test]
    async fn test_subscribed_persists_identity_and_resends_kills() {
        let ctx = testing::context().await;
        let mut task = stored_task(&ctx, Role::Agent).await;
        task.kill_requested = true;
        ctx.store().put_task(&task).await.unwrap();
        let mut rx = ctx.outbox().attach(8).await;

        let event = Event::Subscribed(Subscribed {
            framework_id: FrameworkId::new("fw-new"),
            heartbeat_interval_seconds: Some(15.0),
        });
        dispatcher(&ctx).dispatch(event, "stream-2").await.unwrap();

        let identity = ctx.store().load_identity().await.unwrap().unwrap();
        assert_eq!(identity.framework_id, Some(FrameworkId::new("fw-new")));
        assert_eq!(identity.stream_id.as_deref(), Some("stream-2"));

        let kinds: Vec<CallType> = drain(&mut rx).into_iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallType::Kill]);
    }

    #[tokio::test]
    async fn test_error_event_ends_session() {
        let (ctx, _rx) = subscribed().await;
        let flow = dispatcher(&ctx)
            .dispatch(
                Event::Error(ErrorEvent {
                    message: "framework removed".to_string(),
                }),
                "s",
            )
            .await
            .unwrap();
        assert_eq!(flow, Flow::EndSession("framework removed".to_string()));
    }

    #[tokio::test]
    async fn test_offers_without_identity_are_not_fatal() {
        let ctx = testing::context().await;
        let flow = dispatcher(&ctx)
            .dispatch(
                Event::Offers(halyard_proto::Offers { offers: Vec::new() }),
                "s",
            )
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
    }
}
