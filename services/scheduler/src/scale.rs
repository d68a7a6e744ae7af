//! Desired versus observed task counts.
//!
//! The desired count is the persisted [`ScaleTarget`]; the observed count is
//! always derived from the task records of a role. Scaling down picks
//! the oldest active tasks (creation time, then task id) and kills exactly
//! as many as needed. Killed tasks leave the store only once their terminal
//! status has been observed.

use halyard_id::TaskId;
use halyard_proto::{Call, FrameworkId, TaskIdValue};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::context::{ReconcileGuard, SchedulerContext};
use crate::state::StoreError;
use crate::task::{Role, ScaleTarget, Task};

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("{role} count {requested} exceeds the configured maximum of {max}")]
    ExceedsMax { role: Role, requested: u32, max: u32 },

    #[error("failed to persist scale change: {0}")]
    Persistence(#[from] StoreError),
}

/// Desired and observed counts for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScaleCounts {
    pub scale: u32,
    pub running: usize,
}

/// Result of a scale request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleChange {
    pub previous: u32,
    pub desired: u32,
    /// Tasks picked for termination by this request.
    pub killed: Vec<TaskId>,
}

impl ScaleChange {
    /// `desired - previous`.
    pub fn delta(&self) -> i64 {
        i64::from(self.desired) - i64::from(self.previous)
    }
}

pub(crate) fn kill_call(framework_id: FrameworkId, task: &Task) -> Call {
    Call::kill(
        framework_id,
        TaskIdValue::new(task.id.to_string()),
        Some(task.agent_id.clone()),
    )
}

/// Reconciles the task set against the scale target.
#[derive(Clone)]
pub struct ScaleController {
    ctx: SchedulerContext,
}

impl ScaleController {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, role: Role) -> Result<ScaleCounts, StoreError> {
        let scale = self.ctx.scale().await.desired(role);
        let running = self.ctx.store().count_running(role).await?;
        Ok(ScaleCounts { scale, running })
    }

    /// Persist a new desired count for `role` and kill any excess.
    ///
    /// The target is written before any kill is attempted, so it stands even
    /// if convergence stalls.
    #[instrument(skip(self))]
    pub async fn set_desired(&self, role: Role, desired: u32) -> Result<ScaleChange, ScaleError> {
        let current = self.ctx.scale().await;
        if let Some(max) = current.max(role) {
            if desired > max {
                return Err(ScaleError::ExceedsMax {
                    role,
                    requested: desired,
                    max,
                });
            }
        }

        let _guard = self.ctx.lock_reconcile().await;

        let mut target: ScaleTarget = self.ctx.scale().await;
        let previous = target.desired(role);
        target.set_desired(role, desired);
        self.ctx.update_scale(target).await?;

        info!(previous, desired, "Scale target updated");

        let tasks = self.ctx.store().list_tasks(role).await?;
        let active: Vec<Task> = tasks.into_iter().filter(Task::is_active).collect();
        let mut remaining = active.len().saturating_sub(desired as usize);
        let framework_id = self.ctx.framework_id().await;

        let mut killed = Vec::with_capacity(remaining);
        for mut task in active {
            if remaining == 0 {
                break;
            }
            task.kill_requested = true;
            self.ctx.store().put_task(&task).await?;
            remaining -= 1;

            self.send_kill(framework_id.clone(), &task).await;
            killed.push(task.id);
        }

        if desired > previous {
            if let Some(framework_id) = framework_id {
                if let Err(e) = self.ctx.outbox().send(Call::revive(framework_id)).await {
                    debug!(error = %e, "Revive not sent");
                }
            }
        }

        Ok(ScaleChange {
            previous,
            desired,
            killed,
        })
    }

    pub(crate) async fn send_kill(&self, framework_id: Option<FrameworkId>, task: &Task) {
        let Some(framework_id) = framework_id else {
            info!(task_id = %task.id, "Not subscribed; kill deferred to next subscription");
            return;
        };
        match self.ctx.outbox().send(kill_call(framework_id, task)).await {
            Ok(()) => info!(task_id = %task.id, agent_id = %task.agent_id, "Kill issued"),
            Err(e) => warn!(task_id = %task.id, error = %e, "Kill not sent; will retry on the next status update"),
        }
    }

    /// Re-issue kills for tasks picked earlier that are not terminal yet.
    pub async fn resend_pending_kills(&self) -> Result<usize, StoreError> {
        let Some(framework_id) = self.ctx.framework_id().await else {
            return Ok(0);
        };
        let _guard = self.ctx.lock_reconcile().await;

        let mut sent = 0;
        for task in self.ctx.store().all_tasks().await? {
            if task.kill_requested && !task.is_terminal() {
                self.send_kill(Some(framework_id.clone()), &task).await;
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Drop terminal records that will not run again.
    ///
    /// Killed-on-request tasks are removed. Other terminal tasks are kept
    /// only while the role is below target, oldest first, so the offer
    /// evaluator can relaunch them under their original id.
    pub async fn reconcile_terminal(
        &self,
        _guard: &ReconcileGuard<'_>,
        role: Role,
    ) -> Result<Vec<TaskId>, StoreError> {
        let tasks = self.ctx.store().list_tasks(role).await?;
        let desired = self.ctx.scale().await.desired(role) as usize;
        let active = tasks.iter().filter(|t| t.is_active()).count();
        let mut relaunch_slots = desired.saturating_sub(active);

        let mut removed = Vec::new();
        for task in tasks.iter().filter(|t| t.is_terminal()) {
            if !task.kill_requested && relaunch_slots > 0 {
                relaunch_slots -= 1;
                continue;
            }
            self.ctx.store().delete_task(role, &task.id).await?;
            removed.push(task.id);
        }

        if !removed.is_empty() {
            info!(role = %role, removed = removed.len(), "Removed reconciled terminal tasks");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;
    use crate::task::TaskState;
    use chrono::{Duration as ChronoDuration, Utc};
    use halyard_proto::{AgentId, CallType, TaskInfo};
    use tokio::sync::mpsc;

    fn task(role: Role, age_secs: i64) -> Task {
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
        let mut task = Task::staging(id, role, "node-1", info);
        task.state = TaskState::Running;
        task.created_at = Utc::now() - ChronoDuration::seconds(age_secs);
        task
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

    async fn seed_agents(ctx: &SchedulerContext, count: u32) -> Vec<Task> {
        let mut target = ctx.scale().await;
        target.agents = count;
        ctx.update_scale(target).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..count {
            let t = task(Role::Agent, 100 - i64::from(i));
            ctx.store().put_task(&t).await.unwrap();
            tasks.push(t);
        }
        tasks
    }

    #[tokio::test]
    async fn test_scale_down_kills_exact_excess_oldest_first() {
        let (ctx, mut rx) = subscribed().await;
        let tasks = seed_agents(&ctx, 5).await;
        let scale = ScaleController::new(ctx.clone());

        let change = scale.set_desired(Role::Agent, 2).await.unwrap();
        assert_eq!(change.delta(), -3);
        assert_eq!(change.killed, vec![tasks[0].id, tasks[1].id, tasks[2].id]);

        let kills: Vec<Call> = drain(&mut rx)
            .into_iter()
            .filter(|c| c.kind == CallType::Kill)
            .collect();
        assert_eq!(kills.len(), 3);

        // Records stay until the terminal update arrives.
        assert_eq!(ctx.store().list_tasks(Role::Agent).await.unwrap().len(), 5);
        assert_eq!(ctx.scale().await.agents, 2);
    }

    #[tokio::test]
    async fn test_reapplying_same_count_is_noop() {
        let (ctx, mut rx) = subscribed().await;
        seed_agents(&ctx, 3).await;
        let scale = ScaleController::new(ctx);

        let change = scale.set_desired(Role::Agent, 3).await.unwrap();
        assert_eq!(change.delta(), 0);
        assert!(change.killed.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_reapplying_lower_count_before_convergence_kills_nothing_more() {
        let (ctx, mut rx) = subscribed().await;
        seed_agents(&ctx, 4).await;
        let scale = ScaleController::new(ctx);

        assert_eq!(scale.set_desired(Role::Agent, 1).await.unwrap().killed.len(), 3);
        drain(&mut rx);

        let again = scale.set_desired(Role::Agent, 1).await.unwrap();
        assert!(again.killed.is_empty());
        assert_eq!(again.delta(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_scale_up_sends_revive() {
        let (ctx, mut rx) = subscribed().await;
        let scale = ScaleController::new(ctx);

        let change = scale.set_desired(Role::Agent, 3).await.unwrap();
        assert_eq!(change.delta(), 2);
        let kinds: Vec<CallType> = drain(&mut rx).into_iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallType::Revive]);
    }

    #[tokio::test]
    async fn test_exceeding_max_is_rejected_and_not_persisted() {
        let (ctx, _rx) = subscribed().await;
        let scale = ScaleController::new(ctx.clone());

        let err = scale.set_desired(Role::Agent, 11).await.unwrap_err();
        assert!(matches!(err, ScaleError::ExceedsMax { max: 10, .. }));
        assert_eq!(ctx.scale().await.agents, 1);
    }

    #[tokio::test]
    async fn test_scale_down_while_disconnected_persists_and_marks() {
        let ctx = testing::context().await;
        seed_agents(&ctx, 2).await;
        let scale = ScaleController::new(ctx.clone());

        let change = scale.set_desired(Role::Agent, 0).await.unwrap();
        assert_eq!(change.killed.len(), 2);
        assert!(ctx
            .store()
            .list_tasks(Role::Agent)
            .await
            .unwrap()
            .iter()
            .all(|t| t.kill_requested));

        ctx.adopt_identity(FrameworkId::new("fw"), "s".to_string())
            .await
            .unwrap();
        let mut rx = ctx.outbox().attach(8).await;
        assert_eq!(scale.resend_pending_kills().await.unwrap(), 2);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_get_reports_desired_and_running() {
        let (ctx, _rx) = subscribed().await;
        let tasks = seed_agents(&ctx, 2).await;
        let mut dead = tasks[0].clone();
        dead.state = TaskState::Failed;
        ctx.store().put_task(&dead).await.unwrap();

        let counts = ScaleController::new(ctx).get(Role::Agent).await.unwrap();
        assert_eq!(counts, ScaleCounts { scale: 2, running: 1 });
    }

    #[tokio::test]
    async fn test_reconcile_terminal_removes_killed_and_surplus() {
        let (ctx, _rx) = subscribed().await;
        let tasks = seed_agents(&ctx, 3).await;
        let scale = ScaleController::new(ctx.clone());
        scale.set_desired(Role::Agent, 2).await.unwrap();

        // Oldest was killed on request; another one failed on its own.
        let mut killed = ctx
            .store()
            .get_task(Role::Agent, &tasks[0].id)
            .await
            .unwrap()
            .unwrap();
        killed.state = TaskState::Killed;
        ctx.store().put_task(&killed).await.unwrap();
        let mut failed = tasks[1].clone();
        failed.state = TaskState::Failed;
        ctx.store().put_task(&failed).await.unwrap();

        let guard = ctx.lock_reconcile().await;
        let removed = scale.reconcile_terminal(&guard, Role::Agent).await.unwrap();
        drop(guard);

        // Failed task is kept for relaunch because the role is below target.
        assert_eq!(removed, vec![tasks[0].id]);
        assert!(ctx
            .store()
            .get_task(Role::Agent, &tasks[1].id)
            .await
            .unwrap()
            .is_some());

        // Once the target drops, the failed record is surplus.
        scale.set_desired(Role::Agent, 1).await.unwrap();
        let guard = ctx.lock_reconcile().await;
        let removed = scale.reconcile_terminal(&guard, Role::Agent).await.unwrap();
        assert_eq!(removed, vec![tasks[1].id]);
    }
}
