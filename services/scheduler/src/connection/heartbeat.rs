//! Keep-alive loop for an open subscription.
//!
//! Every interval a RECONCILE call listing the tracked non-terminal tasks is
//! posted straight to the resource manager, bypassing the outbound queue so
//! a backed-up queue or a slow event handler cannot starve it. The answers
//! arrive as ordinary UPDATE events.

use std::time::Duration;

use halyard_proto::{Call, ReconcileTask, TaskIdValue};
use tracing::{debug, error, info, warn};

use super::MasterClient;
use crate::context::SchedulerContext;

/// Run until `max_failures` consecutive keep-alives fail. Returns the
/// failure count.
pub async fn run_heartbeat_loop(
    ctx: SchedulerContext,
    client: MasterClient,
    stream_id: String,
    interval: Duration,
    max_failures: u32,
) -> u32 {
    info!(interval_secs = interval.as_secs(), "Starting heartbeat loop");

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);
    interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval_timer.tick().await;

        let Some(call) = keepalive_call(&ctx).await else {
            debug!("No framework id yet; skipping heartbeat");
            continue;
        };

        match client.call(&call, &stream_id).await {
            Ok(()) => {
                consecutive_failures = 0;
                debug!("Heartbeat acknowledged");
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures < max_failures {
                    warn!(error = %e, consecutive_failures, "Heartbeat failed");
                } else {
                    error!(
                        error = %e,
                        consecutive_failures,
                        "Heartbeat failed repeatedly; ending session"
                    );
                    return consecutive_failures;
                }
            }
        }
    }
}

/// RECONCILE naming every non-terminal task. Falls back to an implicit
/// reconcile (empty list) when the store cannot be read.
async fn keepalive_call(ctx: &SchedulerContext) -> Option<Call> {
    let framework_id = ctx.framework_id().await?;

    let tasks = match ctx.store().all_tasks().await {
        Ok(tasks) => tasks
            .into_iter()
            .filter(|t| !t.is_terminal())
            .map(|t| ReconcileTask {
                task_id: TaskIdValue::new(t.id.to_string()),
                agent_id: Some(t.agent_id),
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "Could not list tasks for heartbeat");
            Vec::new()
        }
    };

    Some(Call::reconcile(framework_id, tasks))
}
