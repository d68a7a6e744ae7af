//! One subscription session at a time.

use std::time::Duration;

use halyard_id::SessionId;
use halyard_proto::Event;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{
    run_heartbeat_loop, run_outbound_worker, ConnectionError, ConnectionState, MasterClient,
};
use crate::context::SchedulerContext;
use crate::dispatch::{EventDispatcher, Flow};

/// Why a session that did subscribe came to an end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The resource manager closed the event stream.
    StreamClosed,
    /// Nothing arrived within the liveness window.
    ReadTimeout,
    /// Keep-alives kept failing.
    HeartbeatFailed,
    /// An ERROR event rejected the framework.
    MasterError(String),
    Shutdown,
}

/// Background tasks of a live session, aborted when it ends.
#[derive(Default)]
struct SessionTasks {
    outbound: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<u32>>,
}

impl Drop for SessionTasks {
    fn drop(&mut self) {
        if let Some(handle) = self.outbound.take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

/// Opens subscriptions and feeds their events to the dispatcher.
pub struct ConnectionManager {
    ctx: SchedulerContext,
    client: MasterClient,
    dispatcher: EventDispatcher,
}

impl ConnectionManager {
    pub fn new(ctx: SchedulerContext, client: MasterClient, dispatcher: EventDispatcher) -> Self {
        Self {
            ctx,
            client,
            dispatcher,
        }
    }

    /// Run one session to completion.
    ///
    /// `Err` means the session never got going (or its identity could not
    /// be persisted); `Ok` carries the reason an established session ended.
    /// Either way the state is back to `Disconnected` on return and the
    /// session's queue is detached.
    #[instrument(skip_all, fields(session = %SessionId::new()))]
    pub async fn run_session(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SessionEnd, ConnectionError> {
        let _slot = self
            .ctx
            .try_begin_session()
            .ok_or(ConnectionError::SessionActive)?;

        let mut tasks = SessionTasks::default();
        let result = self.session(shutdown, &mut tasks).await;

        drop(tasks);
        self.ctx.outbox().detach().await;
        self.ctx.clear_stream().await;
        self.ctx.set_connection_state(ConnectionState::Disconnected);

        match &result {
            Ok(end) => info!(reason = ?end, "Session ended"),
            Err(e) => warn!(error = %e, "Session failed"),
        }
        result
    }

    async fn session(
        &self,
        mut shutdown: watch::Receiver<bool>,
        tasks: &mut SessionTasks,
    ) -> Result<SessionEnd, ConnectionError> {
        let config = self.ctx.config();
        self.ctx.set_connection_state(ConnectionState::Subscribing);

        let mut subscription = self.client.subscribe(self.ctx.framework_info().await).await?;
        let stream_id = subscription.stream_id.clone();

        // The first event must be SUBSCRIBED.
        let first = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                read = tokio::time::timeout(config.read_timeout, subscription.lines.next_line()) => break read,
            }
        };
        let first = first
            .map_err(|_| ConnectionError::Timeout {
                operation: "awaiting SUBSCRIBED",
                after: config.read_timeout,
            })??
            .ok_or_else(|| ConnectionError::Handshake("stream closed before SUBSCRIBED".into()))?;
        let subscribed = match Event::decode_bytes(&first) {
            Ok(Event::Subscribed(subscribed)) => subscribed,
            Ok(other) => {
                return Err(ConnectionError::Handshake(format!(
                    "expected SUBSCRIBED, got {}",
                    other.kind()
                )))
            }
            Err(e) => return Err(ConnectionError::Handshake(e.to_string())),
        };

        let read_timeout = liveness_window(config.read_timeout, subscribed.heartbeat_interval_seconds);

        let calls = self.ctx.outbox().attach(config.outbox_capacity).await;
        tasks.outbound = Some(tokio::spawn(run_outbound_worker(
            self.client.clone(),
            stream_id.clone(),
            calls,
        )));

        self.dispatcher
            .dispatch(Event::Subscribed(subscribed), &stream_id)
            .await?;
        self.ctx.set_connection_state(ConnectionState::Subscribed);

        tasks.heartbeat = Some(tokio::spawn(run_heartbeat_loop(
            self.ctx.clone(),
            self.client.clone(),
            stream_id.clone(),
            config.heartbeat_interval,
            config.heartbeat_max_failures,
        )));

        let end = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break SessionEnd::Shutdown;
                    }
                }
                _ = heartbeat_exit(&mut tasks.heartbeat) => break SessionEnd::HeartbeatFailed,
                read = tokio::time::timeout(read_timeout, subscription.lines.next_line()) => {
                    let line = match read {
                        Err(_) => break SessionEnd::ReadTimeout,
                        Ok(Err(e)) => return Err(e),
                        Ok(Ok(None)) => break SessionEnd::StreamClosed,
                        Ok(Ok(Some(line))) => line,
                    };
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let event = match Event::decode_bytes(&line) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(error = %e, "Skipping undecodable event");
                            continue;
                        }
                    };
                    debug!(event = event.kind(), "Event received");
                    if let Flow::EndSession(message) = self.dispatcher.dispatch(event, &stream_id).await? {
                        break SessionEnd::MasterError(message);
                    }
                }
            }
        };

        Ok(end)
    }
}

/// Resolves when the heartbeat loop gives up.
async fn heartbeat_exit(handle: &mut Option<JoinHandle<u32>>) {
    match handle {
        Some(handle) => {
            let _ = handle.await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Silence tolerated on the stream: the configured read timeout, or five
/// of the resource manager's heartbeat intervals if that is longer.
fn liveness_window(configured: Duration, master_heartbeat_secs: Option<f64>) -> Duration {
    let from_master = master_heartbeat_secs
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(|secs| Duration::from_secs_f64(secs * 5.0))
        .unwrap_or_default();
    configured.max(from_master)
}
