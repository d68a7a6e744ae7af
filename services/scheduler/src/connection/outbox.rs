//! Bounded queue between deciding to send a call and sending it.

use halyard_proto::Call;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use super::MasterClient;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboxError {
    #[error("not subscribed; call dropped")]
    NotConnected,

    #[error("outbound queue is full; call dropped")]
    Full,
}

/// Session-scoped sender for outbound calls.
///
/// Attached when a session subscribes, detached when it ends. Calls queued
/// while detached are rejected rather than held for a later session.
#[derive(Debug, Default)]
pub struct Outbox {
    sender: RwLock<Option<mpsc::Sender<Call>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh queue, replacing any previous one.
    pub async fn attach(&self, capacity: usize) -> mpsc::Receiver<Call> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.sender.write().await = Some(tx);
        rx
    }

    /// Drop the sender so the session's worker drains and stops.
    pub async fn detach(&self) {
        self.sender.write().await.take();
    }

    pub async fn is_attached(&self) -> bool {
        self.sender.read().await.is_some()
    }

    /// Queue a call without waiting for space.
    pub async fn send(&self, call: Call) -> Result<(), OutboxError> {
        let guard = self.sender.read().await;
        let sender = guard.as_ref().ok_or(OutboxError::NotConnected)?;
        sender.try_send(call).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OutboxError::Full,
            mpsc::error::TrySendError::Closed(_) => OutboxError::NotConnected,
        })
    }
}

/// Drain `calls`, posting each on the session's stream.
///
/// Failures are logged; the heartbeat decides whether the session is dead.
pub async fn run_outbound_worker(
    client: MasterClient,
    stream_id: String,
    mut calls: mpsc::Receiver<Call>,
) {
    while let Some(call) = calls.recv().await {
        let kind = call.kind;
        match client.call(&call, &stream_id).await {
            Ok(()) => debug!(call = ?kind, "Outbound call sent"),
            Err(e) => warn!(call = ?kind, error = %e, "Outbound call failed"),
        }
    }
    debug!("Outbound worker stopped");
}
