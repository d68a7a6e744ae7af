//! Subscription to the resource manager.
//!
//! A session is one SUBSCRIBE request whose response body is the event
//! stream. While it lives, a heartbeat task keeps the subscription alive
//! and an outbound worker drains the call queue. The session ends on EOF,
//! read error, read timeout, heartbeat failure, an ERROR event or
//! shutdown; the supervisor then opens a new one.

mod client;
mod heartbeat;
mod lines;
mod manager;
mod outbox;

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::state::StoreError;

pub use client::{MasterClient, Subscription};
pub use heartbeat::run_heartbeat_loop;
pub use lines::LineReader;
pub use manager::{ConnectionManager, SessionEnd};
pub use outbox::{run_outbound_worker, Outbox, OutboxError};

/// Subscription state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Subscribing,
    Subscribed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Subscribed => "subscribed",
        })
    }
}

/// Errors that end or prevent a session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("resource manager returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("subscribe response carried no {} header", halyard_proto::STREAM_ID_HEADER)]
    MissingStreamId,

    #[error("subscription handshake failed: {0}")]
    Handshake(String),

    #[error("event stream read failed: {0}")]
    Read(String),

    #[error("event line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("a session is already active")]
    SessionActive,

    #[error(transparent)]
    Store(#[from] StoreError),
}
