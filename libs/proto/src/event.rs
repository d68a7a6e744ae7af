//! Events streamed from the resource manager to the scheduler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{AgentId, ExecutorId, FrameworkId, Offer, OfferId};
use crate::task::TaskStatus;

/// Errors decoding one line of the event stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} event without its '{field}' payload")]
    MissingPayload {
        kind: &'static str,
        field: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribed {
    pub framework_id: FrameworkId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offers {
    #[serde(default)]
    pub offers: Vec<Offer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rescind {
    pub offer_id: OfferId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub agent_id: AgentId,
    pub executor_id: ExecutorId,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

/// A decoded stream event, one variant per protocol tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Subscribed(Subscribed),
    Offers(Offers),
    Rescind(Rescind),
    Update(Update),
    Message(Message),
    Failure(Failure),
    Error(ErrorEvent),
    Heartbeat,
    /// A tag this scheduler does not know about.
    Unknown(String),
}

impl Event {
    /// Protocol tag, for logging.
    pub fn kind(&self) -> &str {
        match self {
            Event::Subscribed(_) => "SUBSCRIBED",
            Event::Offers(_) => "OFFERS",
            Event::Rescind(_) => "RESCIND",
            Event::Update(_) => "UPDATE",
            Event::Message(_) => "MESSAGE",
            Event::Failure(_) => "FAILURE",
            Event::Error(_) => "ERROR",
            Event::Heartbeat => "HEARTBEAT",
            Event::Unknown(kind) => kind,
        }
    }

    /// Decode one line of the event stream.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        Self::decode_bytes(line.as_bytes())
    }

    /// Decode a raw line. Bytes that are not UTF-8 are a decode error like
    /// any other malformed JSON.
    pub fn decode_bytes(line: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawEvent = serde_json::from_slice(line)?;
        raw.into_event()
    }
}

/// Wire shape: a `type` tag plus one optional payload field per tag.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subscribed: Option<Subscribed>,
    #[serde(default)]
    offers: Option<Offers>,
    #[serde(default)]
    rescind: Option<Rescind>,
    #[serde(default)]
    update: Option<Update>,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    failure: Option<Failure>,
    #[serde(default)]
    error: Option<ErrorEvent>,
}

fn required<T>(value: Option<T>, kind: &'static str, field: &'static str) -> Result<T, DecodeError> {
    value.ok_or(DecodeError::MissingPayload { kind, field })
}

impl RawEvent {
    fn into_event(self) -> Result<Event, DecodeError> {
        let event = match self.kind.as_str() {
            "SUBSCRIBED" => Event::Subscribed(required(self.subscribed, "SUBSCRIBED", "subscribed")?),
            "OFFERS" => Event::Offers(required(self.offers, "OFFERS", "offers")?),
            "RESCIND" => Event::Rescind(required(self.rescind, "RESCIND", "rescind")?),
            "UPDATE" => Event::Update(required(self.update, "UPDATE", "update")?),
            "MESSAGE" => Event::Message(required(self.message, "MESSAGE", "message")?),
            "FAILURE" => Event::Failure(required(self.failure, "FAILURE", "failure")?),
            "ERROR" => Event::Error(required(self.error, "ERROR", "error")?),
            "HEARTBEAT" => Event::Heartbeat,
            _ => Event::Unknown(self.kind),
        };
        Ok(event)
    }
}
