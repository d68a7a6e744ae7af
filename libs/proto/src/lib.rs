//! Scheduler protocol spoken with the cluster resource manager.
//!
//! The scheduler opens one `POST /api/v1/scheduler` request carrying a
//! SUBSCRIBE [`Call`]; the response body is a stream of newline-delimited
//! JSON [`Event`]s. Every other call is a separate POST on the same
//! endpoint that carries the stream id returned in the subscribe response
//! header ([`STREAM_ID_HEADER`]).
//!
//! Messages are plain serde types. Field names and enum spellings follow
//! the resource manager's JSON encoding (`snake_case` fields,
//! `SCREAMING_SNAKE_CASE` enum values).

mod call;
mod common;
mod event;
mod task;

pub use call::{
    Accept, Acknowledge, Call, CallType, Decline, Kill, Launch, Operation, OperationType,
    Reconcile, ReconcileTask, Revive, Subscribe,
};
pub use common::{
    AgentId, ExecutorId, Filters, FrameworkId, FrameworkInfo, Offer, OfferId, Range, Ranges,
    Resource, Scalar, ValueType,
};
pub use event::{
    DecodeError, ErrorEvent, Event, Failure, Message, Offers, Rescind, Subscribed, Update,
};
pub use task::{
    CommandInfo, ContainerInfo, ContainerType, DiscoveryInfo, DockerInfo, DockerNetwork,
    Environment, Port, PortMapping, Ports, TaskIdValue, TaskInfo, TaskState, TaskStatus,
    Variable, Visibility,
};

/// Response header carrying the session's stream id.
pub const STREAM_ID_HEADER: &str = "Mesos-Stream-Id";

/// Path of the scheduler endpoint on the resource manager.
pub const SCHEDULER_PATH: &str = "/api/v1/scheduler";
