//! Scheduler domain types: roles, task records, identity and scale.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use halyard_id::TaskId;
use halyard_proto::{AgentId, FrameworkId, TaskInfo, TaskStatus};
use serde::{Deserialize, Serialize};

/// Task category. Doubles as the key-value namespace segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Control-plane instance.
    Server,
    /// Worker instance.
    Agent,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Server, Role::Agent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Agent => "agent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Role::Server),
            "agent" => Ok(Role::Agent),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Lifecycle of a task as the scheduler tracks it.
///
/// `Finished`, `Failed`, `Killed` and `Lost` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Staging,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Staging | TaskState::Running)
    }

    fn rank(&self) -> u8 {
        match self {
            TaskState::Staging => 0,
            TaskState::Running => 1,
            _ => 2,
        }
    }
}

impl TaskState {
    /// Map a wire state. States this build does not recognise carry no
    /// information and map to `None`.
    pub fn from_wire(state: halyard_proto::TaskState) -> Option<Self> {
        use halyard_proto::TaskState as Wire;
        let state = match state {
            Wire::TaskStaging | Wire::TaskStarting => TaskState::Staging,
            Wire::TaskRunning | Wire::TaskKilling => TaskState::Running,
            Wire::TaskFinished => TaskState::Finished,
            Wire::TaskFailed | Wire::TaskError => TaskState::Failed,
            Wire::TaskKilled => TaskState::Killed,
            Wire::TaskLost
            | Wire::TaskDropped
            | Wire::TaskUnreachable
            | Wire::TaskGone
            | Wire::TaskGoneByOperator => TaskState::Lost,
            Wire::TaskUnknown => return None,
        };
        Some(state)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Staging => "staging",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
            TaskState::Killed => "killed",
            TaskState::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// Outcome of applying a status update to a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State moved forward; record must be persisted.
    Advanced { from: TaskState, to: TaskState },
    /// Same state reported again; metadata may still have changed.
    Unchanged,
    /// Backwards or out-of-terminal move; record left alone.
    Ignored,
}

/// One launched process, persisted under `<fw>:<role>:<task-id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub role: Role,
    pub agent_id: AgentId,
    pub hostname: String,
    pub state: TaskState,
    /// Launch specification, kept so identical work can be relaunched.
    pub info: TaskInfo,
    /// Set once a scale-down picked this task; cleared never.
    #[serde(default)]
    pub kill_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A freshly launched task in `Staging`.
    pub fn staging(id: TaskId, role: Role, hostname: impl Into<String>, info: TaskInfo) -> Self {
        let now = Utc::now();
        Self {
            id,
            role,
            agent_id: info.agent_id.clone(),
            hostname: hostname.into(),
            state: TaskState::Staging,
            info,
            kill_requested: false,
            last_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Non-terminal and not already picked for a kill.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !self.kill_requested
    }

    /// Host ports bound to this task through its discovery info.
    pub fn host_ports(&self) -> Vec<u16> {
        self.info.host_ports()
    }

    /// Apply a status update. Regressions, moves out of a terminal state
    /// and unrecognised states are ignored.
    pub fn apply_status(&mut self, status: &TaskStatus) -> Transition {
        let Some(next) = TaskState::from_wire(status.state) else {
            return Transition::Ignored;
        };
        let current = self.state;

        if current.is_terminal() || next.rank() < current.rank() {
            return Transition::Ignored;
        }

        if let Some(agent) = &status.agent_id {
            self.agent_id = agent.clone();
        }
        if status.message.is_some() {
            self.last_message = status.message.clone();
        }
        self.updated_at = Utc::now();

        if next == current {
            return Transition::Unchanged;
        }
        self.state = next;
        Transition::Advanced {
            from: current,
            to: next,
        }
    }
}

/// Registration handle issued by the resource manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkIdentity {
    pub framework_id: Option<FrameworkId>,
    /// Stream token of the current session; stale after a disconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

/// Administrator-set desired counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleTarget {
    pub servers: u32,
    pub agents: u32,
    pub agent_max: u32,
}

impl ScaleTarget {
    pub fn desired(&self, role: Role) -> u32 {
        match role {
            Role::Server => self.servers,
            Role::Agent => self.agents,
        }
    }

    pub fn set_desired(&mut self, role: Role, count: u32) {
        match role {
            Role::Server => self.servers = count,
            Role::Agent => self.agents = count,
        }
    }

    /// Upper bound for a role, if it has one.
    pub fn max(&self, role: Role) -> Option<u32> {
        match role {
            Role::Server => None,
            Role::Agent => Some(self.agent_max),
        }
    }
}

/// Configuration snapshot persisted under `<fw>:framework_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Bumped on every write so a restart sees the latest revision.
    pub revision: u64,
    pub scale: ScaleTarget,
    pub framework_name: String,
    pub port_from: u16,
    pub port_to: u16,
    pub updated_at: DateTime<Utc>,
}
