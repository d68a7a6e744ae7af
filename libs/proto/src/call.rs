//! Calls sent from the scheduler to the resource manager.

use serde::{Deserialize, Serialize};

use crate::common::{AgentId, Filters, FrameworkId, FrameworkInfo, OfferId};
use crate::task::{TaskIdValue, TaskInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallType {
    Subscribe,
    Accept,
    Decline,
    Kill,
    Acknowledge,
    Reconcile,
    Revive,
}

/// One scheduler call. Exactly one payload field matching `kind` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<FrameworkId>,
    #[serde(rename = "type")]
    pub kind: CallType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<Subscribe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<Accept>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline: Option<Decline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill: Option<Kill>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledge: Option<Acknowledge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<Reconcile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revive: Option<Revive>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub framework_info: FrameworkInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accept {
    pub offer_ids: Vec<OfferId>,
    pub operations: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Launch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch: Option<Launch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Launch {
    pub task_infos: Vec<TaskInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decline {
    pub offer_ids: Vec<OfferId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kill {
    pub task_id: TaskIdValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledge {
    pub agent_id: AgentId,
    pub task_id: TaskIdValue,
    pub uuid: String,
}

/// Empty `tasks` asks for implicit reconciliation of every known task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconcile {
    #[serde(default)]
    pub tasks: Vec<ReconcileTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileTask {
    pub task_id: TaskIdValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revive {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl Call {
    fn empty(framework_id: Option<FrameworkId>, kind: CallType) -> Self {
        Self {
            framework_id,
            kind,
            subscribe: None,
            accept: None,
            decline: None,
            kill: None,
            acknowledge: None,
            reconcile: None,
            revive: None,
        }
    }

    /// SUBSCRIBE, resubmitting `framework_info.id` when one is known.
    pub fn subscribe(framework_info: FrameworkInfo) -> Self {
        let mut call = Self::empty(framework_info.id.clone(), CallType::Subscribe);
        call.subscribe = Some(Subscribe { framework_info });
        call
    }

    /// ACCEPT one offer, launching `tasks` on it.
    pub fn accept(
        framework_id: FrameworkId,
        offer_id: OfferId,
        tasks: Vec<TaskInfo>,
        filters: Option<Filters>,
    ) -> Self {
        let mut call = Self::empty(Some(framework_id), CallType::Accept);
        call.accept = Some(Accept {
            offer_ids: vec![offer_id],
            operations: vec![Operation {
                kind: OperationType::Launch,
                launch: Some(Launch { task_infos: tasks }),
            }],
            filters,
        });
        call
    }

    pub fn decline(
        framework_id: FrameworkId,
        offer_ids: Vec<OfferId>,
        filters: Option<Filters>,
    ) -> Self {
        let mut call = Self::empty(Some(framework_id), CallType::Decline);
        call.decline = Some(Decline { offer_ids, filters });
        call
    }

    pub fn kill(framework_id: FrameworkId, task_id: TaskIdValue, agent_id: Option<AgentId>) -> Self {
        let mut call = Self::empty(Some(framework_id), CallType::Kill);
        call.kill = Some(Kill { task_id, agent_id });
        call
    }

    pub fn acknowledge(
        framework_id: FrameworkId,
        agent_id: AgentId,
        task_id: TaskIdValue,
        uuid: String,
    ) -> Self {
        let mut call = Self::empty(Some(framework_id), CallType::Acknowledge);
        call.acknowledge = Some(Acknowledge {
            agent_id,
            task_id,
            uuid,
        });
        call
    }

    pub fn reconcile(framework_id: FrameworkId, tasks: Vec<ReconcileTask>) -> Self {
        let mut call = Self::empty(Some(framework_id), CallType::Reconcile);
        call.reconcile = Some(Reconcile { tasks });
        call
    }

    pub fn revive(framework_id: FrameworkId) -> Self {
        let mut call = Self::empty(Some(framework_id), CallType::Revive);
        call.revive = Some(Revive::default());
        call
    }
}
