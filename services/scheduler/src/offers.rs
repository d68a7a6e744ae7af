//! Offer evaluation.
//!
//! Each offer launches at most one task. The server role is filled first;
//! agents launch only once a server task is running, since they join the
//! cluster through it. Whatever is not used is declined in one call.

use halyard_id::TaskId;
use halyard_proto::{
    Call, CommandInfo, ContainerInfo, ContainerType, DiscoveryInfo, DockerInfo, DockerNetwork,
    Environment, Filters, FrameworkId, Offer, OfferId, Port, PortMapping, Ports, Resource,
    TaskIdValue, TaskInfo, Variable, Visibility,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, RoleSpec};
use crate::connection::OutboxError;
use crate::context::SchedulerContext;
use crate::ports::AllocationError;
use crate::state::StoreError;
use crate::task::{Role, ScaleTarget, Task, TaskState};

/// Errors that drop a whole offer batch.
#[derive(Debug, Error)]
pub enum OfferError {
    #[error("no framework id yet; offers cannot be answered")]
    NotSubscribed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reasons a single launch was abandoned.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("offer lacks {resource}: wanted {wanted}, offered {offered}")]
    InsufficientResources {
        resource: &'static str,
        wanted: f64,
        offered: f64,
    },

    #[error(transparent)]
    Ports(#[from] AllocationError),

    #[error("offer does not include allocated ports {0:?}")]
    PortsNotOffered(Vec<u16>),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// What happened to one offer batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub launched: Vec<(Role, TaskId)>,
    pub declined: Vec<OfferId>,
}

/// Turns offers into launches.
#[derive(Clone)]
pub struct OfferEvaluator {
    ctx: SchedulerContext,
}

impl OfferEvaluator {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(offers = offers.len()))]
    pub async fn evaluate(&self, offers: Vec<Offer>) -> Result<EvaluationSummary, OfferError> {
        let framework_id = self
            .ctx
            .framework_id()
            .await
            .ok_or(OfferError::NotSubscribed)?;

        let _guard = self.ctx.lock_reconcile().await;
        let target = self.ctx.scale().await;
        let mut tasks = self.ctx.store().all_tasks().await?;
        let mut summary = EvaluationSummary::default();

        for offer in offers {
            let Some(role) = next_role(&tasks, &target) else {
                summary.declined.push(offer.id);
                continue;
            };

            match self.launch(&framework_id, &offer, role, &mut tasks).await {
                Ok(task_id) => summary.launched.push((role, task_id)),
                Err(e) => {
                    warn!(
                        offer_id = %offer.id,
                        hostname = %offer.hostname,
                        role = %role,
                        error = %e,
                        "Launch abandoned"
                    );
                    summary.declined.push(offer.id);
                }
            }
        }

        if !summary.declined.is_empty() {
            let filters = Filters {
                refuse_seconds: self.ctx.config().refuse_seconds,
            };
            let call = Call::decline(framework_id, summary.declined.clone(), Some(filters));
            if let Err(e) = self.ctx.outbox().send(call).await {
                warn!(count = summary.declined.len(), error = %e, "Decline not sent");
            }
        }

        debug!(
            launched = summary.launched.len(),
            declined = summary.declined.len(),
            "Offer batch evaluated"
        );
        Ok(summary)
    }

    async fn launch(
        &self,
        framework_id: &FrameworkId,
        offer: &Offer,
        role: Role,
        tasks: &mut Vec<Task>,
    ) -> Result<TaskId, LaunchError> {
        let config = self.ctx.config();
        let spec = config.role_spec(role);

        for (resource, wanted) in [("cpus", spec.cpus), ("mem", spec.mem), ("disk", spec.disk)] {
            let offered = offer.scalar(resource);
            if offered < wanted {
                return Err(LaunchError::InsufficientResources {
                    resource,
                    wanted,
                    offered,
                });
            }
        }

        let host_ports = config.port_range.allocate(spec.ports.len(), tasks.iter())?;
        if !offer.offers_ports(&host_ports) {
            return Err(LaunchError::PortsNotOffered(host_ports));
        }

        // Relaunch in place: reuse the id of a dead task of this role.
        let reused = tasks
            .iter()
            .position(|t| t.role == role && t.is_terminal() && !t.kill_requested);
        let task_id = reused.map(|idx| tasks[idx].id).unwrap_or_else(TaskId::new);

        let environment = task_environment(config, role, &task_id, tasks);
        let info = build_task_info(config, spec, role, &task_id, offer, &host_ports, environment);
        let task = Task::staging(task_id, role, offer.hostname.clone(), info.clone());

        self.ctx.store().put_task(&task).await?;

        let filters = Filters {
            refuse_seconds: config.refuse_seconds,
        };
        let call = Call::accept(framework_id.clone(), offer.id.clone(), vec![info], Some(filters));
        if let Err(e) = self.ctx.outbox().send(call).await {
            match reused {
                Some(idx) => self.ctx.store().put_task(&tasks[idx]).await?,
                None => self.ctx.store().delete_task(role, &task_id).await?,
            }
            return Err(e.into());
        }

        info!(
            task_id = %task_id,
            role = %role,
            hostname = %offer.hostname,
            ports = ?host_ports,
            relaunch = reused.is_some(),
            "Launching task"
        );

        match reused {
            Some(idx) => tasks[idx] = task,
            None => tasks.push(task),
        }
        Ok(task_id)
    }
}

/// Role the next offer should launch, if any.
fn next_role(tasks: &[Task], target: &ScaleTarget) -> Option<Role> {
    let active = |role: Role| tasks.iter().filter(|t| t.role == role && t.is_active()).count();

    if active(Role::Server) < target.servers as usize {
        return Some(Role::Server);
    }

    let server_running = tasks
        .iter()
        .any(|t| t.role == Role::Server && t.state == TaskState::Running && !t.kill_requested);
    let agent_goal = target.agents.min(target.agent_max) as usize;
    if server_running && active(Role::Agent) < agent_goal {
        return Some(Role::Agent);
    }

    None
}

fn task_environment(config: &Config, role: Role, task_id: &TaskId, tasks: &[Task]) -> Vec<Variable> {
    let mut variables = vec![
        Variable {
            name: "HALYARD_FRAMEWORK".to_string(),
            value: config.framework_name.clone(),
        },
        Variable {
            name: "HALYARD_ROLE".to_string(),
            value: role.to_string(),
        },
        Variable {
            name: "HALYARD_TASK_ID".to_string(),
            value: task_id.to_string(),
        },
    ];

    if role == Role::Agent {
        let server = tasks
            .iter()
            .find(|t| t.role == Role::Server && t.state == TaskState::Running);
        if let Some(server) = server {
            if let Some(port) = config.server.host_port_for("api", &server.host_ports()) {
                variables.push(Variable {
                    name: "K3S_URL".to_string(),
                    value: format!("https://{}:{}", server.hostname, port),
                });
            }
        }
    }

    variables
}

fn build_task_info(
    config: &Config,
    spec: &RoleSpec,
    role: Role,
    task_id: &TaskId,
    offer: &Offer,
    host_ports: &[u16],
    environment: Vec<Variable>,
) -> TaskInfo {
    let mut resources = vec![
        Resource::scalar("cpus", spec.cpus),
        Resource::scalar("mem", spec.mem),
        Resource::scalar("disk", spec.disk),
    ];
    if !host_ports.is_empty() {
        resources.push(Resource::ports(host_ports));
    }

    let port_mappings = spec
        .ports
        .iter()
        .zip(host_ports)
        .map(|(named, host)| PortMapping {
            host_port: *host,
            container_port: named.container_port,
            protocol: Some("tcp".to_string()),
        })
        .collect();

    let discovery_ports = spec
        .ports
        .iter()
        .zip(host_ports)
        .map(|(named, host)| Port {
            number: *host,
            name: Some(named.name.clone()),
            protocol: Some("tcp".to_string()),
        })
        .collect();

    TaskInfo {
        name: format!("{}:{}", config.framework_name, role),
        task_id: TaskIdValue::new(task_id.to_string()),
        agent_id: offer.agent_id.clone(),
        resources,
        command: Some(CommandInfo {
            value: Some(spec.command.clone()),
            shell: Some(true),
            environment: Some(Environment {
                variables: environment,
            }),
        }),
        container: Some(ContainerInfo {
            kind: ContainerType::Docker,
            docker: Some(DockerInfo {
                image: spec.image.clone(),
                network: DockerNetwork::Bridge,
                port_mappings,
                privileged: true,
                force_pull_image: false,
            }),
        }),
        discovery: Some(DiscoveryInfo {
            visibility: Visibility::External,
            name: Some(format!("{}-{}", config.framework_name, role)),
            ports: Some(Ports {
                ports: discovery_ports,
            }),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;
    use halyard_proto::{AgentId, CallType, Range, Ranges, ValueType};
    use tokio::sync::mpsc;

    fn offer(id: &str, host: &str, ports: (u64, u64)) -> Offer {
        Offer {
            id: OfferId::new(id),
            framework_id: None,
            agent_id: AgentId::new(format!("agent-{host}")),
            hostname: host.to_string(),
            resources: vec![
                Resource::scalar("cpus", 4.0),
                Resource::scalar("mem", 8192.0),
                Resource::scalar("disk", 100_000.0),
                Resource {
                    name: "ports".to_string(),
                    kind: ValueType::Ranges,
                    scalar: None,
                    ranges: Some(Ranges {
                        range: vec![Range {
                            begin: ports.0,
                            end: ports.1,
                        }],
                    }),
                    role: None,
                },
            ],
        }
    }

    fn full_offer(id: &str, host: &str) -> Offer {
        offer(id, host, (31000, 32000))
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

    async fn mark_running(ctx: &SchedulerContext, role: Role) {
        for mut task in ctx.store().list_tasks(role).await.unwrap() {
            task.state = TaskState::Running;
            ctx.store().put_task(&task).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unsubscribed_evaluation_fails() {
        let ctx = testing::context().await;
        let err = OfferEvaluator::new(ctx)
            .evaluate(vec![full_offer("o1", "n1")])
            .await
            .unwrap_err();
        assert!(matches!(err, OfferError::NotSubscribed));
    }

    #[tokio::test]
    async fn test_server_launches_first_and_agent_waits() {
        let (ctx, mut rx) = subscribed().await;
        let evaluator = OfferEvaluator::new(ctx.clone());

        let summary = evaluator
            .evaluate(vec![full_offer("o1", "n1"), full_offer("o2", "n2")])
            .await
            .unwrap();
        assert_eq!(summary.launched.len(), 1);
        assert_eq!(summary.launched[0].0, Role::Server);
        assert_eq!(summary.declined, vec![OfferId::new("o2")]);

        let calls = drain(&mut rx);
        let kinds: Vec<CallType> = calls.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallType::Accept, CallType::Decline]);

        let server = ctx.store().list_tasks(Role::Server).await.unwrap();
        assert_eq!(server.len(), 1);
        assert_eq!(server[0].state, TaskState::Staging);
        assert_eq!(server[0].host_ports(), vec![31000, 31001]);
    }

    #[tokio::test]
    async fn test_agent_launch_gets_server_url_and_distinct_ports() {
        let (ctx, mut rx) = subscribed().await;
        let evaluator = OfferEvaluator::new(ctx.clone());

        evaluator.evaluate(vec![full_offer("o1", "n1")]).await.unwrap();
        mark_running(&ctx, Role::Server).await;
        drain(&mut rx);

        let summary = evaluator.evaluate(vec![full_offer("o2", "n2")]).await.unwrap();
        assert_eq!(summary.launched[0].0, Role::Agent);

        let agents = ctx.store().list_tasks(Role::Agent).await.unwrap();
        let agent = &agents[0];
        assert_eq!(agent.host_ports(), vec![31002, 31003]);

        let env = &agent.info.command.as_ref().unwrap().environment.as_ref().unwrap().variables;
        let url = env.iter().find(|v| v.name == "K3S_URL").unwrap();
        assert_eq!(url.value, "https://n1:31000");

        let accept = drain(&mut rx).into_iter().next().unwrap().accept.unwrap();
        let launch = accept.operations[0].launch.as_ref().unwrap();
        assert_eq!(launch.task_infos[0].agent_id, AgentId::new("agent-n2"));
    }

    #[tokio::test]
    async fn test_target_reached_declines_everything() {
        let (ctx, mut rx) = subscribed().await;
        let evaluator = OfferEvaluator::new(ctx.clone());
        evaluator.evaluate(vec![full_offer("o1", "n1")]).await.unwrap();
        mark_running(&ctx, Role::Server).await;
        evaluator.evaluate(vec![full_offer("o2", "n2")]).await.unwrap();
        drain(&mut rx);

        let summary = evaluator
            .evaluate(vec![full_offer("o3", "n3"), full_offer("o4", "n4")])
            .await
            .unwrap();
        assert!(summary.launched.is_empty());

        let calls = drain(&mut rx);
        assert_eq!(calls.len(), 1);
        let decline = calls[0].decline.as_ref().unwrap();
        assert_eq!(decline.offer_ids.len(), 2);
        assert_eq!(decline.filters.unwrap().refuse_seconds, 5.0);
    }

    #[tokio::test]
    async fn test_small_offer_is_declined() {
        let (ctx, _rx) = subscribed().await;
        let mut small = full_offer("o1", "n1");
        small.resources[1] = Resource::scalar("mem", 128.0);

        let summary = OfferEvaluator::new(ctx.clone())
            .evaluate(vec![small])
            .await
            .unwrap();
        assert!(summary.launched.is_empty());
        assert_eq!(summary.declined.len(), 1);
        assert!(ctx.store().all_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offer_without_allocated_ports_is_declined() {
        let (ctx, _rx) = subscribed().await;
        let summary = OfferEvaluator::new(ctx.clone())
            .evaluate(vec![offer("o1", "n1", (40000, 40010))])
            .await
            .unwrap();
        assert!(summary.launched.is_empty());
        assert!(ctx.store().all_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_range_abandons_only_that_launch() {
        let mut config = crate::config::Config::default();
        config.port_range = crate::ports::PortRange::new(31000, 31003).unwrap();
        config.initial_scale.agents = 2;
        let ctx = testing::context_with(config).await;
        ctx.adopt_identity(FrameworkId::new("fw"), "s".to_string())
            .await
            .unwrap();
        let _rx = ctx.outbox().attach(64).await;
        let evaluator = OfferEvaluator::new(ctx.clone());

        evaluator.evaluate(vec![full_offer("o1", "n1")]).await.unwrap();
        mark_running(&ctx, Role::Server).await;

        // Server holds 31000-31001; one port left, agents need two.
        let summary = evaluator.evaluate(vec![full_offer("o2", "n2")]).await.unwrap();
        assert!(summary.launched.is_empty());
        assert_eq!(summary.declined, vec![OfferId::new("o2")]);
    }

    #[tokio::test]
    async fn test_dead_server_is_relaunched_under_same_id() {
        let (ctx, _rx) = subscribed().await;
        let evaluator = OfferEvaluator::new(ctx.clone());
        let first = evaluator.evaluate(vec![full_offer("o1", "n1")]).await.unwrap();
        let original = first.launched[0].1;

        let mut dead = ctx
            .store()
            .get_task(Role::Server, &original)
            .await
            .unwrap()
            .unwrap();
        dead.state = TaskState::Failed;
        ctx.store().put_task(&dead).await.unwrap();

        let second = evaluator.evaluate(vec![full_offer("o2", "n2")]).await.unwrap();
        assert_eq!(second.launched, vec![(Role::Server, original)]);

        let tasks = ctx.store().list_tasks(Role::Server).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].state, TaskState::Staging);
        assert_eq!(tasks[0].hostname, "n2");
    }

    #[tokio::test]
    async fn test_failed_accept_rolls_back_record() {
        let ctx = testing::context().await;
        ctx.adopt_identity(FrameworkId::new("fw"), "s".to_string())
            .await
            .unwrap();
        // No queue attached: the ACCEPT cannot be sent.
        let summary = OfferEvaluator::new(ctx.clone())
            .evaluate(vec![full_offer("o1", "n1")])
            .await
            .unwrap();
        assert!(summary.launched.is_empty());
        assert!(ctx.store().all_tasks().await.unwrap().is_empty());
    }

    #[test]
    fn test_next_role_respects_agent_max() {
        let target = ScaleTarget {
            servers: 0,
            agents: 5,
            agent_max: 0,
        };
        assert_eq!(next_role(&[], &target), None);
    }
}
