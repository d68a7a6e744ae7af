//! Scheduler configuration.
//!
//! Everything is read from `HALYARD_*` environment variables. Values that
//! the administrator changes at runtime (the scale target) are persisted in
//! the key-value store and take precedence over these defaults on restart.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use halyard_proto::FrameworkInfo;

use crate::ports::PortRange;
use crate::task::{Role, ScaleTarget};

/// Container port published on a host port chosen by the port allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPort {
    pub name: String,
    pub container_port: u16,
}

/// What to run for one role.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleSpec {
    pub image: String,
    pub command: String,
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub ports: Vec<NamedPort>,
}

impl RoleSpec {
    fn server_default() -> Self {
        Self {
            image: "rancher/k3s:latest".to_string(),
            command: "k3s server --disable-agent".to_string(),
            cpus: 1.0,
            mem: 1200.0,
            disk: 10000.0,
            ports: vec![
                NamedPort {
                    name: "api".to_string(),
                    container_port: 6443,
                },
                NamedPort {
                    name: "bootstrap".to_string(),
                    container_port: 10422,
                },
            ],
        }
    }

    fn agent_default() -> Self {
        Self {
            image: "rancher/k3s:latest".to_string(),
            command: "k3s agent".to_string(),
            cpus: 1.0,
            mem: 1000.0,
            disk: 10000.0,
            ports: vec![
                NamedPort {
                    name: "http".to_string(),
                    container_port: 80,
                },
                NamedPort {
                    name: "https".to_string(),
                    container_port: 443,
                },
            ],
        }
    }

    /// Host port bound to the container port with this name, given the
    /// host ports in allocation order.
    pub fn host_port_for(&self, name: &str, host_ports: &[u16]) -> Option<u16> {
        self.ports
            .iter()
            .position(|p| p.name == name)
            .and_then(|idx| host_ports.get(idx).copied())
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Framework name; also the key-value namespace.
    pub framework_name: String,

    /// OS user tasks run as.
    pub framework_user: String,

    /// Resource role the framework subscribes with.
    pub framework_role: String,

    pub principal: String,

    /// Hostname advertised to the resource manager.
    pub hostname: String,

    /// Admin API listen address.
    pub listen_addr: SocketAddr,

    /// Advertise the web UI over https.
    pub webui_https: bool,

    /// Resource manager base URL (example: http://127.0.0.1:5050).
    pub master_url: String,
    pub master_username: String,
    pub master_password: String,

    /// Admin API credentials. Empty username disables the check.
    pub api_username: String,
    pub api_password: String,

    /// SQLite database backing the key-value store, or `:memory:`.
    pub store_path: String,

    pub port_range: PortRange,

    pub failover_timeout_secs: f64,

    /// Keep-alive interval on the subscription.
    pub heartbeat_interval: Duration,

    /// Consecutive keep-alive failures that end a session.
    pub heartbeat_max_failures: u32,

    /// Longest silence tolerated on the event stream.
    pub read_timeout: Duration,

    /// Supervisor tick between subscription attempts.
    pub resubscribe_interval: Duration,

    /// Bound on every outbound call and key-value operation.
    pub request_timeout: Duration,

    /// How long declined offers are withheld.
    pub refuse_seconds: f64,

    /// Capacity of the outbound call queue.
    pub outbox_capacity: usize,

    pub server: RoleSpec,
    pub agent: RoleSpec,

    /// Scale used when the store holds none.
    pub initial_scale: ScaleTarget,

    /// Credentials for the bootstrap status endpoint inside the server task.
    pub bootstrap_username: String,
    pub bootstrap_password: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            framework_name: "halyard".to_string(),
            framework_user: "root".to_string(),
            framework_role: "*".to_string(),
            principal: "halyard".to_string(),
            hostname: "localhost".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 10000)),
            webui_https: false,
            master_url: "http://127.0.0.1:5050".to_string(),
            master_username: String::new(),
            master_password: String::new(),
            api_username: String::new(),
            api_password: String::new(),
            store_path: ":memory:".to_string(),
            port_range: PortRange::DEFAULT,
            failover_timeout_secs: 5000.0,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_max_failures: 3,
            read_timeout: Duration::from_secs(90),
            resubscribe_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            refuse_seconds: 5.0,
            outbox_capacity: 256,
            server: RoleSpec::server_default(),
            agent: RoleSpec::agent_default(),
            initial_scale: ScaleTarget {
                servers: 1,
                agents: 1,
                agent_max: 10,
            },
            bootstrap_username: String::new(),
            bootstrap_password: String::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        if std::env::var("HALYARD_HOSTNAME").is_err() {
            if let Ok(host) = std::env::var("HOSTNAME") {
                config.hostname = host;
            }
        }
        Ok(config)
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("HALYARD_FRAMEWORK_NAME") {
            config.framework_name = v;
        }
        if let Some(v) = get("HALYARD_FRAMEWORK_USER") {
            config.framework_user = v;
        }
        if let Some(v) = get("HALYARD_FRAMEWORK_ROLE") {
            config.framework_role = v;
        }
        if let Some(v) = get("HALYARD_PRINCIPAL") {
            config.principal = v;
        }
        if let Some(v) = get("HALYARD_HOSTNAME") {
            config.hostname = v;
        }
        if let Some(v) = get("HALYARD_LISTEN_ADDR") {
            config.listen_addr = v
                .parse()
                .context("HALYARD_LISTEN_ADDR must be a socket address.")?;
        }
        if let Some(v) = get("HALYARD_WEBUI_HTTPS") {
            config.webui_https = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = get("HALYARD_MASTER_URL") {
            config.master_url = v.trim_end_matches('/').to_string();
        }
        config.master_username = get("HALYARD_MASTER_USERNAME").unwrap_or_default();
        config.master_password = get("HALYARD_MASTER_PASSWORD").unwrap_or_default();
        config.api_username = get("HALYARD_API_USERNAME").unwrap_or_default();
        config.api_password = get("HALYARD_API_PASSWORD").unwrap_or_default();
        config.bootstrap_username = get("HALYARD_BOOTSTRAP_USERNAME").unwrap_or_default();
        config.bootstrap_password = get("HALYARD_BOOTSTRAP_PASSWORD").unwrap_or_default();
        if let Some(v) = get("HALYARD_STORE_PATH") {
            config.store_path = v;
        }
        if let Some(v) = get("HALYARD_LOG_LEVEL") {
            config.log_level = v;
        }

        let from: u16 = parse_or(&get, "HALYARD_PORT_RANGE_FROM", config.port_range.from())?;
        let to: u16 = parse_or(&get, "HALYARD_PORT_RANGE_TO", config.port_range.to())?;
        config.port_range = PortRange::new(from, to).with_context(|| {
            format!("HALYARD_PORT_RANGE_FROM ({from}) must be below HALYARD_PORT_RANGE_TO ({to}).")
        })?;

        config.failover_timeout_secs = parse_or(
            &get,
            "HALYARD_FAILOVER_TIMEOUT_SECS",
            config.failover_timeout_secs,
        )?;
        config.heartbeat_interval = Duration::from_secs(parse_or(
            &get,
            "HALYARD_HEARTBEAT_INTERVAL_SECS",
            config.heartbeat_interval.as_secs(),
        )?);
        config.heartbeat_max_failures = parse_or(
            &get,
            "HALYARD_HEARTBEAT_MAX_FAILURES",
            config.heartbeat_max_failures,
        )?;
        config.read_timeout = Duration::from_secs(parse_or(
            &get,
            "HALYARD_READ_TIMEOUT_SECS",
            config.read_timeout.as_secs(),
        )?);
        config.resubscribe_interval = Duration::from_secs(parse_or(
            &get,
            "HALYARD_RESUBSCRIBE_INTERVAL_SECS",
            config.resubscribe_interval.as_secs(),
        )?);
        config.request_timeout = Duration::from_secs(parse_or(
            &get,
            "HALYARD_REQUEST_TIMEOUT_SECS",
            config.request_timeout.as_secs(),
        )?);
        config.refuse_seconds = parse_or(&get, "HALYARD_REFUSE_SECONDS", config.refuse_seconds)?;
        config.outbox_capacity =
            parse_or(&get, "HALYARD_OUTBOX_CAPACITY", config.outbox_capacity)?;

        config.server = role_spec_from(&get, "HALYARD_SERVER", config.server)?;
        config.agent = role_spec_from(&get, "HALYARD_AGENT", config.agent)?;

        config.initial_scale = ScaleTarget {
            servers: parse_or(&get, "HALYARD_SERVER_COUNT", config.initial_scale.servers)?,
            agents: parse_or(&get, "HALYARD_AGENT_COUNT", config.initial_scale.agents)?,
            agent_max: parse_or(&get, "HALYARD_AGENT_MAX", config.initial_scale.agent_max)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.framework_name.contains(':') {
            bail!("HALYARD_FRAMEWORK_NAME must not contain ':'.");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("HALYARD_HEARTBEAT_INTERVAL_SECS must be positive.");
        }
        if self.heartbeat_max_failures == 0 {
            bail!("HALYARD_HEARTBEAT_MAX_FAILURES must be positive.");
        }
        if self.read_timeout <= self.heartbeat_interval {
            bail!("HALYARD_READ_TIMEOUT_SECS must exceed the heartbeat interval.");
        }
        if self.resubscribe_interval.is_zero() || self.request_timeout.is_zero() {
            bail!("Resubscribe interval and request timeout must be positive.");
        }
        if self.outbox_capacity == 0 {
            bail!("HALYARD_OUTBOX_CAPACITY must be positive.");
        }
        if self.initial_scale.agents > self.initial_scale.agent_max {
            bail!(
                "HALYARD_AGENT_COUNT ({}) exceeds HALYARD_AGENT_MAX ({}).",
                self.initial_scale.agents,
                self.initial_scale.agent_max
            );
        }
        for (role, spec) in [(Role::Server, &self.server), (Role::Agent, &self.agent)] {
            if spec.ports.len() > self.port_range.len() {
                bail!(
                    "{role} needs {} host ports but the port range holds {}.",
                    spec.ports.len(),
                    self.port_range.len()
                );
            }
        }
        Ok(())
    }

    pub fn role_spec(&self, role: Role) -> &RoleSpec {
        match role {
            Role::Server => &self.server,
            Role::Agent => &self.agent,
        }
    }

    /// Scheduler endpoint on the resource manager.
    pub fn scheduler_endpoint(&self) -> String {
        format!("{}{}", self.master_url, halyard_proto::SCHEDULER_PATH)
    }

    pub fn webui_url(&self) -> String {
        let scheme = if self.webui_https { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.hostname, self.listen_addr.port())
    }

    /// Registration metadata, without an identity.
    pub fn framework_info(&self) -> FrameworkInfo {
        FrameworkInfo {
            user: self.framework_user.clone(),
            name: self.framework_name.clone(),
            id: None,
            failover_timeout: Some(self.failover_timeout_secs),
            checkpoint: Some(true),
            role: Some(self.framework_role.clone()),
            hostname: Some(self.hostname.clone()),
            principal: Some(self.principal.clone()),
            webui_url: Some(self.webui_url()),
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}

fn role_spec_from<G>(get: &G, prefix: &str, mut spec: RoleSpec) -> Result<RoleSpec>
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(v) = get(&format!("{prefix}_IMAGE")) {
        spec.image = v;
    }
    if let Some(v) = get(&format!("{prefix}_COMMAND")) {
        spec.command = v;
    }
    spec.cpus = parse_or(get, &format!("{prefix}_CPUS"), spec.cpus)?;
    spec.mem = parse_or(get, &format!("{prefix}_MEM"), spec.mem)?;
    spec.disk = parse_or(get, &format!("{prefix}_DISK"), spec.disk)?;
    if let Some(v) = get(&format!("{prefix}_PORTS")) {
        spec.ports = parse_ports(&v).with_context(|| format!("{prefix}_PORTS is invalid."))?;
    }
    Ok(spec)
}

/// Parses `name:port,name:port`.
fn parse_ports(raw: &str) -> Result<Vec<NamedPort>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let Some((name, port)) = entry.split_once(':') else {
                bail!("expected name:port, got {entry:?}");
            };
            Ok(NamedPort {
                name: name.trim().to_string(),
                container_port: port.trim().parse().context("port must fit in u16")?,
            })
        })
        .collect()
}
