//! Shared protocol values: identifiers, resources, offers, framework info.

use serde::{Deserialize, Serialize};

macro_rules! value_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            pub value: String,
        }

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self { value: value.into() }
            }

            pub fn as_str(&self) -> &str {
                &self.value
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.value)
            }
        }
    };
}

value_id!(
    /// Identity issued to the framework on its first subscription.
    FrameworkId
);
value_id!(
    /// Node agent that owns an offer or runs a task.
    AgentId
);
value_id!(OfferId);
value_id!(ExecutorId);

/// Framework registration metadata sent with SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub user: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FrameworkId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webui_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Scalar,
    Ranges,
    Set,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub value: f64,
}

/// Inclusive range `[begin, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub begin: u64,
    pub end: u64,
}

impl Range {
    pub fn contains(&self, value: u64) -> bool {
        self.begin <= value && value <= self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranges {
    #[serde(default)]
    pub range: Vec<Range>,
}

/// A named resource (`cpus`, `mem`, `disk`, `ports`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalar: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Ranges>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Resource {
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            kind: ValueType::Scalar,
            scalar: Some(Scalar { value }),
            ranges: None,
            role: None,
        }
    }

    /// `ports` resource covering exactly the given ports, merged into
    /// contiguous ranges.
    pub fn ports(ports: &[u16]) -> Self {
        let mut sorted: Vec<u64> = ports.iter().map(|p| u64::from(*p)).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut range: Vec<Range> = Vec::new();
        for port in sorted {
            match range.last_mut() {
                Some(last) if last.end + 1 == port => last.end = port,
                _ => range.push(Range {
                    begin: port,
                    end: port,
                }),
            }
        }

        Self {
            name: "ports".to_string(),
            kind: ValueType::Ranges,
            scalar: None,
            ranges: Some(Ranges { range }),
            role: None,
        }
    }
}

/// Resources one agent is willing to give the framework right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<FrameworkId>,
    pub agent_id: AgentId,
    pub hostname: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Offer {
    /// Sum of all scalar resources with this name.
    pub fn scalar(&self, name: &str) -> f64 {
        self.resources
            .iter()
            .filter(|r| r.name == name)
            .filter_map(|r| r.scalar.map(|s| s.value))
            .sum()
    }

    /// All offered port ranges.
    pub fn port_ranges(&self) -> impl Iterator<Item = &Range> {
        self.resources
            .iter()
            .filter(|r| r.name == "ports")
            .filter_map(|r| r.ranges.as_ref())
            .flat_map(|r| r.range.iter())
    }

    /// Whether every given port lies inside an offered range.
    pub fn offers_ports(&self, ports: &[u16]) -> bool {
        ports.iter().all(|port| {
            self.port_ranges()
                .any(|range| range.contains(u64::from(*port)))
        })
    }
}

/// Offer filters attached to ACCEPT and DECLINE.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    pub refuse_seconds: f64,
}
