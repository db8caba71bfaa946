use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod timefmt;
pub mod wire;

/// Lifecycle of the broker session as seen by observers. Transitions are
/// owned by the session controller; everyone else receives copies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Retrying => "retrying",
            Self::Error => "error",
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote modem link state, not to be confused with the local session state.
/// Wire values are the backend's Spanish terms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModemLink {
    Open,
    Closed,
    Unknown,
}

impl ModemLink {
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Open => "abierto",
            Self::Closed => "cerrado",
            Self::Unknown => "desconocido",
        }
    }

    pub fn from_wire(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("abierto") {
            Self::Open
        } else if trimmed.eq_ignore_ascii_case("cerrado") {
            Self::Closed
        } else {
            Self::Unknown
        }
    }
}

impl Default for ModemLink {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for ModemLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Liveness of a tracked charo host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Unknown,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "unknown" | "" => Ok(Self::Unknown),
            other => Err(format!("Unknown agent status: {other}")),
        }
    }
}

/// Color band for the connectivity percentage gauge.
/// red: 0..40, amber: 40..85, green: >= 85.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthBand {
    Critical,
    Degraded,
    Healthy,
}

pub const HEALTH_CRITICAL_BELOW: f64 = 40.0;
pub const HEALTH_DEGRADED_BELOW: f64 = 85.0;

impl HealthBand {
    pub fn from_pct(pct: f64) -> Self {
        if pct < HEALTH_CRITICAL_BELOW {
            Self::Critical
        } else if pct < HEALTH_DEGRADED_BELOW {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Degraded => "degraded",
            Self::Healthy => "healthy",
        }
    }
}

impl fmt::Display for HealthBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mail-pipeline event from the backend, kept in a bounded replay buffer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailEvent {
    #[serde(rename = "type", default = "default_email_kind")]
    pub kind: String,
    #[serde(default = "default_email_subject")]
    pub subject: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(rename = "ts", default)]
    pub timestamp: String,
}

fn default_email_kind() -> String {
    "email".to_string()
}

fn default_email_subject() -> String {
    "n/d".to_string()
}

/// A remote device currently reported as disconnected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrdItem {
    pub id: i64,
    #[serde(rename = "nombre")]
    pub name: String,
    /// ISO-8601 preferred; the offset-naive legacy form is tolerated by
    /// [`timefmt::parse_instant`].
    #[serde(rename = "ultima_caida", default)]
    pub last_drop: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GrdList {
    #[serde(default)]
    pub items: Vec<GrdItem>,
}

/// Reconciled view of one fleet agent, as handed to observers.
/// Ordering in snapshots is case-insensitive by instance id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetAgentView {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    #[serde(rename = "topicId")]
    pub topic_id: String,
    pub alias: String,
    pub status: AgentStatus,
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub metrics: Value,
}
