use crate::bridge::{Bridge, Update};
use chrono::{DateTime, Utc};
use expanel_core::wire::{self, WhitelistPayload};
use expanel_core::{AgentStatus, FleetAgentView};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct HostRecord {
    topic_id: String,
    instance_id: String,
    alias: String,
    status: AgentStatus,
    metrics: Option<Value>,
    last_seen: DateTime<Utc>,
    timeout: Duration,
}

impl HostRecord {
    fn placeholder(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            topic_id: id.to_string(),
            instance_id: id.to_string(),
            alias: id.to_string(),
            status: AgentStatus::Unknown,
            metrics: None,
            last_seen: now,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct FleetInner {
    hosts: HashMap<String, HostRecord>,
    whitelist: HashSet<String>,
    alias_to_id: HashMap<String, String>,
}

/// Registry of charo-daemon hosts keyed by canonical instance id.
/// Membership is driven by the whitelist; liveness by per-host heartbeats
/// plus the periodic timeout sweep.
pub struct FleetRegistry {
    inner: Mutex<FleetInner>,
    bridge: Arc<Bridge>,
}

impl FleetRegistry {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self {
            inner: Mutex::new(FleetInner::default()),
            bridge,
        }
    }

    /// Replaces the authoritative membership set. Every entry gets a tracked
    /// record; an alias that moved to a new canonical id renames the existing
    /// record in place, keeping its metrics and heartbeat history. Hosts
    /// absent from a non-empty whitelist are dropped.
    pub fn apply_whitelist(&self, payload: &WhitelistPayload, now: DateTime<Utc>) {
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let mut ids = HashSet::new();
            let mut new_alias_map = HashMap::new();

            for (alias, id) in payload.normalized() {
                ids.insert(id.clone());
                ensure_placeholder(&mut inner.hosts, &id, &alias, now);
                let previous = inner.alias_to_id.get(&alias).cloned();
                if let Some(previous) = previous {
                    if previous != id {
                        rename_host(&mut inner.hosts, &previous, &id, &alias);
                    }
                }
                new_alias_map.insert(alias, id);
            }

            inner.alias_to_id = new_alias_map;
            inner.whitelist = ids;
            prune_by_whitelist(inner);
            info!(
                event = "fleet_whitelist",
                admitted = inner.whitelist.len(),
                tracked = inner.hosts.len()
            );
        }
        self.broadcast();
    }

    /// Per-host liveness text ("online"/"offline"). Non-admitted hosts are
    /// dropped silently, removing any tracked entry.
    pub fn apply_status(&self, topic_id: &str, payload: &str, now: DateTime<Utc>) {
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let record = inner
                .hosts
                .entry(topic_id.to_string())
                .or_insert_with(|| HostRecord::placeholder(topic_id, now));
            if !is_admitted(&inner.whitelist, &record.instance_id) {
                inner.hosts.remove(topic_id);
                debug!(event = "fleet_rejected", host = topic_id);
                return;
            }
            let record = inner.hosts.get_mut(topic_id).expect("record exists");
            record.last_seen = now;
            record.status = payload.parse().unwrap_or(AgentStatus::Unknown);
        }
        self.broadcast();
    }

    /// Per-host telemetry blob. Forces the host online, refreshes its
    /// heartbeat and honors an advertised `timeoutSeconds` override.
    pub fn apply_metrics(&self, topic_id: Option<&str>, metrics: Value, now: DateTime<Utc>) {
        let advertised_id = wire::metrics_instance_id(&metrics).map(str::to_string);
        let advertised_timeout = wire::metrics_timeout_seconds(&metrics);
        let key = match topic_id.or(advertised_id.as_deref()) {
            Some(id) => id.to_string(),
            None => return,
        };
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let record = inner
                .hosts
                .entry(key.clone())
                .or_insert_with(|| HostRecord::placeholder(&key, now));
            if let Some(id) = &advertised_id {
                record.instance_id = id.clone();
            }
            if !is_admitted(&inner.whitelist, &record.instance_id) {
                inner.hosts.remove(&key);
                debug!(event = "fleet_rejected", host = %key);
                return;
            }
            let record = inner.hosts.get_mut(&key).expect("record exists");
            record.last_seen = now;
            record.status = AgentStatus::Online;
            record.metrics = Some(metrics);
            if let Some(seconds) = advertised_timeout {
                record.timeout = Duration::from_secs(seconds);
            }
        }
        self.broadcast();
    }

    /// Marks hosts offline once they have been silent for twice their
    /// heartbeat timeout. The 2x margin tolerates a single missed heartbeat.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            let mut changed = false;
            for record in inner.hosts.values_mut() {
                let elapsed_ms = (now - record.last_seen).num_milliseconds();
                let threshold_ms = record.timeout.as_millis() as i64 * 2;
                if elapsed_ms > threshold_ms && record.status != AgentStatus::Offline {
                    warn!(
                        event = "fleet_timeout",
                        host = %record.instance_id,
                        silent_ms = elapsed_ms
                    );
                    record.status = AgentStatus::Offline;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.broadcast();
        }
    }

    /// Deterministic view for rendering: case-insensitive order by instance id.
    pub fn snapshot(&self) -> Vec<FleetAgentView> {
        let inner = self.inner.lock().unwrap();
        let mut views: Vec<FleetAgentView> = inner
            .hosts
            .values()
            .map(|record| FleetAgentView {
                instance_id: record.instance_id.clone(),
                topic_id: record.topic_id.clone(),
                alias: record.alias.clone(),
                status: record.status,
                timeout_seconds: record.timeout.as_secs(),
                metrics: record
                    .metrics
                    .clone()
                    .unwrap_or_else(|| Value::Object(Default::default())),
            })
            .collect();
        views.sort_by_key(|view| view.instance_id.to_lowercase());
        views
    }

    fn broadcast(&self) {
        self.bridge.publish(Update::Fleet(self.snapshot()));
    }
}

/// Empty whitelist admits everyone; nothing is rejected before the first
/// membership message arrives. Blank ids are tolerated for the same reason.
fn is_admitted(whitelist: &HashSet<String>, instance_id: &str) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    let id = instance_id.trim();
    if id.is_empty() {
        return true;
    }
    whitelist.contains(id)
}

fn ensure_placeholder(
    hosts: &mut HashMap<String, HostRecord>,
    id: &str,
    alias: &str,
    now: DateTime<Utc>,
) {
    let record = hosts
        .entry(id.to_string())
        .or_insert_with(|| HostRecord::placeholder(id, now));
    record.topic_id = id.to_string();
    record.instance_id = id.to_string();
    record.alias = alias.to_string();
    if record.status == AgentStatus::Unknown {
        record.status = AgentStatus::Offline;
    }
}

fn rename_host(hosts: &mut HashMap<String, HostRecord>, old_id: &str, new_id: &str, alias: &str) {
    if old_id == new_id {
        return;
    }
    let Some(mut record) = hosts.remove(old_id) else {
        return;
    };
    record.topic_id = new_id.to_string();
    record.instance_id = new_id.to_string();
    record.alias = alias.to_string();
    hosts.insert(new_id.to_string(), record);
}

fn prune_by_whitelist(inner: &mut FleetInner) {
    if inner.whitelist.is_empty() {
        return;
    }
    let whitelist = &inner.whitelist;
    inner.hosts.retain(|_, record| {
        let id = record.instance_id.trim();
        id.is_empty() || whitelist.contains(id)
    });
}

pub fn spawn_sweeper(
    registry: Arc<FleetRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    registry.sweep(Utc::now());
                }
            }
        }
    })
}
