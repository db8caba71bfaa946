use crate::ModemLink;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Backend liveness topic; outside the `<base>` hierarchy.
pub const BACKEND_STATUS_TOPIC: &str = "panelexemys/status";
/// Fleet membership authority.
pub const WHITELIST_TOPIC: &str = "charito/whitelist/instances";
/// Per-host charo-daemon publications (N instances).
pub const CHARO_STATUS_FILTER: &str = "charodaemon/host/+/status";
pub const CHARO_METRICS_FILTER: &str = "charodaemon/host/+/metrics";
const CHARO_HOST_PREFIX: &str = "charodaemon/host/";
/// Root path for outbound request envelopes.
pub const RPC_ROOT: &str = "app/req";

pub const RPC_GLOBAL_STATUS: &str = "get_global_status";
pub const RPC_MODEM_STATUS: &str = "get_modem_status";
pub const RPC_EMAIL_TEST: &str = "send_email_test";

/// Topics published by the backend under one base path.
#[derive(Debug, Clone)]
pub struct TopicSet {
    pub modem: String,
    pub grado: String,
    pub grds: String,
    pub email_state: String,
    pub proxmox_state: String,
    pub email_events: String,
}

impl TopicSet {
    pub fn new(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            modem: format!("{base}/estado/conexion_modem"),
            grado: format!("{base}/estado/grado"),
            grds: format!("{base}/estado/grds"),
            email_state: format!("{base}/estado/email"),
            proxmox_state: format!("{base}/estado/proxmox"),
            email_events: format!("{base}/eventos/email"),
        }
    }

    /// Full subscription set, re-established on every connect.
    pub fn subscriptions(&self) -> Vec<&str> {
        vec![
            self.modem.as_str(),
            self.grado.as_str(),
            self.grds.as_str(),
            self.email_state.as_str(),
            self.proxmox_state.as_str(),
            self.email_events.as_str(),
            BACKEND_STATUS_TOPIC,
            CHARO_STATUS_FILTER,
            CHARO_METRICS_FILTER,
            WHITELIST_TOPIC,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharoTopic<'a> {
    Status(&'a str),
    Metrics(&'a str),
}

/// Matches `charodaemon/host/{id}/status|metrics` and extracts the host id.
pub fn parse_charo_topic(topic: &str) -> Option<CharoTopic<'_>> {
    let rest = topic.strip_prefix(CHARO_HOST_PREFIX)?;
    if let Some(id) = rest.strip_suffix("/status") {
        if !id.is_empty() && !id.contains('/') {
            return Some(CharoTopic::Status(id));
        }
    }
    if let Some(id) = rest.strip_suffix("/metrics") {
        if !id.is_empty() && !id.contains('/') {
            return Some(CharoTopic::Metrics(id));
        }
    }
    None
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("rpc request failed: {0}")]
    RpcFailed(String),
}

/// Outbound request envelope. The peer answers asynchronously on `reply_to`;
/// nothing here waits for or matches the reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub reply_to: String,
    pub corr: String,
    #[serde(default)]
    pub params: Value,
}

fn is_rpc(value: &Value) -> bool {
    value
        .get("type")
        .and_then(Value::as_str)
        .map(|kind| kind.eq_ignore_ascii_case("rpc"))
        .unwrap_or(false)
}

/// Extracts the connectivity percentage from either payload shape:
/// a direct `{"porcentaje": ...}` push or an rpc-wrapped
/// `{"type":"rpc","data":{"summary":{"porcentaje": ...}}}` reply.
/// A failed rpc reply surfaces its `error` text.
pub fn parse_grado(raw: &str) -> Result<Option<f64>, WireError> {
    let value: Value = serde_json::from_str(raw)?;
    if is_rpc(&value) {
        let ok = value.get("ok").and_then(Value::as_bool).unwrap_or(true);
        if !ok {
            let detail = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(WireError::RpcFailed(detail));
        }
        return Ok(value
            .pointer("/data/summary/porcentaje")
            .and_then(Value::as_f64));
    }
    Ok(value.get("porcentaje").and_then(Value::as_f64))
}

/// Modem payloads arrive as `{"estado": ...}`, an rpc wrapper around it, or
/// free text. Anything unrecognized maps to [`ModemLink::Unknown`].
pub fn parse_modem(raw: &str) -> ModemLink {
    let source = match serde_json::from_str::<Value>(raw) {
        Ok(value) => {
            let body = if is_rpc(&value) {
                value.get("data").cloned()
            } else {
                Some(value)
            };
            match body {
                Some(body) => extract_link_text(&body, raw),
                None => raw.to_string(),
            }
        }
        Err(_) => raw.to_string(),
    };
    ModemLink::from_wire(&source)
}

fn extract_link_text(body: &Value, fallback: &str) -> String {
    for key in ["estado", "state"] {
        if let Some(text) = body.get(key).and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return text.to_string();
            }
        }
    }
    fallback.to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct WhitelistPayload {
    #[serde(default)]
    pub items: Vec<WhitelistEntry>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WhitelistEntry {
    #[serde(default)]
    pub alias: String,
    #[serde(rename = "instanceId", default)]
    pub instance_id: String,
}

impl WhitelistPayload {
    pub fn parse(raw: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// `(alias, canonical id)` pairs in wire order. Entries with a blank
    /// alias are dropped; a blank instance id falls back to the alias.
    pub fn normalized(&self) -> Vec<(String, String)> {
        self.items
            .iter()
            .filter_map(|entry| {
                let alias = entry.alias.trim();
                if alias.is_empty() {
                    return None;
                }
                let id = entry.instance_id.trim();
                let id = if id.is_empty() { alias } else { id };
                Some((alias.to_string(), id.to_string()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BackendStatusPayload {
    #[serde(default = "unknown_status")]
    pub status: String,
    #[serde(default)]
    pub ts: String,
}

fn unknown_status() -> String {
    "unknown".to_string()
}

impl BackendStatusPayload {
    pub fn parse(raw: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case("online")
    }
}

/// Canonical id advertised inside a metrics blob, when present.
pub fn metrics_instance_id(metrics: &Value) -> Option<&str> {
    metrics
        .get("instanceId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

/// Per-host heartbeat timeout advertised inside a metrics blob.
pub fn metrics_timeout_seconds(metrics: &Value) -> Option<u64> {
    metrics
        .get("timeoutSeconds")
        .and_then(Value::as_u64)
        .filter(|secs| *secs > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_set_builds_from_base() {
        let topics = TopicSet::new("exemys");
        assert_eq!(topics.modem, "exemys/estado/conexion_modem");
        assert_eq!(topics.email_events, "exemys/eventos/email");
        assert_eq!(topics.subscriptions().len(), 10);
        assert!(topics.subscriptions().contains(&WHITELIST_TOPIC));
    }

    #[test]
    fn charo_topics_extract_host_id() {
        assert_eq!(
            parse_charo_topic("charodaemon/host/nodo-1/status"),
            Some(CharoTopic::Status("nodo-1"))
        );
        assert_eq!(
            parse_charo_topic("charodaemon/host/nodo-1/metrics"),
            Some(CharoTopic::Metrics("nodo-1"))
        );
        assert_eq!(parse_charo_topic("charodaemon/host//status"), None);
        assert_eq!(parse_charo_topic("charodaemon/host/a/b/status"), None);
        assert_eq!(parse_charo_topic("exemys/estado/grado"), None);
    }

    #[test]
    fn grado_direct_and_rpc_shapes() {
        assert_eq!(parse_grado(r#"{"porcentaje":58.3}"#).unwrap(), Some(58.3));
        assert_eq!(
            parse_grado(r#"{"type":"rpc","ok":true,"data":{"summary":{"porcentaje":41.0}}}"#)
                .unwrap(),
            Some(41.0)
        );
        assert_eq!(parse_grado(r#"{"ts":"..."}"#).unwrap(), None);
    }

    #[test]
    fn grado_failed_rpc_surfaces_error() {
        let err = parse_grado(r#"{"type":"rpc","ok":false,"error":"backend down"}"#).unwrap_err();
        assert!(matches!(err, WireError::RpcFailed(detail) if detail == "backend down"));
        assert!(parse_grado("not json").is_err());
    }

    #[test]
    fn modem_shapes() {
        assert_eq!(parse_modem(r#"{"estado":"abierto"}"#), ModemLink::Open);
        assert_eq!(parse_modem(r#"{"state":"cerrado"}"#), ModemLink::Closed);
        assert_eq!(
            parse_modem(r#"{"type":"rpc","data":{"estado":"abierto"}}"#),
            ModemLink::Open
        );
        assert_eq!(parse_modem("cerrado"), ModemLink::Closed);
        assert_eq!(parse_modem(r#"{"other":1}"#), ModemLink::Unknown);
    }

    #[test]
    fn whitelist_normalizes_entries() {
        let payload = WhitelistPayload::parse(
            r#"{"items":[
                {"alias":"A","instanceId":"x1"},
                {"alias":"B","instanceId":"  "},
                {"alias":"","instanceId":"x9"}
            ]}"#,
        )
        .expect("parse whitelist");
        assert_eq!(
            payload.normalized(),
            vec![
                ("A".to_string(), "x1".to_string()),
                ("B".to_string(), "B".to_string()),
            ]
        );
    }

    #[test]
    fn backend_status_defaults_and_casing() {
        let payload = BackendStatusPayload::parse(r#"{"status":"Online","ts":"t1"}"#).unwrap();
        assert!(payload.is_online());
        let payload = BackendStatusPayload::parse(r#"{}"#).unwrap();
        assert!(!payload.is_online());
        assert_eq!(payload.status, "unknown");
    }

    #[test]
    fn metrics_helpers_ignore_blank_and_zero() {
        let metrics: Value =
            serde_json::from_str(r#"{"instanceId":" x1 ","timeoutSeconds":45}"#).unwrap();
        assert_eq!(metrics_instance_id(&metrics), Some("x1"));
        assert_eq!(metrics_timeout_seconds(&metrics), Some(45));

        let metrics: Value = serde_json::from_str(r#"{"instanceId":"","timeoutSeconds":0}"#).unwrap();
        assert_eq!(metrics_instance_id(&metrics), None);
        assert_eq!(metrics_timeout_seconds(&metrics), None);
    }

    #[test]
    fn rpc_request_round_trip() {
        let request = RpcRequest {
            reply_to: "exemys/estado/grado".to_string(),
            corr: "abc-123".to_string(),
            params: serde_json::json!({"origin": "expanel"}),
        };
        let raw = serde_json::to_string(&request).unwrap();
        let back: RpcRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, request);
    }
}
