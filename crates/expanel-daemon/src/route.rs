use crate::bridge::{Bridge, Update};
use crate::coalesce::Coalescer;
use crate::fleet::FleetRegistry;
use crate::rpc::Publisher;
use chrono::Utc;
use expanel_core::wire::{self, BackendStatusPayload, CharoTopic, TopicSet, WhitelistPayload};
use expanel_core::EmailEvent;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes inbound publishes to the coalescer, the fleet registry or straight
/// to the bridge. Malformed payloads are reported and dropped; no handler
/// mutates state on a parse failure.
pub struct Router {
    topics: TopicSet,
    bridge: Arc<Bridge>,
    coalescer: Coalescer,
    fleet: Arc<FleetRegistry>,
    publisher: Arc<Publisher>,
}

impl Router {
    pub fn new(
        topics: TopicSet,
        bridge: Arc<Bridge>,
        coalescer: Coalescer,
        fleet: Arc<FleetRegistry>,
        publisher: Arc<Publisher>,
    ) -> Self {
        Self {
            topics,
            bridge,
            coalescer,
            fleet,
            publisher,
        }
    }

    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        if topic == self.topics.modem {
            self.bridge.publish(Update::Modem(wire::parse_modem(&text)));
        } else if topic == self.topics.grado {
            match wire::parse_grado(&text) {
                Ok(Some(pct)) => self.coalescer.offer_grado(pct),
                Ok(None) => debug!(event = "grado_without_pct"),
                Err(err) => {
                    self.bridge.notice(format!("grado payload rejected: {err}"));
                    warn!(event = "grado_invalid", error = %err);
                }
            }
        } else if topic == self.topics.grds {
            self.coalescer.offer_grds(text.into_owned());
        } else if topic == self.topics.email_state {
            self.bridge.publish(Update::EmailState(text.into_owned()));
        } else if topic == self.topics.proxmox_state {
            self.bridge.publish(Update::ProxmoxState(text.into_owned()));
        } else if topic == self.topics.email_events {
            match serde_json::from_str::<EmailEvent>(&text) {
                Ok(event) => self.bridge.push_email_event(event),
                Err(err) => {
                    self.bridge
                        .notice(format!("email event unreadable: {err}"));
                    warn!(event = "email_event_invalid", error = %err);
                }
            }
        } else if topic == wire::BACKEND_STATUS_TOPIC {
            self.handle_backend(&text).await;
        } else if topic == wire::WHITELIST_TOPIC {
            match WhitelistPayload::parse(&text) {
                Ok(payload) => self.fleet.apply_whitelist(&payload, Utc::now()),
                Err(err) => warn!(event = "whitelist_invalid", error = %err),
            }
        } else if let Some(charo) = wire::parse_charo_topic(topic) {
            match charo {
                CharoTopic::Status(host) => self.fleet.apply_status(host, &text, Utc::now()),
                CharoTopic::Metrics(host) => match serde_json::from_str::<Value>(&text) {
                    Ok(metrics) => self.fleet.apply_metrics(Some(host), metrics, Utc::now()),
                    Err(err) => {
                        self.bridge
                            .notice(format!("metrics unreadable for '{host}': {err}"));
                        warn!(event = "metrics_invalid", host, error = %err);
                    }
                },
            }
        } else {
            debug!(event = "unhandled_topic", topic);
        }
    }

    /// Backend liveness drives the caches: coming online re-fires the warm-up
    /// requests, going offline invalidates everything the backend sourced.
    async fn handle_backend(&self, raw: &str) {
        match BackendStatusPayload::parse(raw) {
            Ok(payload) => {
                let online = payload.is_online();
                self.bridge.publish(Update::Backend {
                    online,
                    ts: payload.ts.clone(),
                });
                if online {
                    self.warm_caches().await;
                } else {
                    self.bridge.invalidate_backend_channels();
                }
            }
            Err(err) => {
                self.bridge
                    .notice(format!("backend status unreadable: {err}"));
                warn!(event = "backend_status_invalid", error = %err);
            }
        }
    }

    /// The two initial requests issued on every connect; replies arrive on the
    /// ordinary grado/modem subscriptions.
    pub async fn warm_caches(&self) {
        let requests = [
            (wire::RPC_GLOBAL_STATUS, self.topics.grado.as_str()),
            (wire::RPC_MODEM_STATUS, self.topics.modem.as_str()),
        ];
        for (action, reply_to) in requests {
            if let Err(err) = self
                .publisher
                .request(action, reply_to, serde_json::json!({}))
                .await
            {
                warn!(event = "warmup_failed", action, error = %err);
            }
        }
    }
}
