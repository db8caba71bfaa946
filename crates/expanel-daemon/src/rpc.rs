use crate::bridge::Bridge;
use expanel_core::wire::{self, RpcRequest};
use rumqttc::{AsyncClient, QoS};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected, dropped publish to '{topic}'")]
    NotConnected { topic: String },
    #[error("envelope encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] rumqttc::ClientError),
}

/// Outbound surface of the session: plain publishes plus fire-and-forget
/// request envelopes. There is no outbound queue; anything attempted while
/// the session is down is dropped and reported.
pub struct Publisher {
    slot: Mutex<Option<AsyncClient>>,
    connected: AtomicBool,
    bridge: Arc<Bridge>,
}

impl Publisher {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self {
            slot: Mutex::new(None),
            connected: AtomicBool::new(false),
            bridge,
        }
    }

    /// Installs the client for the current connection epoch. The session is
    /// not considered connected until the broker acknowledges.
    pub fn attach(&self, client: AsyncClient) {
        *self.slot.lock().unwrap() = Some(client);
    }

    pub fn detach(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.slot.lock().unwrap() = None;
    }

    /// Returns the previous value so the session can tell a lost connection
    /// from an attempt that never got acknowledged.
    pub fn mark_connected(&self, connected: bool) -> bool {
        self.connected.swap(connected, Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        let client = self.slot.lock().unwrap().clone();
        let client = match client {
            Some(client) if self.is_connected() => client,
            _ => {
                self.bridge
                    .notice(format!("publish dropped, session offline: {topic}"));
                return Err(PublishError::NotConnected {
                    topic: topic.to_string(),
                });
            }
        };
        match client.publish(topic, qos, retain, payload).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.bridge
                    .notice(format!("publish to '{topic}' failed: {err}"));
                Err(err.into())
            }
        }
    }

    /// Publishes a `{reply_to, corr, params}` envelope to the request root.
    /// The reply, if any, arrives as an ordinary message on `reply_to`;
    /// nothing here correlates it.
    pub async fn request(
        &self,
        action: &str,
        reply_to: &str,
        params: Value,
    ) -> Result<(), PublishError> {
        let envelope = RpcRequest {
            reply_to: reply_to.to_string(),
            corr: Uuid::new_v4().to_string(),
            params,
        };
        let payload = serde_json::to_vec(&envelope)?;
        let topic = format!("{}/{action}", wire::RPC_ROOT);
        debug!(event = "rpc_request", action, reply_to, corr = %envelope.corr);
        self.publish(&topic, payload, QoS::AtLeastOnce, false).await
    }
}
