use crate::bridge::{Bridge, Update};
use crate::route::Router;
use crate::rpc::Publisher;
use expanel_core::wire::TopicSet;
use expanel_core::SessionState;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Explicit session configuration; handed to the controller at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

/// Delay between failed attempts: starts at `base`, doubles per failure,
/// capped at `max`. Reset on every acknowledged connect and on every
/// network-up edge (a fresh epoch builds a fresh policy).
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Owns the broker session: the state machine, the reconnect loop and the
/// subscription set. All transitions flow to observers through the bridge.
pub struct Session {
    config: SessionConfig,
    topics: TopicSet,
    bridge: Arc<Bridge>,
    publisher: Arc<Publisher>,
    router: Router,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        topics: TopicSet,
        bridge: Arc<Bridge>,
        publisher: Arc<Publisher>,
        router: Router,
    ) -> Self {
        Self {
            config,
            topics,
            bridge,
            publisher,
            router,
        }
    }

    pub async fn run(
        self,
        mut net: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        'epoch: loop {
            // Rest in Disconnected until the network is reachable.
            while !*net.borrow() {
                self.set_state(SessionState::Disconnected);
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            self.finish(None).await;
                            return;
                        }
                    }
                    changed = net.changed() => {
                        if changed.is_err() {
                            self.finish(None).await;
                            return;
                        }
                    }
                }
            }

            self.set_state(SessionState::Connecting);
            info!(
                event = "session_connect",
                host = %self.config.host,
                port = self.config.port,
                client_id = %self.config.client_id
            );
            let (client, mut eventloop) = self.make_client();
            self.publisher.attach(client.clone());
            let mut policy =
                ReconnectPolicy::new(self.config.base_backoff, self.config.max_backoff);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            self.finish(Some(&client)).await;
                            return;
                        }
                    }
                    changed = net.changed() => {
                        if changed.is_err() {
                            self.finish(Some(&client)).await;
                            return;
                        }
                        if !*net.borrow() {
                            info!(event = "session_network_lost");
                            self.force_disconnect(&client).await;
                            continue 'epoch;
                        }
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            let reconnect = self.publisher.mark_connected(true);
                            policy.reset();
                            self.set_state(SessionState::Connected);
                            info!(event = "session_connected", reconnect);
                            self.establish_subscriptions(&client).await;
                            self.router.warm_caches().await;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.router.dispatch(&publish.topic, &publish.payload).await;
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            if self.publisher.mark_connected(false) {
                                self.set_state(SessionState::Retrying);
                                self.bridge.notice("broker closed the session".to_string());
                                warn!(event = "session_broker_disconnect");
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            let was_connected = self.publisher.mark_connected(false);
                            if was_connected {
                                policy.reset();
                                self.set_state(SessionState::Retrying);
                                self.bridge.notice(format!("connection lost: {err}"));
                                warn!(event = "session_lost", error = %err);
                            } else {
                                self.set_state(SessionState::Error);
                                self.bridge.notice(format!("connect failed: {err}"));
                                warn!(event = "session_connect_failed", error = %err);
                            }

                            let delay = policy.next_delay();
                            debug!(event = "session_backoff", millis = delay.as_millis() as u64);
                            tokio::select! {
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow() {
                                        self.finish(Some(&client)).await;
                                        return;
                                    }
                                }
                                changed = net.changed() => {
                                    if changed.is_err() {
                                        self.finish(Some(&client)).await;
                                        return;
                                    }
                                    if !*net.borrow() {
                                        info!(event = "session_network_lost");
                                        self.force_disconnect(&client).await;
                                        continue 'epoch;
                                    }
                                }
                                _ = sleep(delay) => {
                                    self.set_state(SessionState::Connecting);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn make_client(&self) -> (AsyncClient, EventLoop) {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &self.config.credentials {
            options.set_credentials(username.clone(), password.clone());
        }
        AsyncClient::new(options, 16)
    }

    /// Subscribing to an already-subscribed topic is a no-op at the broker,
    /// so the full set is re-issued on every acknowledged connect.
    async fn establish_subscriptions(&self, client: &AsyncClient) {
        for topic in self.topics.subscriptions() {
            if let Err(err) = client.subscribe(topic, QoS::AtLeastOnce).await {
                self.bridge
                    .notice(format!("subscribe failed for '{topic}': {err}"));
                warn!(event = "subscribe_failed", topic, error = %err);
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        if self.bridge.session_state() != state {
            self.bridge.publish(Update::Session(state));
        }
    }

    async fn force_disconnect(&self, client: &AsyncClient) {
        self.publisher.detach();
        let _ = client.disconnect().await;
        self.set_state(SessionState::Disconnected);
    }

    async fn finish(&self, client: Option<&AsyncClient>) {
        self.publisher.detach();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        self.set_state(SessionState::Disconnected);
        info!(event = "session_stop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalesce::Coalescer;
    use crate::fleet::FleetRegistry;

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_secs(2), Duration::from_secs(120));
        let delays: Vec<u64> = (0..8).map(|_| policy.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 64, 120, 120]);
    }

    #[test]
    fn backoff_resets_to_base() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_secs(2), Duration::from_secs(120));
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.next_delay(), Duration::from_secs(2));
    }

    fn test_session(bridge: Arc<Bridge>, base_backoff: Duration) -> Session {
        let topics = TopicSet::new("exemys");
        let publisher = Arc::new(Publisher::new(bridge.clone()));
        let coalescer = Coalescer::new(bridge.clone(), Duration::from_millis(10));
        let fleet = Arc::new(FleetRegistry::new(bridge.clone()));
        let router = Router::new(
            topics.clone(),
            bridge.clone(),
            coalescer,
            fleet,
            publisher.clone(),
        );
        Session::new(
            SessionConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                client_id: "expanel-test".to_string(),
                credentials: None,
                keep_alive: Duration::from_secs(30),
                base_backoff,
                max_backoff: Duration::from_secs(1),
            },
            topics,
            bridge,
            publisher,
            router,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rests_disconnected_and_stops_on_shutdown() {
        let bridge = Arc::new(Bridge::new());
        let session = test_session(bridge.clone(), Duration::from_millis(10));
        let (_net_tx, net_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(session.run(net_rx, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bridge.session_state(), SessionState::Disconnected);

        let _ = shutdown_tx.send(true);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("session stops promptly")
            .expect("task join");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_connects_back_off_and_cancel_mid_sleep() {
        let bridge = Arc::new(Bridge::new());
        // A long base backoff: the shutdown below lands inside the sleep.
        let session = test_session(bridge.clone(), Duration::from_secs(30));
        let (_, mut rx) = bridge.subscribe();
        let (_net_tx, net_rx) = watch::channel(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(session.run(net_rx, shutdown_rx));

        // Nothing listens on port 1, so the attempt fails into Error.
        let mut saw_error = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(Update::Session(SessionState::Error))) => {
                    saw_error = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_error, "connect failure reaches observers");

        let _ = shutdown_tx.send(true);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("backoff sleep is cancellable")
            .expect("task join");
        assert_eq!(bridge.session_state(), SessionState::Disconnected);
    }
}
