use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Periodically probes broker reachability and publishes up/down transitions
/// on the watch channel. The session controller reconnects immediately on an
/// up edge and force-disconnects on a down edge.
pub fn spawn(
    host: String,
    port: u16,
    interval: Duration,
    tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let up = probe(&host, port).await;
                    let flipped = tx.send_if_modified(|current| {
                        if *current != up {
                            *current = up;
                            true
                        } else {
                            false
                        }
                    });
                    if flipped {
                        info!(event = "network_transition", up);
                    } else {
                        debug!(event = "network_probe", up);
                    }
                }
            }
        }
    })
}

async fn probe(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_up_when_endpoint_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let (tx, mut rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn(
            "127.0.0.1".to_string(),
            port,
            Duration::from_millis(50),
            tx,
            shutdown_rx,
        );

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("transition within deadline")
            .expect("sender alive");
        assert!(*rx.borrow());

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stays_down_without_listener_and_stops_on_shutdown() {
        // Port 1 is reserved and virtually never listening locally.
        let (tx, rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn(
            "127.0.0.1".to_string(),
            1,
            Duration::from_millis(50),
            tx,
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!*rx.borrow());

        let _ = shutdown_tx.send(true);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("prompt shutdown")
            .expect("task join");
    }
}
