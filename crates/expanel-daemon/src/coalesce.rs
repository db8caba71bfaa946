use crate::bridge::{Bridge, Update};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Pending {
    grado: Option<f64>,
    grds: Option<String>,
}

struct Inner {
    bridge: Arc<Bridge>,
    window: Duration,
    pending: Mutex<Pending>,
    flush_scheduled: AtomicBool,
}

/// Debounces the bursty channels: each offer overwrites the pending slot and
/// at most one flush timer is outstanding across all channels. The flush
/// delivers only the final value of the window. The replay cache is updated
/// on offer, so late observers never wait out the window.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<Inner>,
}

impl Coalescer {
    pub fn new(bridge: Arc<Bridge>, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                bridge,
                window,
                pending: Mutex::new(Pending::default()),
                flush_scheduled: AtomicBool::new(false),
            }),
        }
    }

    pub fn offer_grado(&self, pct: f64) {
        self.inner.bridge.remember_only(&Update::Grado(pct));
        self.inner.pending.lock().unwrap().grado = Some(pct);
        self.schedule();
    }

    pub fn offer_grds(&self, raw: String) {
        self.inner.bridge.remember_only(&Update::Grds(raw.clone()));
        self.inner.pending.lock().unwrap().grds = Some(raw);
        self.schedule();
    }

    fn schedule(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            // Re-arm before draining so a value offered mid-flush schedules
            // a fresh window instead of being lost.
            inner.flush_scheduled.store(false, Ordering::SeqCst);
            let taken = std::mem::take(&mut *inner.pending.lock().unwrap());
            if let Some(pct) = taken.grado {
                inner.bridge.publish(Update::Grado(pct));
            }
            if let Some(raw) = taken.grds {
                inner.bridge.publish(Update::Grds(raw));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<Update>) -> Vec<Update> {
        let mut seen = Vec::new();
        while let Ok(update) = rx.try_recv() {
            seen.push(update);
        }
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_collapses_to_final_value() {
        let bridge = Arc::new(Bridge::new());
        let coalescer = Coalescer::new(bridge.clone(), Duration::from_millis(40));
        let (_, mut rx) = bridge.subscribe();

        coalescer.offer_grado(10.0);
        coalescer.offer_grado(20.0);
        coalescer.offer_grado(30.0);
        sleep(Duration::from_millis(120)).await;

        let grados: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|update| matches!(update, Update::Grado(_)))
            .collect();
        assert_eq!(grados, vec![Update::Grado(30.0)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn channels_share_one_flush_window() {
        let bridge = Arc::new(Bridge::new());
        let coalescer = Coalescer::new(bridge.clone(), Duration::from_millis(40));
        let (_, mut rx) = bridge.subscribe();

        coalescer.offer_grado(55.0);
        coalescer.offer_grds(r#"{"items":[]}"#.to_string());
        sleep(Duration::from_millis(120)).await;

        let seen = drain(&mut rx);
        assert!(seen.contains(&Update::Grado(55.0)));
        assert!(seen.contains(&Update::Grds(r#"{"items":[]}"#.to_string())));
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_sees_pending_value_before_flush() {
        let bridge = Arc::new(Bridge::new());
        let coalescer = Coalescer::new(bridge.clone(), Duration::from_secs(30));

        coalescer.offer_grado(77.0);
        let (replay, _rx) = bridge.subscribe();
        assert!(replay.contains(&Update::Grado(77.0)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn value_offered_after_flush_gets_its_own_window() {
        let bridge = Arc::new(Bridge::new());
        let coalescer = Coalescer::new(bridge.clone(), Duration::from_millis(30));
        let (_, mut rx) = bridge.subscribe();

        coalescer.offer_grado(1.0);
        sleep(Duration::from_millis(90)).await;
        coalescer.offer_grado(2.0);
        sleep(Duration::from_millis(90)).await;

        let grados: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|update| matches!(update, Update::Grado(_)))
            .collect();
        assert_eq!(grados, vec![Update::Grado(1.0), Update::Grado(2.0)]);

        let result = timeout(Duration::from_millis(60), rx.recv()).await;
        assert!(result.is_err(), "no further flush expected");
    }
}
