use expanel_core::{EmailEvent, FleetAgentView, ModemLink, SessionState};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

pub const EMAIL_EVENT_BUFFER_LIMIT: usize = 50;
const CHANNEL_CAPACITY: usize = 256;

/// One reconciled state delivery to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Session(SessionState),
    Modem(ModemLink),
    Grado(f64),
    /// Raw grds JSON, passed through as published.
    Grds(String),
    EmailState(String),
    ProxmoxState(String),
    /// Newest-first snapshot of the bounded email event buffer.
    EmailEvents(Vec<EmailEvent>),
    Backend { online: bool, ts: String },
    Fleet(Vec<FleetAgentView>),
    /// Non-fatal error text; delivered but never cached for replay.
    Notice(String),
}

#[derive(Default)]
struct LastKnown {
    session: SessionState,
    modem: Option<ModemLink>,
    grado: Option<f64>,
    grds: Option<String>,
    email_state: Option<String>,
    proxmox_state: Option<String>,
    backend: Option<(bool, String)>,
    fleet: Option<Vec<FleetAgentView>>,
}

/// In-process fan-out of reconciled state. Late subscribers get the last
/// known value of every channel replayed immediately on attach.
pub struct Bridge {
    tx: broadcast::Sender<Update>,
    last: Mutex<LastKnown>,
    email_events: Mutex<VecDeque<EmailEvent>>,
}

impl Bridge {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            last: Mutex::new(LastKnown::default()),
            email_events: Mutex::new(VecDeque::new()),
        }
    }

    /// Fan-out plus opportunistic last-known capture.
    pub fn publish(&self, update: Update) {
        self.remember(&update);
        let _ = self.tx.send(update);
    }

    /// Captures a value for replay without delivering it. The coalescer uses
    /// this so replay stays immediate while delivery is debounced.
    pub fn remember_only(&self, update: &Update) {
        self.remember(update);
    }

    pub fn notice(&self, message: impl Into<String>) {
        let _ = self.tx.send(Update::Notice(message.into()));
    }

    pub fn push_email_event(&self, event: EmailEvent) {
        let snapshot: Vec<EmailEvent> = {
            let mut events = self.email_events.lock().unwrap();
            events.push_front(event);
            events.truncate(EMAIL_EVENT_BUFFER_LIMIT);
            events.iter().cloned().collect()
        };
        let _ = self.tx.send(Update::EmailEvents(snapshot));
    }

    /// The backend went offline: everything it sourced is stale and must not
    /// be replayed to late observers.
    pub fn invalidate_backend_channels(&self) {
        let mut last = self.last.lock().unwrap();
        last.modem = None;
        last.grado = None;
        last.grds = None;
        last.email_state = None;
        last.proxmox_state = None;
    }

    pub fn session_state(&self) -> SessionState {
        self.last.lock().unwrap().session
    }

    /// Attaches an observer: returns the replay of every cached channel plus
    /// the live receiver. The receiver is created first so nothing published
    /// between replay and the first `recv` is lost.
    pub fn subscribe(&self) -> (Vec<Update>, broadcast::Receiver<Update>) {
        let rx = self.tx.subscribe();
        let mut replay = Vec::new();
        {
            let last = self.last.lock().unwrap();
            replay.push(Update::Session(last.session));
            if let Some(link) = last.modem {
                replay.push(Update::Modem(link));
            }
            if let Some(pct) = last.grado {
                replay.push(Update::Grado(pct));
            }
            if let Some(raw) = &last.grds {
                replay.push(Update::Grds(raw.clone()));
            }
            if let Some(raw) = &last.email_state {
                replay.push(Update::EmailState(raw.clone()));
            }
            if let Some(raw) = &last.proxmox_state {
                replay.push(Update::ProxmoxState(raw.clone()));
            }
            if let Some((online, ts)) = &last.backend {
                replay.push(Update::Backend {
                    online: *online,
                    ts: ts.clone(),
                });
            }
            if let Some(agents) = &last.fleet {
                replay.push(Update::Fleet(agents.clone()));
            }
        }
        {
            let events = self.email_events.lock().unwrap();
            if !events.is_empty() {
                replay.push(Update::EmailEvents(events.iter().cloned().collect()));
            }
        }
        (replay, rx)
    }

    fn remember(&self, update: &Update) {
        let mut last = self.last.lock().unwrap();
        match update {
            Update::Session(state) => last.session = *state,
            Update::Modem(link) => last.modem = Some(*link),
            Update::Grado(pct) => last.grado = Some(*pct),
            Update::Grds(raw) => last.grds = Some(raw.clone()),
            Update::EmailState(raw) => last.email_state = Some(raw.clone()),
            Update::ProxmoxState(raw) => last.proxmox_state = Some(raw.clone()),
            Update::Backend { online, ts } => last.backend = Some((*online, ts.clone())),
            Update::Fleet(agents) => last.fleet = Some(agents.clone()),
            Update::EmailEvents(_) | Update::Notice(_) => {}
        }
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}
