use chrono::Utc;
use clap::Parser;
use expanel_core::wire::{self, TopicSet};
use expanel_core::{timefmt, GrdList, HealthBand};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

mod bridge;
mod coalesce;
mod fleet;
mod netwatch;
mod route;
mod rpc;
mod session;

use bridge::{Bridge, Update};
use coalesce::Coalescer;
use fleet::FleetRegistry;
use route::Router;
use rpc::Publisher;
use session::{Session, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "expanel-daemon")]
struct Args {
    #[arg(long, default_value = "localhost")]
    broker_host: String,
    #[arg(long, default_value_t = 1883)]
    broker_port: u16,
    #[arg(long, default_value = "")]
    username: String,
    #[arg(long, default_value = "")]
    password: String,
    #[arg(long, default_value = "")]
    client_id: String,
    #[arg(long, default_value = "exemys")]
    base_topic: String,
    /// Keep-alive in seconds; 300 balances NAT timeouts against ping traffic.
    #[arg(long, default_value_t = 300)]
    keep_alive: u64,
    #[arg(long, default_value_t = 2)]
    base_backoff: u64,
    #[arg(long, default_value_t = 120)]
    max_backoff: u64,
    #[arg(long, default_value_t = 800)]
    coalesce_ms: u64,
    #[arg(long, default_value_t = 15)]
    probe_interval: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Clone, Debug)]
struct Config {
    broker_host: String,
    broker_port: u16,
    credentials: Option<(String, String)>,
    client_id: String,
    base_topic: String,
    keep_alive: Duration,
    base_backoff: Duration,
    max_backoff: Duration,
    coalesce_window: Duration,
    probe_interval: Duration,
    debug: bool,
    log_dir: String,
}

fn load_config() -> Config {
    let args = Args::parse();
    let client_id = if args.client_id.is_empty() {
        format!("expanel-{}", std::process::id())
    } else {
        args.client_id
    };
    let credentials =
        (!args.username.is_empty()).then(|| (args.username.clone(), args.password.clone()));
    let debug = args.debug || env_true("EXPANEL_DEBUG");
    Config {
        broker_host: args.broker_host,
        broker_port: args.broker_port,
        credentials,
        client_id,
        base_topic: args.base_topic,
        keep_alive: Duration::from_secs(args.keep_alive),
        base_backoff: Duration::from_secs(args.base_backoff),
        max_backoff: Duration::from_secs(args.max_backoff),
        coalesce_window: Duration::from_millis(args.coalesce_ms),
        probe_interval: Duration::from_secs(args.probe_interval),
        debug,
        log_dir: args.log_dir,
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(value.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let bridge = Arc::new(Bridge::new());
    let topics = TopicSet::new(&config.base_topic);
    let publisher = Arc::new(Publisher::new(bridge.clone()));
    let coalescer = Coalescer::new(bridge.clone(), config.coalesce_window);
    let fleet = Arc::new(FleetRegistry::new(bridge.clone()));
    let router = Router::new(
        topics.clone(),
        bridge.clone(),
        coalescer,
        fleet.clone(),
        publisher.clone(),
    );
    let session = Session::new(
        SessionConfig {
            host: config.broker_host.clone(),
            port: config.broker_port,
            client_id: config.client_id.clone(),
            credentials: config.credentials.clone(),
            keep_alive: config.keep_alive,
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
        },
        topics.clone(),
        bridge.clone(),
        publisher.clone(),
        router,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (net_tx, net_rx) = watch::channel(false);

    let mut handles: Vec<JoinHandle<()>> = vec![
        netwatch::spawn(
            config.broker_host.clone(),
            config.broker_port,
            config.probe_interval,
            net_tx,
            shutdown_rx.clone(),
        ),
        fleet::spawn_sweeper(fleet.clone(), shutdown_rx.clone()),
        spawn_observer(bridge.clone(), shutdown_rx.clone()),
        tokio::spawn(session.run(net_rx, shutdown_rx.clone())),
    ];
    #[cfg(unix)]
    handles.push(spawn_email_test_trigger(
        publisher.clone(),
        topics,
        shutdown_rx.clone(),
    ));

    info!(
        event = "daemon_start",
        host = %config.broker_host,
        port = config.broker_port,
        client_id = %config.client_id,
        base_topic = %config.base_topic
    );

    let _ = tokio::signal::ctrl_c().await;
    info!(event = "daemon_shutdown");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            warn!(event = "shutdown_timeout");
        }
    }
    info!(event = "daemon_stop");
}

/// In-process observer standing in for a UI surface: attaches late, gets the
/// cached state replayed, then follows live updates.
fn spawn_observer(bridge: Arc<Bridge>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (replay, mut rx) = bridge.subscribe();
        for update in &replay {
            log_update(update, true);
        }
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = rx.recv() => match received {
                    Ok(update) => log_update(&update, false),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "observer_lagged", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}

fn log_update(update: &Update, replayed: bool) {
    match update {
        Update::Session(state) => info!(event = "panel_session", replayed, state = %state),
        Update::Modem(link) => info!(event = "panel_modem", replayed, link = %link),
        Update::Grado(pct) => info!(
            event = "panel_grado",
            replayed,
            pct,
            band = %HealthBand::from_pct(*pct)
        ),
        Update::Grds(raw) => match serde_json::from_str::<GrdList>(raw) {
            Ok(list) => {
                let oldest = list
                    .items
                    .iter()
                    .filter_map(|item| timefmt::parse_instant(&item.last_drop))
                    .min()
                    .and_then(|instant| {
                        timefmt::since_description_at(&instant.to_rfc3339(), Utc::now())
                    });
                info!(
                    event = "panel_grds",
                    replayed,
                    disconnected = list.items.len(),
                    oldest_down = oldest.as_deref().unwrap_or("n/d")
                );
            }
            Err(err) => warn!(event = "panel_grds_invalid", error = %err),
        },
        Update::EmailState(raw) => {
            info!(event = "panel_email", replayed);
            debug!(event = "panel_email_raw", raw = %raw);
        }
        Update::ProxmoxState(raw) => {
            info!(event = "panel_proxmox", replayed);
            debug!(event = "panel_proxmox_raw", raw = %raw);
        }
        Update::EmailEvents(events) => info!(
            event = "panel_email_events",
            replayed,
            count = events.len(),
            last_ok = events.first().map(|event| event.ok).unwrap_or(false),
            last_at = events
                .first()
                .map(|event| timefmt::format_local(&event.timestamp, "n/d"))
                .unwrap_or_else(|| "n/d".to_string())
        ),
        Update::Backend { online, ts } => info!(
            event = "panel_backend",
            replayed,
            online,
            ts = %timefmt::format_local(ts, "n/d")
        ),
        Update::Fleet(agents) => info!(
            event = "panel_fleet",
            replayed,
            total = agents.len(),
            online = agents
                .iter()
                .filter(|agent| agent.status == expanel_core::AgentStatus::Online)
                .count()
        ),
        Update::Notice(message) => warn!(event = "panel_notice", message = %message),
    }
}

/// SIGUSR1 asks the backend to send a test email; the result comes back on
/// the ordinary email events subscription.
#[cfg(unix)]
fn spawn_email_test_trigger(
    publisher: Arc<Publisher>,
    topics: TopicSet,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut stream = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(event = "signal_install_failed", error = %err);
                return;
            }
        };
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = stream.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!(event = "email_test_requested");
                    let params = serde_json::json!({"origin": "expanel"});
                    if let Err(err) = publisher
                        .request(wire::RPC_EMAIL_TEST, &topics.email_events, params)
                        .await
                    {
                        warn!(event = "email_test_failed", error = %err);
                    }
                }
            }
        }
    })
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("EXPANEL_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(&config.log_dir, &config.client_id) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || LogTee::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct LogTee {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl LogTee {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, client_id: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("expanel-{client_id}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
