//! kubefreezer — freeze-window admission gate.
//!
//! Single binary: wires the policy state, spawns the config watcher over
//! the mounted config objects, and serves the admission webhook.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use kubefreezer::clock::{Clock, SystemClock};
use kubefreezer::config::ConfigCache;
use kubefreezer::exemptions::ExemptionStore;
use kubefreezer::freeze::engine::ScheduleEngine;
use kubefreezer::history::{HistoryRecorder, DEFAULT_CAPACITY};
use kubefreezer::logging;
use kubefreezer::policy::PolicyEvaluator;
use kubefreezer::server::{self, AppState};
use kubefreezer::watcher::{ConfigWatcher, MountedDirStream};

/// How often the mounted config objects are re-read.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How often expired exemptions are swept.
const EXEMPTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Process settings, read once from the environment.
#[derive(Debug, Clone)]
struct Settings {
    listen_addr: String,
    config_dir: PathBuf,
    schedules_dir: PathBuf,
    history_dir: PathBuf,
    eval_timeout: Duration,
    history_capacity: usize,
    log_dir: Option<PathBuf>,
}

impl Settings {
    fn from_env() -> Result<Self> {
        let eval_timeout_ms: u64 = env_or("KUBEFREEZER_EVAL_TIMEOUT_MS", "500")
            .parse()
            .context("KUBEFREEZER_EVAL_TIMEOUT_MS must be an integer")?;
        let history_capacity: usize =
            env_or("KUBEFREEZER_HISTORY_CAPACITY", &DEFAULT_CAPACITY.to_string())
                .parse()
                .context("KUBEFREEZER_HISTORY_CAPACITY must be an integer")?;

        Ok(Self {
            listen_addr: env_or("KUBEFREEZER_LISTEN_ADDR", "0.0.0.0:8443"),
            config_dir: env_or("KUBEFREEZER_CONFIG_DIR", "/etc/kubefreezer/config").into(),
            schedules_dir: env_or("KUBEFREEZER_SCHEDULES_DIR", "/etc/kubefreezer/schedules")
                .into(),
            history_dir: env_or("KUBEFREEZER_HISTORY_DIR", "/etc/kubefreezer/history").into(),
            eval_timeout: Duration::from_millis(eval_timeout_ms),
            history_capacity,
            log_dir: std::env::var("KUBEFREEZER_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env()?;
    let _logging = logging::init(settings.log_dir.as_deref())?;
    info!("kubefreezer starting");

    // Shared policy state.
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let history = Arc::new(HistoryRecorder::new(settings.history_capacity));
    let cache = Arc::new(ConfigCache::default());
    let engine = Arc::new(ScheduleEngine::new());
    let exemptions = Arc::new(ExemptionStore::new(Arc::clone(&history)));

    // Config watcher over the mounted config objects. The webhook reports
    // unready until the first policy payload has been applied.
    let watcher = ConfigWatcher::new(
        Arc::clone(&cache),
        Arc::clone(&engine),
        Arc::clone(&history),
        Arc::clone(&clock),
    );
    let ready = watcher.ready_flag();
    let stream = MountedDirStream::new(
        &settings.config_dir,
        &settings.schedules_dir,
        &settings.history_dir,
        CONFIG_POLL_INTERVAL,
    );
    tokio::spawn(watcher.run(stream));

    // Background sweep keeps the exemption store from accumulating expired
    // records between queries.
    {
        let exemptions = Arc::clone(&exemptions);
        let clock = Arc::clone(&clock);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EXEMPTION_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let removed = exemptions.sweep_expired(clock.now());
                if removed > 0 {
                    info!(removed, "swept expired exemptions");
                }
            }
        });
    }

    let evaluator = Arc::new(PolicyEvaluator::new(
        cache,
        engine,
        exemptions,
        history,
        clock,
    ));
    let state = AppState {
        evaluator,
        ready,
        eval_timeout: settings.eval_timeout,
    };

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen_addr))?;
    info!(addr = %settings.listen_addr, "webhook listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("webhook server failed")?;

    info!("kubefreezer shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("received shutdown signal");
}
