//! In-process supervision.
//!
//! Three layers: the session guardian health-checks the browser on a fixed
//! interval and triggers recovery after consecutive failures; the worker
//! watchdog guards the guardian's own substrate by respawning the browser
//! queue worker if it dies; and the liveness pulse writes a timestamp file
//! for the process-external supervisor, which force-restarts the whole tree
//! when the pulse goes stale. That is the one failure mode no in-process
//! watchdog can catch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::browser::Actuator;
use crate::config::BrowserConfig;
use crate::state::{AgentState, AgentStateMachine};

/// Health-check loop: after `health_failure_threshold` consecutive failures,
/// drive the agent through RECOVERING and ask the actuator to recover.
pub fn spawn_session_guardian(
    actuator: Arc<Actuator>,
    state: Arc<AgentStateMachine>,
    cfg: &BrowserConfig,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(cfg.health_interval_secs.max(1));
    let threshold = cfg.health_failure_threshold.max(1);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_failures: u32 = 0;

        loop {
            ticker.tick().await;
            if state.current() == AgentState::Shutdown {
                break;
            }

            match actuator.health_check().await {
                Ok(()) => {
                    if consecutive_failures > 0 {
                        info!(consecutive_failures, "session recovered on its own");
                    }
                    consecutive_failures = 0;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(
                        consecutive_failures,
                        threshold,
                        error = %err,
                        "session health check failed"
                    );
                }
            }

            if consecutive_failures < threshold {
                continue;
            }

            consecutive_failures = 0;
            let resumed = state.current();
            if !state.transition(AgentState::Recovering) {
                state.force_state(AgentState::Recovering);
            }

            match actuator.recover().await {
                Ok(()) => {
                    info!("session recovery succeeded");
                    if !state.transition(AgentState::Listening)
                        && resumed != AgentState::Shutdown
                    {
                        state.force_state(resumed);
                    }
                }
                Err(err) => {
                    error!(error = %err, "session recovery failed, will retry next interval");
                    state.transition(AgentState::Error);
                }
            }
        }
    })
}

/// Second-order supervisor: the browser worker thread itself may die; this
/// loop notices and respawns it.
pub fn spawn_worker_watchdog(actuator: Arc<Actuator>, state: Arc<AgentStateMachine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            if state.current() == AgentState::Shutdown {
                break;
            }
            if !actuator.worker_alive() {
                warn!("browser worker found dead, respawning");
                actuator.ensure_worker();
            }
        }
    })
}

/// Periodically write the current unix timestamp for the external process
/// supervisor. Staleness beyond its threshold means total in-process
/// deadlock, and it kills and restarts the whole tree.
pub fn spawn_liveness_pulse(path: PathBuf, interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs.max(1));
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let stamp = chrono::Utc::now().timestamp().to_string();
            if let Err(err) = std::fs::write(&path, &stamp) {
                error!(error = %err, path = %path.display(), "liveness pulse write failed");
            } else {
                debug!(stamp, "liveness pulse");
            }
        }
    })
}
