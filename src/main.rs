//! stakepilot entrypoint: wire the components together, supervise them, and
//! feed signals from stdin into the execution engine.
//!
//! The Telegram-side parser lives out of process; its hand-off format is one
//! JSON object per line: {"teams": "...", "market": "...", "raw_text": "..."}.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stakepilot::{
    bankroll::MoneyManager,
    blackbox::Blackbox,
    browser::{Actuator, BetActuator},
    config::Config,
    engine::ExecutionEngine,
    events::{AgentEvent, EventBus},
    ledger::BankrollLedger,
    locator::store::SelectorStore,
    locator::vision::{HttpVisionOracle, VisionOracle},
    models::BetSignal,
    state::{AgentState, AgentStateMachine},
    watchdog,
};

#[derive(Parser, Debug)]
#[command(name = "stakepilot", about = "Signal-driven bet execution agent")]
struct Cli {
    /// Path to the public config file (TOML).
    #[arg(short, long, env = "STAKEPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Fill bet slips but never click submit.
    #[arg(long)]
    dry_run: bool,

    /// Log filter, e.g. "info" or "stakepilot=debug".
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&cli.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(cli.config.as_deref()).context("load configuration")?;
    if cli.dry_run {
        config.browser.dry_run = true;
    }
    if config.browser.dry_run {
        warn!("dry-run mode: bets will be filled but never submitted");
    }

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.agent.data_dir).context("create data dir")?;

    let state = Arc::new(AgentStateMachine::new());
    let events = EventBus::new(config.events.queue_capacity);

    let state_events = events.clone();
    state.on_enter(move |from, to| {
        state_events.emit(AgentEvent::StateChanged { from, to });
    });

    // Terminal outcomes are observable even with no UI attached.
    let mut event_rx = events.subscribe("event_log");
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            info!(event = ?event, "agent event");
        }
    });

    let ledger = BankrollLedger::open(&config.ledger.db_path, config.ledger.starting_balance)
        .context("open bankroll ledger")?;
    let money = Arc::new(MoneyManager::new(
        ledger,
        config.staking.clone(),
        &config.ledger,
    ));
    info!(bankroll = money.bankroll().unwrap_or(0.0), "ledger ready");

    let store = Arc::new(SelectorStore::load(config.selectors.clone()).context("load selector map")?);
    let oracle: Option<Arc<dyn VisionOracle>> = if config.vision.api_key.is_some() {
        Some(Arc::new(
            HttpVisionOracle::new(config.vision.clone()).context("build vision oracle")?,
        ))
    } else {
        warn!("no vision api key configured, tier-2 healing disabled");
        None
    };

    let actuator = Arc::new(
        Actuator::new(&config, store, oracle, events.clone()).context("build actuator")?,
    );
    let blackbox = Blackbox::new(config.agent.data_dir.join("blackbox.jsonl"));
    let engine = Arc::new(ExecutionEngine::new(
        money.clone(),
        actuator.clone() as Arc<dyn BetActuator>,
        state.clone(),
        events.clone(),
        blackbox,
    ));

    state.transition(AgentState::Idle);

    let pulse = watchdog::spawn_liveness_pulse(
        config.agent.liveness_path.clone(),
        config.agent.liveness_interval_secs,
    );
    let guardian =
        watchdog::spawn_session_guardian(actuator.clone(), state.clone(), &config.browser);
    let worker_watchdog = watchdog::spawn_worker_watchdog(actuator.clone(), state.clone());

    if let Err(err) = actuator.launch().await {
        // Not fatal: the guardian keeps retrying recovery.
        warn!(error = %err, "initial browser launch failed");
    }

    state.transition(AgentState::Listening);
    info!("listening for signals on stdin (one JSON object per line)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<BetSignal>(line) {
                        Ok(signal) => {
                            engine.process_signal(signal).await;
                        }
                        Err(err) => {
                            warn!(error = %err, "malformed signal rejected");
                            events.emit(AgentEvent::BetFailed {
                                tx_id: None,
                                reason: format!("Malformed signal: {err}"),
                            });
                        }
                    }
                }
                Ok(None) => {
                    info!("signal input closed");
                    break;
                }
                Err(err) => {
                    error!(error = %err, "signal input error");
                    break;
                }
            }
        }
    }

    state.transition(AgentState::Shutdown);
    actuator.close().await;
    pulse.abort();
    guardian.abort();
    worker_watchdog.abort();
    info!("shutdown complete");
    Ok(())
}
