//! End-to-end pipeline tests against a scripted actuator: the global
//! single-bet invariant under concurrency, refund-vs-blackbox behavior, and
//! terminal event accounting.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use stakepilot::bankroll::MoneyManager;
use stakepilot::blackbox::Blackbox;
use stakepilot::browser::{ActuatorError, BetActuator};
use stakepilot::config::{LedgerConfig, StakingConfig};
use stakepilot::engine::ExecutionEngine;
use stakepilot::events::{AgentEvent, EventBus};
use stakepilot::ledger::BankrollLedger;
use stakepilot::models::{BetReceipt, BetSignal};
use stakepilot::state::{AgentState, AgentStateMachine};

/// Actuator stub with a configurable delay inside place_bet so concurrent
/// signals genuinely overlap.
struct SlowActuator {
    odds: f64,
    place_delay: Duration,
    place_calls: Mutex<u32>,
}

impl SlowActuator {
    fn new(odds: f64, place_delay: Duration) -> Self {
        Self {
            odds,
            place_delay,
            place_calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl BetActuator for SlowActuator {
    async fn ensure_logged_in(&self) -> Result<(), ActuatorError> {
        Ok(())
    }

    async fn check_open_bet(&self) -> Result<bool, ActuatorError> {
        Ok(false)
    }

    async fn navigate_to_match(&self, _teams: &str) -> Result<(), ActuatorError> {
        Ok(())
    }

    async fn find_odds(&self, _market: &str) -> Result<f64, ActuatorError> {
        Ok(self.odds)
    }

    async fn place_bet(&self, _stake: f64) -> Result<BetReceipt, ActuatorError> {
        *self.place_calls.lock() += 1;
        tokio::time::sleep(self.place_delay).await;
        Ok(BetReceipt::default())
    }

    async fn get_balance(&self) -> Result<Option<f64>, ActuatorError> {
        Ok(None)
    }
}

struct TestRig {
    engine: Arc<ExecutionEngine>,
    money: Arc<MoneyManager>,
    events: EventBus,
    _dir: tempfile::TempDir,
}

fn rig(balance: f64, actuator: Arc<dyn BetActuator>) -> TestRig {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("bankroll.db");
    let ledger = BankrollLedger::open(db_path.to_str().unwrap(), balance).unwrap();
    let money = Arc::new(MoneyManager::new(
        ledger,
        StakingConfig::default(),
        &LedgerConfig::default(),
    ));
    let state = Arc::new(AgentStateMachine::new());
    state.transition(AgentState::Idle);
    state.transition(AgentState::Listening);
    let events = EventBus::new(64);
    let blackbox = Blackbox::new(dir.path().join("blackbox.jsonl"));
    let engine = Arc::new(ExecutionEngine::new(
        money.clone(),
        actuator,
        state,
        events.clone(),
        blackbox,
    ));
    TestRig {
        engine,
        money,
        events,
        _dir: dir,
    }
}

fn signal(n: usize) -> BetSignal {
    BetSignal::new(format!("Team {n} vs Team {}", n + 1), "Match Winner")
}

#[tokio::test]
async fn concurrent_signals_never_create_more_than_one_pending_entry() {
    let actuator = Arc::new(SlowActuator::new(2.0, Duration::from_millis(150)));
    let rig = rig(1_000.0, actuator.clone());

    // Sampler observes the pending count while the bets race.
    let sampler_money = rig.money.clone();
    let max_pending = Arc::new(Mutex::new(0usize));
    let sampler_max = max_pending.clone();
    let sampler = tokio::spawn(async move {
        for _ in 0..60 {
            let count = sampler_money.pending().map(|p| p.len()).unwrap_or(0);
            {
                let mut max = sampler_max.lock();
                if count > *max {
                    *max = count;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let mut handles = Vec::new();
    for n in 0..6 {
        let engine = rig.engine.clone();
        handles.push(tokio::spawn(
            async move { engine.process_signal(signal(n)).await },
        ));
    }

    let mut successes = 0;
    let mut already_open = 0;
    for handle in handles {
        match handle.await.unwrap() {
            AgentEvent::BetSuccess { .. } => successes += 1,
            AgentEvent::BetFailed { reason, .. } => {
                assert_eq!(reason, "Bet already open");
                already_open += 1;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    sampler.await.unwrap();

    assert_eq!(successes, 1, "exactly one signal may win");
    assert_eq!(already_open, 5);
    assert_eq!(*actuator.place_calls.lock(), 1);
    assert!(*max_pending.lock() <= 1, "pending entries exceeded one");
    assert_eq!(rig.money.pending().unwrap().len(), 1);
}

#[tokio::test]
async fn sequential_signals_blocked_while_first_is_unsettled() {
    let actuator = Arc::new(SlowActuator::new(1.8, Duration::from_millis(1)));
    let rig = rig(500.0, actuator);

    let first = rig.engine.process_signal(signal(0)).await;
    assert!(matches!(first, AgentEvent::BetSuccess { .. }));

    // The winner's reservation is still pending; the next signal must lose
    // at the precheck, not at the actuator.
    let second = rig.engine.process_signal(signal(1)).await;
    assert!(matches!(
        second,
        AgentEvent::BetFailed { ref reason, .. } if reason == "Bet already open"
    ));
}

#[tokio::test]
async fn settlement_reopens_the_pipeline() {
    let actuator = Arc::new(SlowActuator::new(1.8, Duration::from_millis(1)));
    let rig = rig(500.0, actuator);

    let first = rig.engine.process_signal(signal(0)).await;
    let AgentEvent::BetSuccess { tx_id, stake, .. } = first else {
        panic!("expected success");
    };

    // Settle the open bet as a loss, then the next signal goes through.
    rig.money.loss(&tx_id).unwrap();
    let balance_after_loss = rig.money.bankroll().unwrap();
    assert!((balance_after_loss - (500.0 - stake)).abs() < 1e-6);

    let second = rig.engine.process_signal(signal(1)).await;
    assert!(matches!(second, AgentEvent::BetSuccess { .. }));
}

#[tokio::test]
async fn every_signal_yields_exactly_one_terminal_event() {
    let actuator = Arc::new(SlowActuator::new(2.2, Duration::from_millis(10)));
    let rig = rig(1_000.0, actuator);
    let mut rx = rig.events.subscribe("counter");

    let mut handles = Vec::new();
    for n in 0..4 {
        let engine = rig.engine.clone();
        handles.push(tokio::spawn(
            async move { engine.process_signal(signal(n)).await },
        ));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut terminal = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(
            event,
            AgentEvent::BetSuccess { .. } | AgentEvent::BetFailed { .. }
        ) {
            terminal += 1;
        }
    }
    assert_eq!(terminal, 4);
}
