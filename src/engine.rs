//! Execution engine: one signal in, exactly one terminal event out.
//!
//! The pipeline turns an untrusted signal into a ledger reservation and an
//! irreversible browser action, with two commitment points:
//!
//! 1. the reservation: from here, failures refund;
//! 2. the submit click: from here, failures never refund, because the
//!    bookmaker may already hold the bet. Those cases go to the blackbox for
//!    manual reconciliation instead.
//!
//! The engine holds no lock across calls into the money manager or the
//! actuator; the global single-bet invariant is enforced by an in-flight
//! try-lock plus the open-bet and pending-journal prechecks.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::bankroll::MoneyManager;
use crate::blackbox::{Blackbox, BlackboxRecord};
use crate::browser::{ActuatorError, BetActuator};
use crate::events::{AgentEvent, EventBus};
use crate::models::{BetReceipt, BetSignal};
use crate::state::{AgentState, AgentStateMachine};

const REASON_BET_OPEN: &str = "Bet already open";
const REASON_MATCH_NOT_FOUND: &str = "Match not found";
const REASON_ODDS_NOT_FOUND: &str = "Odds not found";

#[derive(Debug, Error)]
enum EngineError {
    #[error("{0}")]
    Precondition(String),
    #[error("reservation failed: {0:#}")]
    Reservation(anyhow::Error),
    #[error("ledger failure: {0:#}")]
    Ledger(anyhow::Error),
    #[error("{0}")]
    Action(ActuatorError),
}

impl EngineError {
    fn reason(&self) -> String {
        self.to_string()
    }
}

/// Per-signal transaction context threaded through the pipeline so the single
/// outer failure handler can decide between refund and blackbox.
#[derive(Default)]
struct BetTxn {
    tx_id: Option<String>,
    stake: Option<f64>,
    odds: Option<f64>,
    external_balance: Option<f64>,
    /// Once true, no rollback is ever issued for this transaction.
    bet_placed: bool,
}

pub struct ExecutionEngine {
    money: Arc<MoneyManager>,
    actuator: Arc<dyn BetActuator>,
    state: Arc<AgentStateMachine>,
    events: EventBus,
    blackbox: Blackbox,
    inflight: tokio::sync::Mutex<()>,
    precheck_debounce: Duration,
}

impl ExecutionEngine {
    pub fn new(
        money: Arc<MoneyManager>,
        actuator: Arc<dyn BetActuator>,
        state: Arc<AgentStateMachine>,
        events: EventBus,
        blackbox: Blackbox,
    ) -> Self {
        Self {
            money,
            actuator,
            state,
            events,
            blackbox,
            inflight: tokio::sync::Mutex::new(()),
            precheck_debounce: Duration::from_millis(1_500),
        }
    }

    #[cfg(test)]
    fn with_debounce(mut self, debounce: Duration) -> Self {
        self.precheck_debounce = debounce;
        self
    }

    /// Process one signal end to end. Emits exactly one terminal event and
    /// returns it. Never panics the caller: every failure is converted into a
    /// `BetFailed` event.
    pub async fn process_signal(&self, signal: BetSignal) -> AgentEvent {
        // At most one in-flight bet globally. A concurrent signal loses
        // immediately instead of queueing behind a real-money action.
        let Ok(_inflight) = self.inflight.try_lock() else {
            warn!(teams = %signal.teams, "signal rejected: bet already in flight");
            let event = AgentEvent::BetFailed {
                tx_id: None,
                reason: REASON_BET_OPEN.to_string(),
            };
            self.events.emit(event.clone());
            return event;
        };

        info!(teams = %signal.teams, market = %signal.market, "processing signal");

        let mut txn = BetTxn::default();
        let event = match self.run_pipeline(&signal, &mut txn).await {
            Ok(receipt) => {
                let tx_id = txn.tx_id.clone().unwrap_or_default();
                info!(
                    tx_id = %tx_id,
                    stake = txn.stake.unwrap_or(0.0),
                    odds = txn.odds.unwrap_or(0.0),
                    confirmation = receipt.confirmation.as_deref().unwrap_or(""),
                    "bet placed"
                );
                AgentEvent::BetSuccess {
                    tx_id,
                    teams: signal.teams.clone(),
                    stake: txn.stake.unwrap_or(0.0),
                    odds: txn.odds.unwrap_or(0.0),
                }
            }
            Err(err) => self.handle_failure(&signal, &txn, err),
        };

        self.events.emit(event.clone());
        self.state.transition(AgentState::Listening);
        event
    }

    async fn run_pipeline(
        &self,
        signal: &BetSignal,
        txn: &mut BetTxn,
    ) -> Result<BetReceipt, EngineError> {
        self.state.transition(AgentState::Analyzing);

        // Step 1: authenticated session, best effort. A real login problem
        // surfaces later as a navigation or odds failure.
        if let Err(err) = self.actuator.ensure_logged_in().await {
            warn!(error = %err, "login check failed, continuing");
        }

        // Step 2: single-concurrent-bet precheck, debounced once against
        // transient failures of the open-bet probe.
        let open = match self.actuator.check_open_bet().await {
            Ok(open) => open,
            Err(err) => {
                warn!(error = %err, "open-bet check inconclusive, re-checking");
                tokio::time::sleep(self.precheck_debounce).await;
                self.actuator.check_open_bet().await.map_err(|err| {
                    EngineError::Precondition(format!("open-bet check failed: {err}"))
                })?
            }
        };
        if open {
            return Err(EngineError::Precondition(REASON_BET_OPEN.to_string()));
        }
        let pending = self.money.pending().map_err(EngineError::Ledger)?;
        if !pending.is_empty() {
            warn!(count = pending.len(), "ledger still has pending entries");
            return Err(EngineError::Precondition(REASON_BET_OPEN.to_string()));
        }

        // Step 3: navigation, fail closed.
        self.state.transition(AgentState::Navigating);
        self.actuator
            .navigate_to_match(&signal.teams)
            .await
            .map_err(|err| {
                warn!(error = %err, teams = %signal.teams, "navigation failed");
                EngineError::Precondition(REASON_MATCH_NOT_FOUND.to_string())
            })?;

        // Step 4: odds.
        let odds = self.actuator.find_odds(&signal.market).await.map_err(|err| {
            warn!(error = %err, market = %signal.market, "odds lookup failed");
            EngineError::Precondition(REASON_ODDS_NOT_FOUND.to_string())
        })?;
        if odds <= 0.0 {
            return Err(EngineError::Precondition(REASON_ODDS_NOT_FOUND.to_string()));
        }
        txn.odds = Some(odds);

        // Step 5: stake policy.
        let stake = self.money.stake_for(odds).map_err(EngineError::Ledger)?;
        if stake <= 0.0 {
            return Err(EngineError::Precondition(
                "Stake not positive".to_string(),
            ));
        }
        txn.stake = Some(stake);

        // Step 6: never reserve more than the external account can cover.
        if let Ok(Some(real)) = self.actuator.get_balance().await {
            if real > 0.0 {
                txn.external_balance = Some(real);
                if stake > real {
                    return Err(EngineError::Precondition(format!(
                        "Insufficient balance: stake {stake:.2} > real {real:.2}"
                    )));
                }
                if self.money.reconcile(real).map_err(EngineError::Ledger)? {
                    self.events.emit(AgentEvent::BalanceReconciled {
                        ledger: self.money.bankroll().unwrap_or(real),
                        real,
                    });
                }
            }
        }

        // Step 7: commitment point #1. Funds leave the internal ledger.
        let tx_id = self.money.reserve(stake).map_err(EngineError::Reservation)?;
        txn.tx_id = Some(tx_id.clone());
        info!(tx_id = %tx_id, stake, odds, "stake reserved");

        // Step 8: commitment point #2, the irreversible external action.
        self.state.transition(AgentState::Betting);
        match self.actuator.place_bet(stake).await {
            Ok(receipt) => {
                txn.bet_placed = true;
                Ok(receipt)
            }
            Err(err) => {
                if err.outcome_unknown() {
                    // The click may have landed; from here rollback is unsafe.
                    txn.bet_placed = true;
                }
                Err(EngineError::Action(err))
            }
        }
    }

    /// The single outer failure handler. Before the bet was placed a refund
    /// restores the ledger; after, the failure is recorded durably and left
    /// for manual reconciliation: never silently lost, never auto-refunded.
    fn handle_failure(&self, signal: &BetSignal, txn: &BetTxn, err: EngineError) -> AgentEvent {
        if txn.bet_placed {
            error!(
                tx_id = ?txn.tx_id,
                error = %err,
                "UNRECOVERABLE: bet may be on the external books; manual reconciliation required"
            );
            self.write_blackbox(signal, txn, &err);
            return AgentEvent::BetFailed {
                tx_id: txn.tx_id.clone(),
                reason: format!("unrecoverable: {}", err.reason()),
            };
        }

        if let Some(tx_id) = &txn.tx_id {
            match self.money.refund(tx_id) {
                Ok(()) => info!(tx_id = %tx_id, "reservation refunded"),
                Err(refund_err) => {
                    // Refund failure leaves the ledger inconsistent: that is
                    // blackbox material too.
                    error!(tx_id = %tx_id, error = %refund_err, "refund failed");
                    self.write_blackbox(signal, txn, &err);
                }
            }
        }

        AgentEvent::BetFailed {
            tx_id: txn.tx_id.clone(),
            reason: err.reason(),
        }
    }

    fn write_blackbox(&self, signal: &BetSignal, txn: &BetTxn, err: &EngineError) {
        let record = BlackboxRecord {
            recorded_at: chrono::Utc::now(),
            tx_id: txn.tx_id.clone(),
            signal: signal.clone(),
            stake: txn.stake,
            odds: txn.odds,
            ledger_balance: self.money.bankroll().ok(),
            external_balance: txn.external_balance,
            error: format!("{err}"),
        };
        if let Err(write_err) = self.blackbox.record(&record) {
            error!(error = %write_err, "blackbox write failed; context only in logs: {record:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bankroll::MoneyManager;
    use crate::config::{LedgerConfig, StakingConfig};
    use crate::ledger::{BankrollLedger, JournalStatus};
    use crate::models::BetReceipt;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Scriptable actuator stub recording every call.
    #[derive(Default)]
    struct StubActuator {
        open_bet: bool,
        fail_open_check_once: Mutex<bool>,
        navigate_fails: bool,
        odds: Option<f64>,
        balance: Option<f64>,
        place_result: Mutex<Option<Result<BetReceipt, ActuatorError>>>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl StubActuator {
        fn with_odds(odds: f64) -> Self {
            Self {
                odds: Some(odds),
                place_result: Mutex::new(Some(Ok(BetReceipt::default()))),
                ..Default::default()
            }
        }

        fn place_err(self, err: ActuatorError) -> Self {
            *self.place_result.lock() = Some(Err(err));
            self
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl BetActuator for StubActuator {
        async fn ensure_logged_in(&self) -> Result<(), ActuatorError> {
            self.calls.lock().push("login");
            Ok(())
        }

        async fn check_open_bet(&self) -> Result<bool, ActuatorError> {
            self.calls.lock().push("check_open_bet");
            let mut fail_once = self.fail_open_check_once.lock();
            if *fail_once {
                *fail_once = false;
                return Err(ActuatorError::Timeout {
                    action: "check_open_bet",
                });
            }
            Ok(self.open_bet)
        }

        async fn navigate_to_match(&self, teams: &str) -> Result<(), ActuatorError> {
            self.calls.lock().push("navigate");
            if self.navigate_fails {
                return Err(ActuatorError::MatchNotFound(teams.to_string()));
            }
            Ok(())
        }

        async fn find_odds(&self, market: &str) -> Result<f64, ActuatorError> {
            self.calls.lock().push("find_odds");
            self.odds
                .ok_or_else(|| ActuatorError::OddsNotFound(market.to_string()))
        }

        async fn place_bet(&self, _stake: f64) -> Result<BetReceipt, ActuatorError> {
            self.calls.lock().push("place_bet");
            self.place_result
                .lock()
                .take()
                .unwrap_or(Ok(BetReceipt::default()))
        }

        async fn get_balance(&self) -> Result<Option<f64>, ActuatorError> {
            self.calls.lock().push("get_balance");
            Ok(self.balance)
        }
    }

    struct Harness {
        engine: ExecutionEngine,
        money: Arc<MoneyManager>,
        blackbox: Blackbox,
        _dir: TempDir,
    }

    fn harness(balance: f64, actuator: Arc<dyn BetActuator>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let ledger = BankrollLedger::open_in_memory(balance).unwrap();
        let money = Arc::new(MoneyManager::new(
            ledger,
            StakingConfig::default(),
            &LedgerConfig::default(),
        ));
        let state = Arc::new(AgentStateMachine::new());
        state.transition(AgentState::Idle);
        state.transition(AgentState::Listening);
        let blackbox = Blackbox::new(dir.path().join("blackbox.jsonl"));
        let engine = ExecutionEngine::new(
            money.clone(),
            actuator,
            state,
            EventBus::new(16),
            blackbox.clone(),
        )
        .with_debounce(Duration::from_millis(1));
        Harness {
            engine,
            money,
            blackbox,
            _dir: dir,
        }
    }

    fn signal() -> BetSignal {
        BetSignal::new("Arsenal vs Chelsea", "Over 2.5").with_raw_text("raw tip text")
    }

    #[tokio::test]
    async fn happy_path_places_and_reports_success() {
        let stub = Arc::new(StubActuator::with_odds(1.9));
        let h = harness(100.0, stub.clone());

        let event = h.engine.process_signal(signal()).await;
        let AgentEvent::BetSuccess { tx_id, stake, odds, .. } = event else {
            panic!("expected success, got {event:?}");
        };
        assert!((odds - 1.9).abs() < 1e-9);
        assert!((stake - 5.0).abs() < 1e-9);

        // Reservation stays pending until settlement; stake left the balance.
        let entry = h.money.pending().unwrap();
        assert_eq!(entry.len(), 1);
        assert_eq!(entry[0].tx_id, tx_id);
        assert!((h.money.bankroll().unwrap() - 95.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn open_bet_aborts_before_reservation() {
        let stub = Arc::new(StubActuator {
            open_bet: true,
            odds: Some(2.0),
            ..Default::default()
        });
        let h = harness(100.0, stub.clone());

        let event = h.engine.process_signal(signal()).await;
        assert!(matches!(
            event,
            AgentEvent::BetFailed { tx_id: None, ref reason } if reason == REASON_BET_OPEN
        ));
        assert!((h.money.bankroll().unwrap() - 100.0).abs() < 1e-9);
        assert!(!stub.calls().contains(&"place_bet"));
    }

    #[tokio::test]
    async fn inconclusive_open_check_is_retried_once() {
        let stub = Arc::new(StubActuator {
            fail_open_check_once: Mutex::new(true),
            odds: Some(1.8),
            place_result: Mutex::new(Some(Ok(BetReceipt::default()))),
            ..Default::default()
        });
        let h = harness(100.0, stub.clone());

        let event = h.engine.process_signal(signal()).await;
        assert!(matches!(event, AgentEvent::BetSuccess { .. }));
        let checks = stub.calls().iter().filter(|c| **c == "check_open_bet").count();
        assert_eq!(checks, 2);
    }

    #[tokio::test]
    async fn pending_ledger_entry_blocks_new_bet() {
        let stub = Arc::new(StubActuator::with_odds(2.1));
        let h = harness(100.0, stub.clone());
        h.money.reserve(5.0).unwrap();

        let event = h.engine.process_signal(signal()).await;
        assert!(matches!(
            event,
            AgentEvent::BetFailed { ref reason, .. } if reason == REASON_BET_OPEN
        ));
        assert_eq!(h.money.pending().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn match_not_found_fails_closed() {
        let stub = Arc::new(StubActuator {
            navigate_fails: true,
            odds: Some(2.0),
            ..Default::default()
        });
        let h = harness(100.0, stub);

        let event = h.engine.process_signal(signal()).await;
        assert!(matches!(
            event,
            AgentEvent::BetFailed { tx_id: None, ref reason } if reason == REASON_MATCH_NOT_FOUND
        ));
        assert!(h.money.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_odds_abort() {
        let stub = Arc::new(StubActuator::default());
        let h = harness(100.0, stub);

        let event = h.engine.process_signal(signal()).await;
        assert!(matches!(
            event,
            AgentEvent::BetFailed { ref reason, .. } if reason == REASON_ODDS_NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn insufficient_external_balance_aborts_before_reserve() {
        let stub = Arc::new(StubActuator {
            odds: Some(2.0),
            balance: Some(1.0),
            ..Default::default()
        });
        let h = harness(100.0, stub.clone());

        let event = h.engine.process_signal(signal()).await;
        assert!(matches!(
            event,
            AgentEvent::BetFailed { tx_id: None, ref reason } if reason.starts_with("Insufficient balance")
        ));
        assert!(h.money.pending().unwrap().is_empty());
        assert!(!stub.calls().contains(&"place_bet"));
    }

    #[tokio::test]
    async fn failure_before_submit_refunds() {
        let stub = Arc::new(
            StubActuator::with_odds(1.9)
                .place_err(ActuatorError::ElementMissing("stake_input".into())),
        );
        let h = harness(100.0, stub);

        let event = h.engine.process_signal(signal()).await;
        let AgentEvent::BetFailed { tx_id: Some(tx_id), .. } = event else {
            panic!("expected failed bet with tx_id");
        };

        // Refunded: balance restored, entry voided.
        assert!((h.money.bankroll().unwrap() - 100.0).abs() < 1e-9);
        let entry = h.money.entry_status(&tx_id).unwrap();
        assert_eq!(entry, Some(JournalStatus::Void));
        assert!(h.blackbox.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ambiguous_timeout_never_refunds_and_writes_blackbox() {
        let stub = Arc::new(StubActuator::with_odds(1.9).place_err(
            ActuatorError::SubmitOutcomeUnknown("confirmation never appeared".into()),
        ));
        let h = harness(100.0, stub);

        let event = h.engine.process_signal(signal()).await;
        let AgentEvent::BetFailed { tx_id: Some(tx_id), reason } = event else {
            panic!("expected failed bet with tx_id");
        };
        assert!(reason.starts_with("unrecoverable"));

        // No refund: stake stays debited, entry stays pending.
        assert!((h.money.bankroll().unwrap() - 95.0).abs() < 1e-9);
        assert_eq!(
            h.money.entry_status(&tx_id).unwrap(),
            Some(JournalStatus::Pending)
        );

        // Blackbox record carries the tx_id and full context.
        let records = h.blackbox.load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tx_id.as_deref(), Some(tx_id.as_str()));
        assert_eq!(records[0].stake, Some(5.0));
        assert!((records[0].ledger_balance.unwrap() - 95.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn confirmed_placement_is_never_refunded() {
        let stub = Arc::new(StubActuator::with_odds(1.9));
        let h = harness(100.0, stub);

        let event = h.engine.process_signal(signal()).await;
        let AgentEvent::BetSuccess { tx_id, .. } = event else {
            panic!("expected success");
        };
        // The reservation must not have been voided by any path.
        assert_eq!(
            h.money.entry_status(&tx_id).unwrap(),
            Some(JournalStatus::Pending)
        );
        assert!((h.money.bankroll().unwrap() - 95.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn storage_error_during_reserve_fails_cleanly() {
        let stub = Arc::new(StubActuator::with_odds(1.9));
        let dir = tempfile::tempdir().unwrap();
        let ledger = BankrollLedger::open_in_memory(100.0).unwrap();
        // Simulate catastrophic storage failure under the reserve call.
        ledger.break_storage_for_tests();
        let money = Arc::new(MoneyManager::new(
            ledger,
            StakingConfig::default(),
            &LedgerConfig::default(),
        ));
        let state = Arc::new(AgentStateMachine::new());
        let blackbox = Blackbox::new(dir.path().join("blackbox.jsonl"));
        let engine = ExecutionEngine::new(
            money.clone(),
            stub.clone(),
            state,
            EventBus::new(16),
            blackbox.clone(),
        );

        let event = engine.process_signal(signal()).await;
        assert!(matches!(event, AgentEvent::BetFailed { .. }));
        // bet_placed never set: the actuator was not asked to place anything.
        assert!(!stub.calls().contains(&"place_bet"));

        // The engine survives to process the next signal.
        let event2 = engine.process_signal(signal()).await;
        assert!(matches!(event2, AgentEvent::BetFailed { .. }));
    }
}
