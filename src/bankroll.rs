//! Money manager: validation and staking policy in front of the ledger.
//!
//! The ledger is exclusively owned here; nothing else in the crate touches it
//! directly. Stake validation exists because corrupted numeric parsing
//! upstream must never poison the journal with NaN or infinite amounts.

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{LedgerConfig, StakingConfig};
use crate::ledger::{BankrollLedger, JournalEntry, JournalStatus};

#[derive(Debug, Error)]
pub enum StakeError {
    #[error("invalid stake {0}: must be a finite positive amount")]
    Invalid(f64),
}

pub struct MoneyManager {
    ledger: BankrollLedger,
    staking: StakingConfig,
    reconcile_epsilon: f64,
}

impl MoneyManager {
    pub fn new(ledger: BankrollLedger, staking: StakingConfig, ledger_cfg: &LedgerConfig) -> Self {
        Self {
            ledger,
            staking,
            reconcile_epsilon: ledger_cfg.reconcile_epsilon.max(0.0),
        }
    }

    pub fn bankroll(&self) -> Result<f64> {
        self.ledger.balance().context("read bankroll")
    }

    /// Validate the stake, mint a tx_id, and reserve the funds.
    pub fn reserve(&self, amount: f64) -> Result<String> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(StakeError::Invalid(amount).into());
        }
        let tx_id = Uuid::new_v4().to_string();
        self.ledger
            .reserve(&tx_id, amount)
            .context("reserve stake")?;
        Ok(tx_id)
    }

    pub fn refund(&self, tx_id: &str) -> Result<()> {
        self.ledger.rollback(tx_id).context("refund stake")
    }

    pub fn win(&self, tx_id: &str, payout: f64) -> Result<()> {
        self.ledger.commit(tx_id, payout).context("settle win")
    }

    pub fn loss(&self, tx_id: &str) -> Result<()> {
        self.ledger.commit(tx_id, 0.0).context("settle loss")
    }

    pub fn pending(&self) -> Result<Vec<JournalEntry>> {
        self.ledger.pending()
    }

    pub fn entry_status(&self, tx_id: &str) -> Result<Option<JournalStatus>> {
        Ok(self.ledger.entry(tx_id)?.map(|entry| entry.status))
    }

    /// Staking policy: a fixed fraction of bankroll, capped at the configured
    /// ceiling, truncated to 2 decimals. Deterministic for a given bankroll,
    /// never negative, never above the bankroll.
    pub fn stake_for(&self, _odds: f64) -> Result<f64> {
        let bankroll = self.bankroll()?;
        if bankroll <= 0.0 {
            return Ok(0.0);
        }
        let raw = (bankroll * self.staking.fraction).min(self.staking.ceiling);
        Ok((raw * 100.0).floor() / 100.0)
    }

    /// The bookmaker is the source of truth for real money; the ledger is a
    /// shadow copy that can drift from manual bets or missed settlements.
    /// Beyond epsilon, the external figure overwrites the ledger.
    pub fn reconcile(&self, real_balance: f64) -> Result<bool> {
        if !real_balance.is_finite() || real_balance < 0.0 {
            warn!(real_balance, "ignoring implausible external balance");
            return Ok(false);
        }

        let internal = self.bankroll()?;
        let drift = (internal - real_balance).abs();
        if drift <= self.reconcile_epsilon {
            return Ok(false);
        }

        warn!(
            internal,
            real_balance, drift, "ledger drifted from bookmaker balance, overwriting"
        );
        self.ledger.overwrite_balance(real_balance)?;
        info!(balance = real_balance, "ledger balance reconciled");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;

    fn manager(balance: f64) -> MoneyManager {
        let ledger = BankrollLedger::open_in_memory(balance).unwrap();
        MoneyManager::new(ledger, StakingConfig::default(), &LedgerConfig::default())
    }

    #[test]
    fn rejects_nan_and_infinite_stakes() {
        let m = manager(100.0);
        assert!(m.reserve(f64::NAN).is_err());
        assert!(m.reserve(f64::INFINITY).is_err());
        assert!(m.reserve(f64::NEG_INFINITY).is_err());
        assert!(m.reserve(0.0).is_err());
        assert!(m.reserve(-1.0).is_err());
        // None of those touched the ledger.
        assert!((m.bankroll().unwrap() - 100.0).abs() < 1e-9);
        assert!(m.pending().unwrap().is_empty());
    }

    #[test]
    fn reserve_mints_unique_tx_ids() {
        let m = manager(100.0);
        let a = m.reserve(1.0).unwrap();
        let b = m.reserve(1.0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn stake_policy_bounds() {
        for bankroll in [0.0, 0.01, 1.0, 37.5, 100.0, 499.99, 500.0, 10_000.0] {
            let m = manager(bankroll);
            let stake = m.stake_for(1.85).unwrap();
            let bound = (bankroll * 0.05).min(25.0);
            assert!(stake >= 0.0, "bankroll {bankroll}: stake {stake} negative");
            assert!(
                stake <= bound + 1e-9,
                "bankroll {bankroll}: stake {stake} above bound {bound}"
            );
            assert!(stake <= bankroll + 1e-9);
        }
    }

    #[test]
    fn stake_hits_ceiling_on_large_bankroll() {
        let m = manager(100_000.0);
        assert!((m.stake_for(2.0).unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn stake_is_two_decimal() {
        let m = manager(123.456);
        let stake = m.stake_for(2.0).unwrap();
        assert!((stake * 100.0 - (stake * 100.0).round()).abs() < 1e-9);
    }

    #[test]
    fn reconcile_ignores_small_drift() {
        let m = manager(100.0);
        assert!(!m.reconcile(100.005).unwrap());
        assert!((m.bankroll().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn reconcile_overwrites_large_drift() {
        let m = manager(100.0);
        assert!(m.reconcile(80.0).unwrap());
        assert!((m.bankroll().unwrap() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn reconcile_rejects_garbage() {
        let m = manager(100.0);
        assert!(!m.reconcile(f64::NAN).unwrap());
        assert!(!m.reconcile(-5.0).unwrap());
        assert!((m.bankroll().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn win_and_loss_delegate() {
        let m = manager(100.0);
        let tx = m.reserve(10.0).unwrap();
        m.loss(&tx).unwrap();
        assert!((m.bankroll().unwrap() - 90.0).abs() < 1e-9);

        let tx = m.reserve(10.0).unwrap();
        m.win(&tx, 18.5).unwrap();
        assert!((m.bankroll().unwrap() - 98.5).abs() < 1e-9);
    }
}
