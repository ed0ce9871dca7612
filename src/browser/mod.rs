//! Browser actuator and session supervisor.
//!
//! Owns the single live WebDriver session. Every public action is funneled
//! through the single-consumer queue so interactions never interleave, each
//! call is bounded by a timeout, and each either returns a definite result or
//! raises. The internals (human-cadence typing, selector healing) are
//! actuation details with no bearing on the transactional contract, except
//! for one: any failure after the bet slip's submit click surfaces as
//! `SubmitOutcomeUnknown`, because the bookmaker may have accepted the bet
//! regardless of what the page looks like afterwards.

pub mod queue;
pub mod webdriver;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{BookmakerConfig, BrowserConfig, Config, RecoveryMode};
use crate::events::{AgentEvent, EventBus};
use crate::locator::dom_scan::{self, DomElement};
use crate::locator::store::SelectorStore;
use crate::locator::vision::VisionOracle;
use crate::locator::{Locator, PageProbe};
use crate::models::{parse_decimal, BetReceipt};
use queue::{ActionQueue, SubmitError};
use webdriver::WebDriverClient;

const KEY_SEARCH_INPUT: &str = "search_input";
const KEY_MATCH_RESULT: &str = "match_result";
const KEY_MATCH_TITLE: &str = "match_title";
const KEY_STAKE_INPUT: &str = "stake_input";
const KEY_PLACE_BET_BUTTON: &str = "place_bet_button";
const KEY_BET_CONFIRMATION: &str = "bet_confirmation";
const KEY_OPEN_BET_INDICATOR: &str = "open_bet_indicator";
const KEY_BALANCE_LABEL: &str = "balance_label";
const KEY_LOGIN_USERNAME: &str = "login_username";
const KEY_LOGIN_PASSWORD: &str = "login_password";
const KEY_LOGIN_SUBMIT: &str = "login_submit";

/// WebDriver keycode for Enter.
const ENTER_KEY: &str = "\u{E007}";

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("browser session not ready")]
    NotReady,
    #[error("browser action queue saturated")]
    QueueSaturated,
    #[error("browser worker unavailable")]
    WorkerUnavailable,
    #[error("{action} timed out")]
    Timeout { action: &'static str },
    #[error("element not found: {0}")]
    ElementMissing(String),
    #[error("match not found: {0}")]
    MatchNotFound(String),
    #[error("odds not found for market '{0}'")]
    OddsNotFound(String),
    #[error("bet submitted but outcome unknown: {0}")]
    SubmitOutcomeUnknown(String),
    #[error("webdriver failure: {0}")]
    Driver(String),
}

impl From<anyhow::Error> for ActuatorError {
    fn from(err: anyhow::Error) -> Self {
        ActuatorError::Driver(format!("{err:#}"))
    }
}

impl ActuatorError {
    /// True when the bet may already be on the external books, so no refund
    /// is permitted.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, ActuatorError::SubmitOutcomeUnknown(_))
    }
}

/// The contract the execution engine depends on. The engine never sees the
/// concrete session type, only this capability.
#[async_trait]
pub trait BetActuator: Send + Sync {
    async fn ensure_logged_in(&self) -> Result<(), ActuatorError>;
    async fn check_open_bet(&self) -> Result<bool, ActuatorError>;
    async fn navigate_to_match(&self, teams: &str) -> Result<(), ActuatorError>;
    async fn find_odds(&self, market: &str) -> Result<f64, ActuatorError>;
    async fn place_bet(&self, stake: f64) -> Result<BetReceipt, ActuatorError>;
    async fn get_balance(&self) -> Result<Option<f64>, ActuatorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Launching,
    Ready,
    Degraded,
    Closed,
}

/// Mutable session state owned exclusively by the queue worker.
pub struct SessionContext {
    driver: WebDriverClient,
    session: Option<String>,
    locator: Locator,
    cfg: BrowserConfig,
    book: BookmakerConfig,
}

impl SessionContext {
    fn new(
        config: &Config,
        store: Arc<SelectorStore>,
        oracle: Option<Arc<dyn VisionOracle>>,
        events: EventBus,
    ) -> AnyResult<Self> {
        let cfg = config.browser.clone();
        let driver = WebDriverClient::new(
            &cfg.webdriver_url,
            Duration::from_millis(cfg.action_timeout_ms),
        )?;
        let locator = Locator::new(
            &config.selectors,
            store,
            oracle,
            events,
            Duration::from_millis(cfg.element_wait_ms),
        );
        Ok(Self {
            driver,
            session: None,
            locator,
            cfg,
            book: config.bookmaker.clone(),
        })
    }

    fn session_id(&self) -> Result<&str, ActuatorError> {
        self.session.as_deref().ok_or(ActuatorError::NotReady)
    }

    /// Idempotent: reuses a live session, creates one otherwise. Returns true
    /// when a fresh session was created.
    async fn ensure_session(&mut self) -> Result<bool, ActuatorError> {
        if let Some(session) = self.session.clone() {
            if self.driver.title(&session).await.is_ok() {
                return Ok(false);
            }
            debug!("existing session no longer answers, replacing");
            self.session = None;
        }

        let session = self
            .driver
            .new_session(self.cfg.debugger_address.as_deref())
            .await?;
        self.driver.navigate(&session, &self.book.base_url).await?;
        self.session = Some(session);
        Ok(true)
    }

    /// Cheap liveness probe: read the current page title.
    async fn health_probe(&self) -> Result<String, ActuatorError> {
        let session = self.session_id()?;
        Ok(self.driver.title(session).await?)
    }

    async fn recover(&mut self, mode: RecoveryMode) -> Result<(), ActuatorError> {
        match mode {
            RecoveryMode::Attached => {
                // Leave the externally managed browser untouched, replace
                // only the WebDriver session against it.
                self.session = None;
                let session = self
                    .driver
                    .new_session(self.cfg.debugger_address.as_deref())
                    .await?;
                self.driver.navigate(&session, &self.book.base_url).await?;
                self.session = Some(session);
            }
            RecoveryMode::Standalone => {
                if let Some(old) = self.session.take() {
                    if let Err(err) = self.driver.delete_session(&old).await {
                        warn!(error = %err, "stale session teardown failed, continuing");
                    }
                }
                let session = self.driver.new_session(None).await?;
                self.driver.navigate(&session, &self.book.base_url).await?;
                self.session = Some(session);
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = self.driver.delete_session(&session).await {
                warn!(error = %err, "session close failed");
            }
        }
    }

    async fn locate_required(&self, key: &str) -> Result<String, ActuatorError> {
        match self.locator.locate(self, key).await {
            Ok(Some(selector)) => Ok(selector),
            Ok(None) => Err(ActuatorError::ElementMissing(key.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn element_for(&self, selector: &str) -> Result<String, ActuatorError> {
        let session = self.session_id()?;
        self.driver
            .find_element(session, selector)
            .await?
            .ok_or_else(|| ActuatorError::ElementMissing(selector.to_string()))
    }

    /// Human-cadence typing: clear, then one keystroke at a time with jitter.
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), ActuatorError> {
        let session = self.session_id()?.to_string();
        let element = self.element_for(selector).await?;
        self.driver.clear(&session, &element).await?;
        for ch in text.chars() {
            self.driver
                .send_keys(&session, &element, &ch.to_string())
                .await?;
            let jitter = rand::thread_rng().gen_range(40..140);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
        Ok(())
    }

    async fn click_selector(&self, selector: &str) -> Result<(), ActuatorError> {
        let session = self.session_id()?.to_string();
        let element = self.element_for(selector).await?;
        let pause = rand::thread_rng().gen_range(80..250);
        tokio::time::sleep(Duration::from_millis(pause)).await;
        self.driver.click(&session, &element).await?;
        Ok(())
    }

    async fn text_of(&self, selector: &str) -> Result<String, ActuatorError> {
        let session = self.session_id()?.to_string();
        let element = self.element_for(selector).await?;
        Ok(self.driver.element_text(&session, &element).await?)
    }

    /// Best-effort login. Absence of the login form means an authenticated
    /// session; real login failures surface later as navigation failures.
    async fn login_if_needed(&mut self) -> Result<(), ActuatorError> {
        self.ensure_session().await?;

        let (Some(username), Some(password)) =
            (self.book.username.clone(), self.book.password.clone())
        else {
            debug!("no credentials configured, skipping login");
            return Ok(());
        };

        let Some(user_sel) = self.locator.store_selector(KEY_LOGIN_USERNAME) else {
            return Ok(());
        };
        if !self.probe(&user_sel, Duration::from_millis(800)).await.unwrap_or(false) {
            return Ok(());
        }

        info!("login form detected, authenticating");
        self.type_text(&user_sel, &username).await?;
        let pass_sel = self.locate_required(KEY_LOGIN_PASSWORD).await?;
        self.type_text(&pass_sel, &password).await?;
        let submit_sel = self.locate_required(KEY_LOGIN_SUBMIT).await?;
        self.click_selector(&submit_sel).await?;
        Ok(())
    }

    /// Open-bet detection uses only the stored selector: a missing indicator
    /// is the normal no-open-bet case, not a broken selector to heal.
    async fn check_open_bet(&self) -> Result<bool, ActuatorError> {
        let Some(selector) = self.locator.store_selector(KEY_OPEN_BET_INDICATOR) else {
            debug!("no open-bet selector configured, assuming none open");
            return Ok(false);
        };
        Ok(self
            .probe(&selector, Duration::from_millis(self.cfg.element_wait_ms / 2))
            .await?)
    }

    async fn navigate_to_match(&mut self, teams: &str) -> Result<(), ActuatorError> {
        self.ensure_session().await?;
        let session = self.session_id()?.to_string();
        self.driver.navigate(&session, &self.book.search_url).await?;

        let search_sel = self.locate_required(KEY_SEARCH_INPUT).await?;
        self.type_text(&search_sel, teams).await?;
        let search_el = self.element_for(&search_sel).await?;
        self.driver.send_keys(&session, &search_el, ENTER_KEY).await?;

        let result_sel = self
            .locator
            .locate(self, KEY_MATCH_RESULT)
            .await
            .map_err(ActuatorError::from)?
            .ok_or_else(|| ActuatorError::MatchNotFound(teams.to_string()))?;
        self.click_selector(&result_sel).await?;

        // Verify we landed on the right fixture before anything irreversible.
        let title_sel = self.locate_required(KEY_MATCH_TITLE).await?;
        let title = self.text_of(&title_sel).await?.to_lowercase();
        let matched = teams
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| token.len() > 2)
            .any(|token| title.contains(token));
        if !matched {
            return Err(ActuatorError::MatchNotFound(teams.to_string()));
        }
        Ok(())
    }

    async fn find_odds(&self, market: &str) -> Result<f64, ActuatorError> {
        let market_key = format!("odds_{}", slugify(market));
        let selector = match self.locator.locate(self, &market_key).await? {
            Some(selector) => selector,
            None => self
                .locator
                .locate(self, "odds_value")
                .await?
                .ok_or_else(|| ActuatorError::OddsNotFound(market.to_string()))?,
        };

        let odds = parse_decimal(&self.text_of(&selector).await?);
        if odds <= 0.0 {
            return Err(ActuatorError::OddsNotFound(market.to_string()));
        }
        Ok(odds)
    }

    async fn read_balance(&self) -> Result<Option<f64>, ActuatorError> {
        let Some(selector) = self.locator.locate(self, KEY_BALANCE_LABEL).await? else {
            return Ok(None);
        };
        let balance = parse_decimal(&self.text_of(&selector).await?);
        Ok((balance > 0.0).then_some(balance))
    }

    /// The transactionally sensitive action. Everything up to the submit
    /// click fails cleanly; everything after it fails as
    /// `SubmitOutcomeUnknown`.
    async fn place_bet(&mut self, stake: f64) -> Result<BetReceipt, ActuatorError> {
        let stake_sel = self.locate_required(KEY_STAKE_INPUT).await?;
        self.type_text(&stake_sel, &format!("{stake:.2}")).await?;
        let button_sel = self.locate_required(KEY_PLACE_BET_BUTTON).await?;

        if self.cfg.dry_run {
            warn!(stake, "DRY RUN: bet slip filled, skipping submit click");
            return Ok(BetReceipt {
                confirmation: Some("dry-run".to_string()),
                placed_at: Some(Utc::now()),
            });
        }

        // Irreversible boundary: after this click the bookmaker may have the
        // bet no matter what we observe.
        self.click_selector(&button_sel).await?;

        let confirmation = self
            .await_confirmation()
            .await
            .map_err(|err| ActuatorError::SubmitOutcomeUnknown(format!("{err}")))?;
        Ok(BetReceipt {
            confirmation,
            placed_at: Some(Utc::now()),
        })
    }

    async fn await_confirmation(&self) -> Result<Option<String>, ActuatorError> {
        let wait = Duration::from_millis(self.cfg.bet_timeout_ms / 2);
        let Some(selector) = self.locator.store_selector(KEY_BET_CONFIRMATION) else {
            return Err(ActuatorError::ElementMissing(
                KEY_BET_CONFIRMATION.to_string(),
            ));
        };
        if !self.probe(&selector, wait).await? {
            return Err(ActuatorError::ElementMissing(
                KEY_BET_CONFIRMATION.to_string(),
            ));
        }
        Ok(self.text_of(&selector).await.ok())
    }
}

#[async_trait]
impl PageProbe for SessionContext {
    async fn probe(&self, selector: &str, wait: Duration) -> AnyResult<bool> {
        let session = self
            .session
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no live session"))?;
        let deadline = Instant::now() + wait;
        loop {
            if let Some(element) = self.driver.find_element(session, selector).await? {
                if self
                    .driver
                    .is_displayed(session, &element)
                    .await
                    .unwrap_or(false)
                {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn dom_snapshot(&self) -> AnyResult<Vec<DomElement>> {
        let session = self
            .session
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no live session"))?;
        let value = self
            .driver
            .execute(session, dom_scan::SNAPSHOT_SCRIPT)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn screenshot_b64(&self) -> AnyResult<String> {
        let session = self
            .session
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no live session"))?;
        self.driver.screenshot_b64(session).await
    }
}

/// Public handle. All methods are safe to call from any task; the queue
/// serializes the underlying browser work.
pub struct Actuator {
    queue: ActionQueue<SessionContext>,
    phase: Mutex<SessionPhase>,
    cfg: BrowserConfig,
    events: EventBus,
}

impl Actuator {
    pub fn new(
        config: &Config,
        store: Arc<SelectorStore>,
        oracle: Option<Arc<dyn VisionOracle>>,
        events: EventBus,
    ) -> AnyResult<Self> {
        let context = SessionContext::new(config, store, oracle, events.clone())?;
        Ok(Self {
            queue: ActionQueue::new(context, config.browser.queue_capacity),
            phase: Mutex::new(SessionPhase::Uninitialized),
            cfg: config.browser.clone(),
            events,
        })
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock() = phase;
    }

    fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.action_timeout_ms)
    }

    async fn run<R, F>(&self, label: &'static str, timeout: Duration, f: F) -> Result<R, ActuatorError>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut SessionContext) -> futures_util::future::BoxFuture<'a, Result<R, ActuatorError>>
            + Send
            + 'static,
    {
        match self.queue.submit(label, timeout, f).await {
            Ok(result) => result,
            Err(SubmitError::Saturated) => Err(ActuatorError::QueueSaturated),
            Err(SubmitError::WorkerGone) | Err(SubmitError::Aborted(_)) => {
                Err(ActuatorError::WorkerUnavailable)
            }
            Err(SubmitError::Timeout(_)) => Err(ActuatorError::Timeout { action: label }),
        }
    }

    /// Idempotent launch: short-circuits when the session already answers a
    /// liveness probe.
    pub async fn launch(&self) -> Result<bool, ActuatorError> {
        if self.phase() == SessionPhase::Ready {
            if self
                .run("health_probe", self.action_timeout(), |ctx: &mut SessionContext| {
                    async move { ctx.health_probe().await }.boxed()
                })
                .await
                .is_ok()
            {
                return Ok(true);
            }
            self.set_phase(SessionPhase::Degraded);
        }

        self.set_phase(SessionPhase::Launching);
        let created = self
            .run("launch", Duration::from_millis(self.cfg.bet_timeout_ms), |ctx: &mut SessionContext| {
                async move { ctx.ensure_session().await }.boxed()
            })
            .await;

        match created {
            Ok(fresh) => {
                self.set_phase(SessionPhase::Ready);
                info!(fresh, "browser session ready");
                Ok(true)
            }
            Err(err) => {
                self.set_phase(SessionPhase::Degraded);
                Err(err)
            }
        }
    }

    pub async fn health_check(&self) -> Result<(), ActuatorError> {
        let result = self
            .run("health_probe", self.action_timeout(), |ctx: &mut SessionContext| {
                async move { ctx.health_probe().await }.boxed()
            })
            .await;

        match result {
            Ok(title) => {
                if self.phase() == SessionPhase::Degraded {
                    self.set_phase(SessionPhase::Ready);
                }
                debug!(title, "health probe ok");
                Ok(())
            }
            Err(err) => {
                self.set_phase(SessionPhase::Degraded);
                Err(err)
            }
        }
    }

    /// Recovery strategy is explicit configuration, never inferred from the
    /// failure that got us here.
    pub async fn recover(&self) -> Result<(), ActuatorError> {
        let mode = self.cfg.recovery_mode;
        info!(?mode, "recovering browser session");

        let result = self
            .run("recover", Duration::from_millis(self.cfg.bet_timeout_ms), move |ctx: &mut SessionContext| {
                async move { ctx.recover(mode).await }.boxed()
            })
            .await;

        match result {
            Ok(()) => {
                self.set_phase(SessionPhase::Ready);
                self.events.emit(AgentEvent::SessionRecovered {
                    mode: format!("{mode:?}").to_lowercase(),
                });
                Ok(())
            }
            Err(err) => {
                self.set_phase(SessionPhase::Degraded);
                Err(err)
            }
        }
    }

    pub async fn close(&self) {
        let _ = self
            .run("close", self.action_timeout(), |ctx: &mut SessionContext| {
                async move {
                    ctx.close().await;
                    Ok(())
                }
                .boxed()
            })
            .await;
        self.set_phase(SessionPhase::Closed);
    }

    /// Second-order supervision hook: respawn the queue worker if it died.
    pub fn ensure_worker(&self) -> bool {
        self.queue.ensure_worker()
    }

    pub fn worker_alive(&self) -> bool {
        self.queue.worker_alive()
    }
}

#[async_trait]
impl BetActuator for Actuator {
    async fn ensure_logged_in(&self) -> Result<(), ActuatorError> {
        self.run("login", Duration::from_millis(self.cfg.bet_timeout_ms), |ctx: &mut SessionContext| {
            async move { ctx.login_if_needed().await }.boxed()
        })
        .await
    }

    async fn check_open_bet(&self) -> Result<bool, ActuatorError> {
        self.run("check_open_bet", self.action_timeout(), |ctx: &mut SessionContext| {
            async move { ctx.check_open_bet().await }.boxed()
        })
        .await
    }

    async fn navigate_to_match(&self, teams: &str) -> Result<(), ActuatorError> {
        let teams = teams.to_string();
        self.run("navigate_to_match", Duration::from_millis(self.cfg.bet_timeout_ms), move |ctx: &mut SessionContext| {
            async move { ctx.navigate_to_match(&teams).await }.boxed()
        })
        .await
    }

    async fn find_odds(&self, market: &str) -> Result<f64, ActuatorError> {
        let market = market.to_string();
        self.run("find_odds", self.action_timeout(), move |ctx: &mut SessionContext| {
            async move { ctx.find_odds(&market).await }.boxed()
        })
        .await
    }

    async fn place_bet(&self, stake: f64) -> Result<BetReceipt, ActuatorError> {
        let result = self
            .run("place_bet", Duration::from_millis(self.cfg.bet_timeout_ms), move |ctx: &mut SessionContext| {
                async move { ctx.place_bet(stake).await }.boxed()
            })
            .await;

        // A timeout here is ambiguous: the submit click may have landed.
        match result {
            Err(ActuatorError::Timeout { .. }) => Err(ActuatorError::SubmitOutcomeUnknown(
                "place_bet timed out; outcome unknown".to_string(),
            )),
            other => other,
        }
    }

    async fn get_balance(&self) -> Result<Option<f64>, ActuatorError> {
        self.run("get_balance", self.action_timeout(), |ctx: &mut SessionContext| {
            async move { ctx.read_balance().await }.boxed()
        })
        .await
    }
}

fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for c in raw.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_was_sep = false;
        } else if !last_was_sep && !out.is_empty() {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_markets() {
        assert_eq!(slugify("Over 2.5"), "over_2_5");
        assert_eq!(slugify("Match Winner"), "match_winner");
        assert_eq!(slugify("  1X2 "), "1x2");
    }

    #[test]
    fn submit_unknown_is_flagged() {
        assert!(ActuatorError::SubmitOutcomeUnknown("x".into()).outcome_unknown());
        assert!(!ActuatorError::NotReady.outcome_unknown());
        assert!(!ActuatorError::Timeout { action: "find_odds" }.outcome_unknown());
    }
}
