//! Logical-key element location with two-tier self-healing.
//!
//! `locate` resolves a logical key (e.g. `stake_input`) to a working CSS
//! selector. When the stored selector no longer matches the page, healing
//! kicks in: first a structural scan of the DOM, then (only if that yields
//! nothing) a vision-model pass over a screenshot. Successful heals are
//! persisted with backup rotation before the result is returned.
//!
//! The locator never touches the browser directly: it sees the page through
//! the `PageProbe` capability, which the actuator's session worker provides.

pub mod dom_scan;
pub mod store;
pub mod vision;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SelectorConfig;
use crate::events::{AgentEvent, EventBus};
use dom_scan::DomElement;
use store::SelectorStore;
use vision::VisionOracle;

/// Minimal page capability the locator needs.
#[async_trait]
pub trait PageProbe: Send + Sync {
    /// True when the selector resolves to a visible element within `wait`.
    async fn probe(&self, selector: &str, wait: Duration) -> Result<bool>;
    /// Flattened snapshot of interactive elements.
    async fn dom_snapshot(&self) -> Result<Vec<DomElement>>;
    /// PNG screenshot, base64-encoded.
    async fn screenshot_b64(&self) -> Result<String>;
}

pub struct Locator {
    store: Arc<SelectorStore>,
    oracle: Option<Arc<dyn VisionOracle>>,
    events: EventBus,
    element_wait: Duration,
    heal_attempt_cap: u32,
    heal_attempts: AtomicU32,
}

impl Locator {
    pub fn new(
        cfg: &SelectorConfig,
        store: Arc<SelectorStore>,
        oracle: Option<Arc<dyn VisionOracle>>,
        events: EventBus,
        element_wait: Duration,
    ) -> Self {
        Self {
            store,
            oracle,
            events,
            element_wait,
            heal_attempt_cap: cfg.heal_attempt_cap,
            heal_attempts: AtomicU32::new(0),
        }
    }

    /// Resolve `key` to a selector that currently matches a visible element,
    /// healing the stored selector when needed. Returns None when direct
    /// resolution and both healing tiers fail, or when the per-session
    /// healing budget is exhausted.
    pub async fn locate(&self, page: &dyn PageProbe, key: &str) -> Result<Option<String>> {
        if let Some(selector) = self.store.get(key) {
            if page.probe(&selector, self.element_wait).await? {
                self.heal_attempts.store(0, Ordering::Relaxed);
                return Ok(Some(selector));
            }
            debug!(key, selector, "stored selector no longer resolves");
        } else {
            debug!(key, "no stored selector, healing from scratch");
        }

        let attempts = self.heal_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempts > self.heal_attempt_cap {
            warn!(
                key,
                attempts, "healing budget exhausted for this session, giving up"
            );
            return Ok(None);
        }

        // Tier 1: structural scan. Tier 2 only when tier 1 produced nothing
        // usable. Bounded loop instead of recursion: each healed candidate is
        // re-verified exactly once.
        if let Some(selector) = self.heal_structural(page, key).await {
            return Ok(Some(selector));
        }
        if let Some(selector) = self.heal_vision(page, key).await {
            return Ok(Some(selector));
        }

        warn!(key, "both healing tiers exhausted");
        Ok(None)
    }

    async fn heal_structural(&self, page: &dyn PageProbe, key: &str) -> Option<String> {
        let snapshot = match page.dom_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(key, error = %err, "dom snapshot failed");
                return None;
            }
        };

        let candidate = dom_scan::best_candidate(key, &snapshot)?;
        self.verify_and_persist(page, key, &candidate, "dom").await
    }

    async fn heal_vision(&self, page: &dyn PageProbe, key: &str) -> Option<String> {
        let oracle = self.oracle.as_ref()?;

        let screenshot = match page.screenshot_b64().await {
            Ok(shot) => shot,
            Err(err) => {
                warn!(key, error = %err, "screenshot for vision healing failed");
                return None;
            }
        };

        let candidate = match oracle.selector_for(key, &screenshot).await {
            Ok(Some(selector)) => selector,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "vision oracle failed");
                return None;
            }
        };

        self.verify_and_persist(page, key, &candidate, "vision")
            .await
    }

    /// A heal only counts if the candidate actually resolves; persisting a
    /// dead selector would corrupt the store.
    async fn verify_and_persist(
        &self,
        page: &dyn PageProbe,
        key: &str,
        candidate: &str,
        tier: &str,
    ) -> Option<String> {
        match page.probe(candidate, self.element_wait).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key, candidate, tier, "healed candidate does not resolve");
                return None;
            }
            Err(err) => {
                warn!(key, candidate, error = %err, "probe of healed candidate failed");
                return None;
            }
        }

        if let Err(err) = self.store.persist_heal(key, candidate, tier) {
            warn!(key, error = %err, "failed to persist healed selector");
        }
        info!(key, candidate, tier, "selector healed");
        self.events.emit(AgentEvent::SelectorHealed {
            key: key.to_string(),
            tier: tier.to_string(),
            selector: candidate.to_string(),
        });
        self.heal_attempts.store(0, Ordering::Relaxed);
        Some(candidate.to_string())
    }

    /// Stored selector for `key`, with no resolution or healing side effects.
    /// For callers where an unmatched selector is a normal condition rather
    /// than a broken one.
    pub fn store_selector(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    /// Healing attempts consumed so far in this session.
    pub fn heal_attempts(&self) -> u32 {
        self.heal_attempts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    struct FakePage {
        /// Selectors that resolve on this "page".
        alive: Mutex<Vec<String>>,
        snapshot: Vec<DomElement>,
        probes: Mutex<Vec<String>>,
    }

    impl FakePage {
        fn new(alive: &[&str], snapshot: Vec<DomElement>) -> Self {
            Self {
                alive: Mutex::new(alive.iter().map(|s| s.to_string()).collect()),
                snapshot,
                probes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageProbe for FakePage {
        async fn probe(&self, selector: &str, _wait: Duration) -> Result<bool> {
            self.probes.lock().push(selector.to_string());
            Ok(self.alive.lock().iter().any(|s| s == selector))
        }

        async fn dom_snapshot(&self) -> Result<Vec<DomElement>> {
            Ok(self.snapshot.clone())
        }

        async fn screenshot_b64(&self) -> Result<String> {
            Ok("c2NyZWVuc2hvdA==".to_string())
        }
    }

    struct FixedOracle(Option<String>);

    #[async_trait]
    impl VisionOracle for FixedOracle {
        async fn selector_for(&self, _key: &str, _shot: &str) -> Result<Option<String>> {
            Ok(self.0.clone())
        }
    }

    fn locator_in(
        dir: &std::path::Path,
        seed: &str,
        oracle: Option<Arc<dyn VisionOracle>>,
    ) -> Locator {
        let cfg = SelectorConfig {
            path: dir.join("selectors.json"),
            backup_dir: dir.join("backups"),
            backup_keep: 5,
            history_path: dir.join("history.json"),
            history_keep: 100,
            heal_attempt_cap: 3,
        };
        std::fs::write(&cfg.path, seed).unwrap();
        let store = Arc::new(SelectorStore::load(cfg.clone()).unwrap());
        Locator::new(&cfg, store, oracle, EventBus::new(8), Duration::from_millis(10))
    }

    fn stake_snapshot() -> Vec<DomElement> {
        vec![DomElement {
            tag: "input".to_string(),
            name: "stake".to_string(),
            text: "stake input".to_string(),
            ..Default::default()
        }]
    }

    #[tokio::test]
    async fn direct_hit_needs_no_healing() {
        let dir = tempdir().unwrap();
        let locator = locator_in(dir.path(), r##"{"stake_input":"#stake"}"##, None);
        let page = FakePage::new(&["#stake"], vec![]);

        let found = locator.locate(&page, "stake_input").await.unwrap();
        assert_eq!(found.as_deref(), Some("#stake"));
        assert_eq!(locator.heal_attempts(), 0);
    }

    #[tokio::test]
    async fn structural_heal_repairs_and_persists() {
        let dir = tempdir().unwrap();
        let locator = locator_in(dir.path(), r##"{"stake_input":"#old-stake"}"##, None);
        let page = FakePage::new(&["input[name=\"stake\"]"], stake_snapshot());

        let found = locator.locate(&page, "stake_input").await.unwrap();
        assert_eq!(found.as_deref(), Some("input[name=\"stake\"]"));

        // Persisted: a fresh lookup uses the healed selector directly.
        let found_again = locator.locate(&page, "stake_input").await.unwrap();
        assert_eq!(found_again.as_deref(), Some("input[name=\"stake\"]"));
    }

    #[tokio::test]
    async fn vision_runs_only_when_structural_fails() {
        let dir = tempdir().unwrap();
        let oracle: Arc<dyn VisionOracle> = Arc::new(FixedOracle(Some(".bet-slip".to_string())));
        let locator = locator_in(dir.path(), "{}", Some(oracle));
        // Snapshot has nothing matching the key, vision's answer resolves.
        let page = FakePage::new(&[".bet-slip"], vec![]);

        let found = locator.locate(&page, "bet_slip_panel").await.unwrap();
        assert_eq!(found.as_deref(), Some(".bet-slip"));
    }

    #[tokio::test]
    async fn exhausted_tiers_yield_none() {
        let dir = tempdir().unwrap();
        let oracle: Arc<dyn VisionOracle> = Arc::new(FixedOracle(None));
        let locator = locator_in(dir.path(), r#"{"balance_label":".bal"}"#, Some(oracle));
        let page = FakePage::new(&[], vec![]);

        let found = locator.locate(&page, "balance_label").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn healing_budget_caps_retry_storms() {
        let dir = tempdir().unwrap();
        let locator = locator_in(dir.path(), r##"{"stake_input":"#gone"}"##, None);
        let page = FakePage::new(&[], vec![]);

        for _ in 0..3 {
            assert!(locator.locate(&page, "stake_input").await.unwrap().is_none());
        }
        let probes_before = page.probes.lock().len();

        // Budget exhausted: not even the direct probe's healing path runs.
        assert!(locator.locate(&page, "stake_input").await.unwrap().is_none());
        let probes_after = page.probes.lock().len();
        // One direct probe happened, but no healing probes followed.
        assert_eq!(probes_after, probes_before + 1);
    }

    #[tokio::test]
    async fn dead_healed_candidate_is_not_persisted() {
        let dir = tempdir().unwrap();
        let oracle: Arc<dyn VisionOracle> = Arc::new(FixedOracle(Some("#phantom".to_string())));
        let locator = locator_in(dir.path(), "{}", Some(oracle));
        // Vision answers but the selector doesn't resolve.
        let page = FakePage::new(&[], vec![]);

        assert!(locator.locate(&page, "stake_input").await.unwrap().is_none());

        let raw = std::fs::read_to_string(dir.path().join("selectors.json")).unwrap();
        assert!(!raw.contains("phantom"));
    }
}
