//! Agent configuration.
//!
//! Public settings load from a TOML file with environment-variable overrides
//! (a `.env` file is honored). Secrets live in a separately encrypted store
//! and are merged over the public config at startup, secrets winning.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use crate::secrets::SecretStore;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub ledger: LedgerConfig,
    pub staking: StakingConfig,
    pub browser: BrowserConfig,
    pub bookmaker: BookmakerConfig,
    pub selectors: SelectorConfig,
    pub vision: VisionConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub data_dir: PathBuf,
    pub liveness_path: PathBuf,
    pub liveness_interval_secs: u64,
    pub secrets_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            liveness_path: PathBuf::from("./data/heartbeat"),
            liveness_interval_secs: 10,
            secrets_path: PathBuf::from("./data/secrets.enc"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub db_path: String,
    /// Balance seeded into a fresh database. Ignored once the ledger exists.
    pub starting_balance: f64,
    /// Drift beyond this triggers an authoritative overwrite on reconcile.
    pub reconcile_epsilon: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/bankroll.db".to_string(),
            starting_balance: 0.0,
            reconcile_epsilon: 0.01,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StakingConfig {
    /// Fraction of bankroll staked per bet.
    pub fraction: f64,
    /// Hard ceiling per stake, in account currency.
    pub ceiling: f64,
}

impl Default for StakingConfig {
    fn default() -> Self {
        Self {
            fraction: 0.05,
            ceiling: 25.0,
        }
    }
}

/// How `recover()` treats the underlying browser. Explicit configuration, not
/// inferred from runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Replace the WebDriver session while leaving the externally managed
    /// browser instance running.
    Attached,
    /// Tear the session down and relaunch from scratch.
    Standalone,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    /// DevTools address of an externally launched browser, for attached mode.
    pub debugger_address: Option<String>,
    pub recovery_mode: RecoveryMode,
    pub action_timeout_ms: u64,
    /// Bet submission gets its own, longer bound.
    pub bet_timeout_ms: u64,
    pub element_wait_ms: u64,
    pub health_interval_secs: u64,
    pub health_failure_threshold: u32,
    pub queue_capacity: usize,
    /// Log the submission instead of clicking the place button.
    pub dry_run: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://127.0.0.1:9515".to_string(),
            debugger_address: None,
            recovery_mode: RecoveryMode::Standalone,
            action_timeout_ms: 15_000,
            bet_timeout_ms: 30_000,
            element_wait_ms: 4_000,
            health_interval_secs: 15,
            health_failure_threshold: 3,
            queue_capacity: 32,
            dry_run: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BookmakerConfig {
    pub base_url: String,
    pub search_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BookmakerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://bookmaker.example".to_string(),
            search_url: "https://bookmaker.example/search".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub path: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_keep: usize,
    pub history_path: PathBuf,
    pub history_keep: usize,
    /// Consecutive healing attempts allowed before the locator gives up for
    /// the rest of the session.
    pub heal_attempt_cap: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/selectors.json"),
            backup_dir: PathBuf::from("./data/selector_backups"),
            backup_keep: 5,
            history_path: PathBuf::from("./data/healing_history.json"),
            history_keep: 100,
            heal_attempt_cap: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub queue_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

impl Config {
    /// Load the public config file (missing file means all defaults), apply
    /// environment overrides, then merge decrypted secrets over the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("read config file {}", p.display()))?;
                toml::from_str(&raw).with_context(|| format!("parse {}", p.display()))?
            }
            None => Config::default(),
        };

        config.apply_env();
        config.apply_secrets();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("STAKEPILOT_DB_PATH") {
            self.ledger.db_path = v;
        }
        if let Ok(v) = env::var("WEBDRIVER_URL") {
            self.browser.webdriver_url = v;
        }
        if let Ok(v) = env::var("STAKEPILOT_DRY_RUN") {
            self.browser.dry_run = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = env::var("STAKEPILOT_STAKE_CEILING") {
            if let Ok(parsed) = v.parse::<f64>() {
                if parsed > 0.0 {
                    self.staking.ceiling = parsed;
                }
            }
        }
        if let Ok(v) = env::var("VISION_API_KEY") {
            self.vision.api_key = Some(v);
        }
    }

    /// Secrets take precedence over anything from the public file or env.
    fn apply_secrets(&mut self) {
        let store = match SecretStore::open(&self.agent.secrets_path) {
            Ok(Some(store)) => store,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "secret store unreadable, continuing without it");
                return;
            }
        };

        if let Some(v) = store.get("bookmaker_username") {
            self.bookmaker.username = Some(v.to_string());
        }
        if let Some(v) = store.get("bookmaker_password") {
            self.bookmaker.password = Some(v.to_string());
        }
        if let Some(v) = store.get("vision_api_key") {
            self.vision.api_key = Some(v.to_string());
        }
    }
}
