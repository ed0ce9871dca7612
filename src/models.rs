//! Core data shapes shared across the agent.
//!
//! Signals arrive from the out-of-process message parser as newline-delimited
//! JSON; everything here is validated at the boundary (parse, don't trust).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bet signal produced by the external message parser.
///
/// `teams` and `market` are required; a signal missing either is rejected at
/// deserialization time and never reaches the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetSignal {
    pub teams: String,
    pub market: String,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl BetSignal {
    pub fn new(teams: impl Into<String>, market: impl Into<String>) -> Self {
        Self {
            teams: teams.into(),
            market: market.into(),
            raw_text: String::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_raw_text(mut self, raw: impl Into<String>) -> Self {
        self.raw_text = raw.into();
        self
    }
}

/// Confirmation handle returned by the actuator once a bet slip is submitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BetReceipt {
    /// Bookmaker-side confirmation text, when one could be captured.
    pub confirmation: Option<String>,
    pub placed_at: Option<DateTime<Utc>>,
}

/// Parse a bookmaker-formatted number that may use `,` or `.` as decimal or
/// thousands separator.
///
/// Policy: strip everything but digits, comma and dot. When both separators
/// are present, the one appearing later in the string is the decimal point
/// and the other is a thousands separator. A lone comma is a decimal comma.
/// Anything unparsable yields 0.0, which callers treat as "absent".
pub fn parse_decimal(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return 0.0;
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) => {
            if comma > dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };

    normalized.parse::<f64>().unwrap_or(0.0)
}
