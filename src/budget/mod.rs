//! Per-story, per-category spend caps.
//!
//! ```text
//! BudgetConfig (caps, thresholds, window)
//!       │
//!       ▼
//! BudgetLedger ── reserve(story, category, amount) ──► Allow | Deny
//!              ── commit(story, category, actual)  ──► records fact, signals overrun
//!              ── usage_percent / threshold        ──► reporting
//!              ── rolling_aggregate(sessions)      ──► informational only
//! ```

pub mod ledger;
pub use ledger::{BudgetLedger, BudgetOverrun, RollingAggregate};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Amounts closer than this are considered equal.
pub const AMOUNT_EPSILON: f64 = 1e-9;

fn default_currency() -> String {
    "USD".to_string()
}

fn default_warning_percent() -> f64 {
    75.0
}

fn default_critical_percent() -> f64 {
    90.0
}

fn default_auto_stop() -> bool {
    true
}

fn default_rolling_window_days() -> u32 {
    30
}

fn default_phase_estimate() -> f64 {
    1.0
}

fn default_caps() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("planning".to_string(), 5.0),
        ("implementation".to_string(), 15.0),
        ("review".to_string(), 5.0),
    ])
}

/// `[budget]` section of `storyforge.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_warning_percent")]
    pub warning_percent: f64,
    #[serde(default = "default_critical_percent")]
    pub critical_percent: f64,
    /// When false, reservations past the cap are allowed with a warning.
    #[serde(default = "default_auto_stop")]
    pub auto_stop: bool,
    #[serde(default = "default_rolling_window_days")]
    pub rolling_window_days: u32,
    /// One-time offset added to the rolling aggregate (spend before tracking began).
    #[serde(default)]
    pub baseline_offset: f64,
    /// Reservation amount for phases that declare no estimate.
    #[serde(default = "default_phase_estimate")]
    pub default_phase_estimate: f64,
    #[serde(default = "default_caps")]
    pub caps: BTreeMap<String, f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            warning_percent: default_warning_percent(),
            critical_percent: default_critical_percent(),
            auto_stop: default_auto_stop(),
            rolling_window_days: default_rolling_window_days(),
            baseline_offset: 0.0,
            default_phase_estimate: default_phase_estimate(),
            caps: default_caps(),
        }
    }
}

/// Cap and spend for one category of one story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetEntry {
    pub category: String,
    pub cap: f64,
    #[serde(default)]
    pub spent: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl BudgetEntry {
    pub fn new(category: &str, cap: f64, currency: &str) -> Self {
        Self {
            category: category.to_string(),
            cap,
            spent: 0.0,
            currency: currency.to_string(),
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.cap - self.spent).max(0.0)
    }

    pub fn usage_percent(&self) -> f64 {
        percent(self.spent, self.cap)
    }

    /// Whether charging `amount` more would push spend past the cap.
    pub fn would_exceed(&self, amount: f64) -> bool {
        self.spent + amount > self.cap + AMOUNT_EPSILON
    }

    pub fn is_overrun(&self) -> bool {
        self.spent > self.cap + AMOUNT_EPSILON
    }
}

pub(crate) fn percent(spent: f64, cap: f64) -> f64 {
    if cap <= AMOUNT_EPSILON {
        if spent > AMOUNT_EPSILON { 100.0 } else { 0.0 }
    } else {
        spent / cap * 100.0
    }
}

/// Outcome of a pessimistic reservation check.
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveDecision {
    Allow,
    Deny { requested: f64, spent: f64, cap: f64 },
}

impl ReserveDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Spend level of a category relative to its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    Normal,
    Warning,
    Critical,
    Exceeded,
}

impl BudgetLevel {
    pub fn classify(percent: f64, config: &BudgetConfig) -> Self {
        if percent >= 100.0 - AMOUNT_EPSILON {
            Self::Exceeded
        } else if percent >= config.critical_percent {
            Self::Critical
        } else if percent >= config.warning_percent {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

impl fmt::Display for BudgetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Exceeded => "exceeded",
        };
        write!(f, "{}", s)
    }
}
