use super::{AMOUNT_EPSILON, BudgetConfig, BudgetEntry, BudgetLevel, ReserveDecision, percent};
use crate::usage::Session;
use crate::usage::store::total_cost_since;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

/// A commit that pushed a category past its cap.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetOverrun {
    pub category: String,
    pub spent: f64,
    pub cap: f64,
}

/// Informational spend across historical sessions. Never gates `reserve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingAggregate {
    pub window_days: u32,
    pub baseline_offset: f64,
    pub session_cost: f64,
    pub total: f64,
}

#[derive(Debug, Default)]
struct StoryBudget {
    entries: BTreeMap<String, BudgetEntry>,
    overruns: Vec<BudgetOverrun>,
}

/// Shared budget ledger.
///
/// Mutation of one story's entries is serialized by that story's mutex;
/// stories never contend with each other. The outer map is only
/// write-locked when a story is opened or closed.
#[derive(Debug)]
pub struct BudgetLedger {
    config: BudgetConfig,
    stories: RwLock<HashMap<String, Arc<Mutex<StoryBudget>>>>,
}

impl BudgetLedger {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            stories: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Register (or rehydrate) a story's budget entries.
    ///
    /// Caps come from `entries`. If the story is already open, each
    /// category keeps the larger of its recorded and rehydrated spend, so a
    /// stale snapshot never gives back money already committed.
    pub fn open_story(&self, story: &str, entries: Vec<BudgetEntry>) {
        let mut entries: BTreeMap<String, BudgetEntry> = entries
            .into_iter()
            .map(|e| (e.category.clone(), e))
            .collect();
        if let Some(open) = self.story(story) {
            let open = open.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            for (category, recorded) in &open.entries {
                match entries.get_mut(category) {
                    Some(entry) if recorded.spent > entry.spent => {
                        warn!(story, category = %category, recorded = recorded.spent, rehydrated = entry.spent, "keeping recorded spend");
                        entry.spent = recorded.spent;
                    }
                    Some(_) => {}
                    None => {
                        entries.insert(category.clone(), recorded.clone());
                    }
                }
            }
        }
        let budget = StoryBudget {
            entries,
            overruns: Vec::new(),
        };
        let mut stories = self
            .stories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stories.insert(story.to_string(), Arc::new(Mutex::new(budget)));
    }

    pub fn close_story(&self, story: &str) {
        let mut stories = self
            .stories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stories.remove(story);
    }

    fn story(&self, story: &str) -> Option<Arc<Mutex<StoryBudget>>> {
        self.stories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(story)
            .cloned()
    }

    fn with_story<T>(&self, story: &str, f: impl FnOnce(&mut StoryBudget) -> T) -> Option<T> {
        let handle = self.story(story)?;
        let mut guard = handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(f(&mut guard))
    }

    /// Pessimistic check: denies if `spent + amount > cap`.
    ///
    /// Unknown stories or categories are denied against a zero cap. With
    /// `auto_stop` disabled a would-be denial is allowed and logged.
    pub fn reserve(&self, story: &str, category: &str, amount: f64) -> ReserveDecision {
        let (spent, cap) = self
            .with_story(story, |b| {
                b.entries
                    .get(category)
                    .map(|e| (e.spent, e.cap))
                    .unwrap_or((0.0, 0.0))
            })
            .unwrap_or((0.0, 0.0));

        if spent + amount <= cap + AMOUNT_EPSILON {
            return ReserveDecision::Allow;
        }
        if !self.config.auto_stop {
            warn!(
                story,
                category,
                requested = amount,
                spent,
                cap,
                "budget cap would be exceeded; continuing because auto_stop is off"
            );
            return ReserveDecision::Allow;
        }
        info!(story, category, requested = amount, spent, cap, "budget reservation denied");
        ReserveDecision::Deny {
            requested: amount,
            spent,
            cap,
        }
    }

    /// Record actual spend. Always applied; an overrun is signalled for the
    /// scheduler to drain with [`take_exceeded`](Self::take_exceeded).
    pub fn commit(&self, story: &str, category: &str, actual: f64) -> BudgetLevel {
        let actual = actual.max(0.0);
        let currency = self.config.currency.clone();
        let outcome = self.with_story(story, |b| {
            let entry = b
                .entries
                .entry(category.to_string())
                .or_insert_with(|| BudgetEntry::new(category, 0.0, &currency));
            let before = BudgetLevel::classify(entry.usage_percent(), &self.config);
            entry.spent += actual;
            let after = BudgetLevel::classify(entry.usage_percent(), &self.config);
            let (spent, cap, overrun) = (entry.spent, entry.cap, entry.is_overrun());
            if overrun {
                b.overruns.push(BudgetOverrun {
                    category: category.to_string(),
                    spent,
                    cap,
                });
            }
            (before, after, spent, cap, overrun)
        });

        let Some((before, after, spent, cap, overrun)) = outcome else {
            warn!(story, category, actual, "commit for unknown story ignored");
            return BudgetLevel::Normal;
        };

        if overrun {
            warn!(story, category, spent, cap, "budget overrun committed");
        } else if after > before && after >= BudgetLevel::Warning {
            warn!(
                story,
                category,
                level = %after,
                percent = percent(spent, cap),
                "budget threshold crossed"
            );
        }
        after
    }

    /// Drain overrun signals raised since the last call.
    pub fn take_exceeded(&self, story: &str) -> Vec<BudgetOverrun> {
        self.with_story(story, |b| std::mem::take(&mut b.overruns))
            .unwrap_or_default()
    }

    pub fn entries(&self, story: &str) -> Vec<BudgetEntry> {
        self.with_story(story, |b| b.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entry(&self, story: &str, category: &str) -> Option<BudgetEntry> {
        self.with_story(story, |b| b.entries.get(category).cloned())
            .flatten()
    }

    pub fn remaining(&self, story: &str, category: &str) -> f64 {
        self.entry(story, category)
            .map(|e| e.remaining())
            .unwrap_or(0.0)
    }

    pub fn usage_percent(&self, story: &str, category: &str) -> f64 {
        self.entry(story, category)
            .map(|e| e.usage_percent())
            .unwrap_or(0.0)
    }

    /// Spend over cap for one category, aggregated across all open stories.
    pub fn category_usage_percent(&self, category: &str) -> f64 {
        let handles: Vec<_> = self
            .stories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let (spent, cap) = handles
            .iter()
            .filter_map(|h| {
                let guard = h.lock().ok()?;
                guard.entries.get(category).map(|e| (e.spent, e.cap))
            })
            .fold((0.0, 0.0), |(s, c), (es, ec)| (s + es, c + ec));
        percent(spent, cap)
    }

    pub fn threshold(&self, story: &str, category: &str) -> BudgetLevel {
        BudgetLevel::classify(self.usage_percent(story, category), &self.config)
    }

    /// Spend inside the rolling window plus the baseline offset.
    pub fn rolling_aggregate(&self, sessions: &[Session], now: DateTime<Utc>) -> RollingAggregate {
        let cutoff = now - Duration::days(i64::from(self.config.rolling_window_days));
        let session_cost = total_cost_since(sessions, cutoff);
        RollingAggregate {
            window_days: self.config.rolling_window_days,
            baseline_offset: self.config.baseline_offset,
            session_cost,
            total: session_cost + self.config.baseline_offset,
        }
    }
}
