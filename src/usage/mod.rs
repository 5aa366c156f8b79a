//! Token and cost accounting per execution session.
//!
//! A [`Session`] is opened when the process starts and closed when it stops.
//! [`UsageTracker`] records every agent invocation into the live session;
//! [`SessionStore`] persists closed sessions so the budget ledger can compute
//! rolling aggregates across runs.

pub mod store;
pub use store::SessionStore;

use crate::agent::Usage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// One recorded agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl UsageEvent {
    pub fn from_usage(usage: &Usage) -> Self {
        Self {
            timestamp: Utc::now(),
            model: usage.model.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost: usage.cost,
            story_key: None,
            phase: None,
            category: None,
        }
    }

    pub fn for_phase(mut self, story_key: &str, phase: &str, category: &str) -> Self {
        self.story_key = Some(story_key.to_string());
        self.phase = Some(phase.to_string());
        self.category = Some(category.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTotals {
    pub total_tokens: u64,
    pub cost: f64,
}

/// Usage of one process run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelUsage>,
    #[serde(default)]
    pub totals: SessionTotals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_key: Option<String>,
}

impl Session {
    pub fn new(story_key: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            start: Utc::now(),
            end: None,
            models: BTreeMap::new(),
            totals: SessionTotals::default(),
            story_key: story_key.map(String::from),
        }
    }

    pub fn record(&mut self, event: &UsageEvent) {
        let model = if event.model.is_empty() {
            "unknown".to_string()
        } else {
            event.model.clone()
        };
        let entry = self.models.entry(model).or_default();
        entry.input_tokens += event.input_tokens;
        entry.output_tokens += event.output_tokens;
        entry.cost += event.cost;

        self.totals.total_tokens += event.input_tokens + event.output_tokens;
        self.totals.cost += event.cost;
    }

    pub fn close(&mut self) {
        if self.end.is_none() {
            self.end = Some(Utc::now());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.end.is_some()
    }

    /// Date-prefixed identifier used as the on-disk key.
    pub fn file_key(&self) -> String {
        format!("{}_{}", self.start.format("%Y-%m-%d"), &self.id.to_string()[..8])
    }
}

/// Records usage events into the live session.
///
/// Shared by reference between the scheduler and collaboration strategies;
/// the session is guarded internally.
#[derive(Debug)]
pub struct UsageTracker {
    session: Mutex<Session>,
    events: Mutex<Vec<UsageEvent>>,
}

impl UsageTracker {
    pub fn new(story_key: Option<&str>) -> Self {
        Self {
            session: Mutex::new(Session::new(story_key)),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, event: UsageEvent) {
        if let Ok(mut session) = self.session.lock() {
            session.record(&event);
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Snapshot of the live session aggregate.
    pub fn session(&self) -> Session {
        self.session
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Stamp the session end and return the closed session.
    pub fn close(&self) -> Session {
        let mut session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        session.close();
        session.clone()
    }
}
