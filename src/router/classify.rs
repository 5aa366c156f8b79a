//! Keyword classification of task descriptions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Critical,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Trivial => "trivial",
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Bugfix,
    Security,
    Feature,
    Refactor,
    Performance,
    Documentation,
    Testing,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bugfix => "bugfix",
            Self::Security => "security",
            Self::Feature => "feature",
            Self::Refactor => "refactor",
            Self::Performance => "performance",
            Self::Documentation => "documentation",
            Self::Testing => "testing",
        };
        write!(f, "{}", s)
    }
}

impl TaskType {
    /// Default agent set for this type of task, lead agent first.
    pub fn default_agents(self) -> Vec<String> {
        let ids: &[&str] = match self {
            Self::Security => &["security", "architect", "reviewer"],
            Self::Bugfix => &["developer", "tester", "reviewer"],
            Self::Feature => &["developer", "reviewer", "architect"],
            Self::Refactor => &["architect", "developer", "reviewer"],
            Self::Performance => &["architect", "developer", "tester"],
            Self::Documentation => &["tech-writer", "reviewer"],
            Self::Testing => &["tester", "developer"],
        };
        ids.iter().map(|s| s.to_string()).collect()
    }
}

/// Result of classifying a task description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub complexity: Complexity,
    pub task_type: TaskType,
    pub matched_keywords: Vec<String>,
}

// Checked in order; the first type with a match wins.
const TYPE_PATTERNS: &[(TaskType, &str)] = &[
    (
        TaskType::Security,
        r"(?i)\b(security|vulnerab\w*|cve|xss|csrf|injection|auth\w*|secret\w*|encrypt\w*|permission\w*)\b",
    ),
    (
        TaskType::Bugfix,
        r"(?i)\b(fix\w*|bug\w*|crash\w*|broken|regression|error\w*|fail\w*)\b",
    ),
    (
        TaskType::Performance,
        r"(?i)\b(performance|slow|latency|optimi[sz]\w*|speed\w*|memory leak|throughput)\b",
    ),
    (
        TaskType::Refactor,
        r"(?i)\b(refactor\w*|clean\s?up|restructur\w*|simplif\w*|extract|rename)\b",
    ),
    (
        TaskType::Testing,
        r"(?i)\b(tests?|coverage|e2e|integration tests?|flaky)\b",
    ),
    (
        TaskType::Documentation,
        r"(?i)\b(docs?|documentation|readme|guide|changelog|typo)\b",
    ),
];

// Checked from most to least severe; the first tier with a match wins.
const COMPLEXITY_PATTERNS: &[(Complexity, &str)] = &[
    (
        Complexity::Critical,
        r"(?i)\b(critical|outage|data loss|breach|payment\w*|production incident)\b",
    ),
    (
        Complexity::Complex,
        r"(?i)\b(architecture|migrat\w*|distributed|redesign|concurren\w*|multi-service|overhaul)\b",
    ),
    (
        Complexity::Moderate,
        r"(?i)\b(integrat\w*|api|endpoint\w*|database|schema|workflow|feature)\b",
    ),
    (
        Complexity::Trivial,
        r"(?i)\b(typo|rename|comment|bump|whitespace|wording)\b",
    ),
];

fn compile<T: Copy>(patterns: &[(T, &str)]) -> Vec<(T, Regex)> {
    patterns
        .iter()
        .filter_map(|(tag, pattern)| Regex::new(pattern).ok().map(|re| (*tag, re)))
        .collect()
}

static TYPE_RULES: LazyLock<Vec<(TaskType, Regex)>> = LazyLock::new(|| compile(TYPE_PATTERNS));

static COMPLEXITY_RULES: LazyLock<Vec<(Complexity, Regex)>> =
    LazyLock::new(|| compile(COMPLEXITY_PATTERNS));

/// Word count above which an unclassified task is at least moderate.
const LONG_TASK_WORDS: usize = 60;

fn matches_of(re: &Regex, text: &str) -> Vec<String> {
    re.find_iter(text).map(|m| m.as_str().to_lowercase()).collect()
}

/// Classify a task by keyword. Pure: the same text always yields the same result.
pub fn classify(task: &str) -> Classification {
    let mut matched_keywords = Vec::new();

    let task_type = TYPE_RULES
        .iter()
        .find_map(|(task_type, re)| {
            let found = matches_of(re, task);
            (!found.is_empty()).then(|| {
                matched_keywords.extend(found);
                *task_type
            })
        })
        .unwrap_or(TaskType::Feature);

    let complexity = COMPLEXITY_RULES
        .iter()
        .find_map(|(complexity, re)| {
            let found = matches_of(re, task);
            (!found.is_empty()).then(|| {
                matched_keywords.extend(found);
                *complexity
            })
        })
        .unwrap_or_else(|| {
            if task.split_whitespace().count() > LONG_TASK_WORDS {
                Complexity::Moderate
            } else {
                Complexity::Simple
            }
        });

    matched_keywords.dedup();
    Classification {
        complexity,
        task_type,
        matched_keywords,
    }
}
