//! Shared types for concierge-core

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Domain a sub-task belongs to. Routing happens per domain, so the
/// taxonomy is closed; anything a classifier invents outside it is
/// folded into `General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Communication,
    Productivity,
    Lifestyle,
    Travel,
    General,
}

impl Domain {
    /// All known domains, in taxonomy order
    pub const ALL: [Domain; 5] = [
        Domain::Communication,
        Domain::Productivity,
        Domain::Lifestyle,
        Domain::Travel,
        Domain::General,
    ];

    /// Parse a domain name (case-insensitive). Unknown names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "communication" => Some(Self::Communication),
            "productivity" => Some(Self::Productivity),
            "lifestyle" => Some(Self::Lifestyle),
            "travel" => Some(Self::Travel),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Communication => write!(f, "communication"),
            Self::Productivity => write!(f, "productivity"),
            Self::Lifestyle => write!(f, "lifestyle"),
            Self::Travel => write!(f, "travel"),
            Self::General => write!(f, "general"),
        }
    }
}

/// One independently schedulable unit decomposed from a multi-goal request.
/// Immutable once produced by the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTask {
    pub id: u32,
    pub description: String,
    pub domain: Domain,
    /// Ids of sub-tasks that must complete before this one may start
    #[serde(default)]
    pub depends_on: BTreeSet<u32>,
}

impl SubTask {
    /// Convenience constructor for a task with no dependencies
    pub fn new(id: u32, description: impl Into<String>, domain: Domain) -> Self {
        Self {
            id,
            description: description.into(),
            domain,
            depends_on: BTreeSet::new(),
        }
    }

    /// Add a dependency (builder style)
    pub fn depends_on(mut self, id: u32) -> Self {
        self.depends_on.insert(id);
        self
    }
}

/// Whether a request carries one goal or several independent ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentType {
    Single,
    Multi,
}

/// Result of classifying a raw user message.
///
/// Invariant: `intent_type == Multi` implies `sub_tasks.len() >= 2`.
/// Anything that cannot uphold that is downgraded to `Single` with empty
/// sub-tasks. Decomposition is forfeited, never forced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub intent_type: IntentType,
    /// Validated taxonomy names, or `["all"]` when nothing survived validation
    pub domains: Vec<String>,
    pub sub_tasks: Vec<SubTask>,
    pub raw_message: String,
}

impl IntentAnalysis {
    /// The safe fallback: a single-intent analysis spanning all domains.
    /// Used whenever classification is ambiguous or fails outright.
    pub fn fallback(raw_message: impl Into<String>) -> Self {
        Self {
            intent_type: IntentType::Single,
            domains: vec!["all".to_string()],
            sub_tasks: Vec::new(),
            raw_message: raw_message.into(),
        }
    }
}

/// Terminal status of one executed sub-task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Error,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Outcome of one sub-task, read-only once produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskResult {
    pub sub_task_id: u32,
    pub description: String,
    pub response: String,
    pub status: TaskStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub token_usage: HashMap<String, u64>,
}

/// Aggregate status of a batch of executed units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Partial,
    Failed,
}

impl ExecutionStatus {
    /// Aggregation rule shared by the executor and the hub: no failures is
    /// `Completed`, no successes is `Failed`, anything in between `Partial`.
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        if failed == 0 {
            Self::Completed
        } else if succeeded == 0 {
            Self::Failed
        } else {
            Self::Partial
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
