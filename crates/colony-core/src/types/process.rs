//! Process: one schedulable unit of work.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ColonyError, Result};

/// One priority point is worth a day of waiting.
const PRIORITY_STEP_NANOS: i64 = 24 * 60 * 60 * 1_000_000_000;

/// Upper bound for any user-supplied span in seconds (about a century).
pub const MAX_SPAN_SECS: i64 = 100 * 366 * 24 * 60 * 60;

/// Lifecycle state of a process (and, by aggregation, of a workflow graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Waiting,
    Running,
    Success,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(Self::Waiting),
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource amounts. On a process these are requirements, on an executor
/// request they are what the executor offers. Zero means "none".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Millicores.
    #[serde(default)]
    pub cpu: i64,
    /// MiB.
    #[serde(default)]
    pub memory: i64,
    /// MiB.
    #[serde(default)]
    pub storage: i64,
    #[serde(default)]
    pub nodes: i32,
    #[serde(default)]
    pub processes: i32,
    #[serde(default)]
    pub processes_per_node: i32,
}

impl Resources {
    /// True when every requirement is covered by `offer`.
    pub fn fits_within(&self, offer: &Resources) -> bool {
        self.cpu <= offer.cpu
            && self.memory <= offer.memory
            && self.storage <= offer.storage
            && self.nodes <= offer.nodes
            && self.processes <= offer.processes
            && self.processes_per_node <= offer.processes_per_node
    }
}

/// Placement constraints of a function spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    pub colony_name: String,
    pub executor_type: String,
    /// Explicit target executors. Empty means any executor of the type.
    #[serde(default)]
    pub executor_names: Vec<String>,
    /// Empty matches any executor location.
    #[serde(default)]
    pub location_name: String,
    #[serde(default)]
    pub resources: Resources,
    /// Node names of sibling function specs that must succeed first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Conditions {
    pub fn location_matches(&self, executor_location: &str) -> bool {
        self.location_name.is_empty() || self.location_name.eq_ignore_ascii_case(executor_location)
    }
}

/// What to run and where.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    #[serde(default)]
    pub node_name: String,
    pub func_name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub priority: i32,
    /// Seconds a process may wait for an executor. Zero disables the deadline.
    #[serde(default)]
    pub max_wait_time: i64,
    /// Seconds a process may run. Zero disables the deadline.
    #[serde(default)]
    pub max_exec_time: i64,
    #[serde(default)]
    pub max_retries: i32,
    #[serde(default)]
    pub label: String,
    pub conditions: Conditions,
}

impl FunctionSpec {
    pub fn new(func_name: &str, colony_name: &str, executor_type: &str) -> Self {
        Self {
            func_name: func_name.into(),
            conditions: Conditions {
                colony_name: colony_name.into(),
                executor_type: executor_type.into(),
                ..Conditions::default()
            },
            ..Self::default()
        }
    }

    pub fn with_node_name(mut self, node_name: &str) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.conditions.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_executor_names(mut self, names: &[&str]) -> Self {
        self.conditions.executor_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Reject wait/exec limits too large to turn into a deadline.
    pub fn check_time_limits(&self) -> Result<()> {
        for (field, secs) in [
            ("max_wait_time", self.max_wait_time),
            ("max_exec_time", self.max_exec_time),
        ] {
            check_span(field, secs)?;
        }
        Ok(())
    }
}

/// A unit of work and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    pub spec: FunctionSpec,
    pub state: ProcessState,
    /// Logical ordering key; lower runs first.
    pub priority_time: i64,
    pub submission_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub wait_deadline: Option<DateTime<Utc>>,
    pub exec_deadline: Option<DateTime<Utc>>,
    pub retries: i32,
    pub assigned_executor_id: Option<String>,
    pub wait_for_parents: bool,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    /// Parents that have not reached SUCCESS yet.
    pub pending_parents: Vec<String>,
    pub graph_id: Option<String>,
    pub input: Vec<serde_json::Value>,
    pub output: Vec<serde_json::Value>,
    pub errors: Vec<String>,
    /// Bumped by the store on every successful update.
    pub version: u64,
}

impl Process {
    pub fn new(spec: FunctionSpec) -> Self {
        Self::new_at(spec, Utc::now())
    }

    pub fn new_at(spec: FunctionSpec, submitted: DateTime<Utc>) -> Self {
        let priority_time = priority_time(submitted, spec.priority);
        let wait_deadline = deadline(submitted, spec.max_wait_time);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            spec,
            state: ProcessState::Waiting,
            priority_time,
            submission_time: submitted,
            start_time: None,
            end_time: None,
            wait_deadline,
            exec_deadline: None,
            retries: 0,
            assigned_executor_id: None,
            wait_for_parents: false,
            parents: Vec::new(),
            children: Vec::new(),
            pending_parents: Vec::new(),
            graph_id: None,
            input: Vec::new(),
            output: Vec::new(),
            errors: Vec::new(),
            version: 0,
        }
    }

    pub fn colony_name(&self) -> &str {
        &self.spec.conditions.colony_name
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned_executor_id.is_some()
    }

    /// Whether an executor could claim this process right now.
    pub fn is_claimable(&self) -> bool {
        self.state == ProcessState::Waiting && !self.is_assigned() && !self.wait_for_parents
    }

    /// FAILED with no retries left.
    pub fn is_terminally_failed(&self) -> bool {
        self.state == ProcessState::Failed && self.retries >= self.spec.max_retries
    }

    /// Wait is submission to start, exec is start to end.
    pub fn timings(&self) -> Timings {
        let wait = self
            .start_time
            .map(|s| s - self.submission_time)
            .unwrap_or_else(Duration::zero);
        let exec = match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => e - s,
            _ => Duration::zero(),
        };
        Timings { wait, exec }
    }

    /// Apply a claim to this in-memory copy. Stores use it after their
    /// conditional write succeeded.
    pub fn apply_claim(&mut self, executor_id: &str, at: DateTime<Utc>) {
        self.state = ProcessState::Running;
        self.assigned_executor_id = Some(executor_id.to_string());
        self.start_time = Some(at);
        self.end_time = None;
        self.exec_deadline = deadline(at, self.spec.max_exec_time);
    }
}

/// Measured durations of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub wait: Duration,
    pub exec: Duration,
}

pub fn priority_time(submitted: DateTime<Utc>, priority: i32) -> i64 {
    let base = submitted.timestamp_nanos_opt().unwrap_or(i64::MAX);
    base.saturating_sub(i64::from(priority).saturating_mul(PRIORITY_STEP_NANOS))
}

/// `from + secs`, or `None` when the instant is out of range.
pub fn checked_offset(from: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(secs).and_then(|d| from.checked_add_signed(d))
}

/// Validation error for a span outside `..= MAX_SPAN_SECS`.
pub fn check_span(field: &str, secs: i64) -> Result<()> {
    if secs > MAX_SPAN_SECS {
        return Err(ColonyError::Validation(format!(
            "{field} of {secs}s exceeds the limit of {MAX_SPAN_SECS}s"
        )));
    }
    Ok(())
}

pub fn deadline(from: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    if secs > 0 { checked_offset(from, secs) } else { None }
}
