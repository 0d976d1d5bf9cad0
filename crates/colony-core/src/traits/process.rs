//! Repository contract for processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Process, Resources};

/// Filter for candidate lookups. `executor_name` is only used by
/// [`ProcessStore::find_candidates_by_name`].
#[derive(Debug, Clone, Default)]
pub struct CandidateQuery {
    pub colony_name: String,
    pub executor_name: String,
    pub executor_type: String,
    pub location_name: String,
    pub resources: Resources,
    pub limit: usize,
}

impl CandidateQuery {
    /// Everything except the executor-name rule: WAITING, unassigned, not
    /// blocked on parents, same colony and type, requirements within the
    /// offered resources and a compatible location.
    pub fn matches_base(&self, p: &Process) -> bool {
        let c = &p.spec.conditions;
        p.is_claimable()
            && c.colony_name == self.colony_name
            && c.executor_type == self.executor_type
            && c.resources.fits_within(&self.resources)
            && c.location_matches(&self.location_name)
    }

    /// Open-pool candidate: no explicit executor names.
    pub fn matches_open(&self, p: &Process) -> bool {
        self.matches_base(p) && p.spec.conditions.executor_names.is_empty()
    }

    /// Named candidate: lists this executor explicitly.
    pub fn matches_named(&self, p: &Process) -> bool {
        self.matches_base(p)
            && p
                .spec
                .conditions
                .executor_names
                .iter()
                .any(|n| n == &self.executor_name)
    }
}

#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn add_process(&self, process: &Process) -> Result<()>;

    async fn get_process(&self, id: &str) -> Result<Option<Process>>;

    /// Open-pool candidates ordered by priority time, ties in insertion order.
    async fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<Process>>;

    /// Candidates naming `query.executor_name`, same ordering.
    async fn find_candidates_by_name(&self, query: &CandidateQuery) -> Result<Vec<Process>>;

    async fn find_processes_by_graph(&self, graph_id: &str) -> Result<Vec<Process>>;

    /// Atomically move a claimable process to RUNNING for `executor_id`.
    /// Returns `Conflict` if the process is no longer claimable.
    async fn claim_process(&self, id: &str, executor_id: &str, at: DateTime<Utc>) -> Result<Process>;

    /// Store `process` if the stored version still equals `expected_version`.
    /// Returns the stored copy with its bumped version.
    async fn update_process(&self, process: &Process, expected_version: u64) -> Result<Process>;
}
