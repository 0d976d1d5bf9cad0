//! Candidate selection: which waiting process should a polling executor get.

use colony_core::config::{SchedulerConfig, SelectionPolicy};
use colony_core::error::{ColonyError, Result};
use colony_core::traits::{CandidateQuery, ProcessStore};
use colony_core::types::{Executor, Process, Resources};
use std::sync::Arc;

#[derive(Clone)]
pub struct Scheduler {
    processes: Arc<dyn ProcessStore>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(processes: Arc<dyn ProcessStore>, config: SchedulerConfig) -> Self {
        Self { processes, config }
    }

    pub fn candidate_limit(&self) -> usize {
        self.config.candidate_limit.max(1)
    }

    /// The single best candidate, or `NotFound` when nothing matches.
    pub async fn select(&self, colony_name: &str, executor: &Executor, resources: &Resources) -> Result<Process> {
        self.prioritize(colony_name, executor, resources, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ColonyError::NotFound(format!(
                    "no candidates for executor '{}' in colony '{}'",
                    executor.name, colony_name
                ))
            })
    }

    /// Up to `count` candidates, ascending by priority time.
    pub async fn prioritize(
        &self,
        colony_name: &str,
        executor: &Executor,
        resources: &Resources,
        count: usize,
    ) -> Result<Vec<Process>> {
        if !executor.approved {
            return Err(ColonyError::Validation(format!(
                "executor '{}' is not approved",
                executor.name
            )));
        }
        if executor.colony_name != colony_name {
            return Err(ColonyError::Validation(format!(
                "executor '{}' is not a member of colony '{}'",
                executor.name, colony_name
            )));
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let query = CandidateQuery {
            colony_name: colony_name.to_string(),
            executor_name: executor.name.clone(),
            executor_type: executor.executor_type.clone(),
            location_name: executor.location_name.clone(),
            resources: *resources,
            limit: count.max(self.candidate_limit()),
        };

        let keep = |p: &Process| {
            p.colony_name() == colony_name && p.spec.conditions.location_matches(&executor.location_name)
        };
        let mut named = self.processes.find_candidates_by_name(&query).await?;
        named.retain(|p| keep(p));
        let mut open = self.processes.find_candidates(&query).await?;
        open.retain(|p| keep(p));

        let mut candidates = match self.config.selection_policy {
            SelectionPolicy::MergeByPriority => {
                named.append(&mut open);
                named.sort_by_key(|p| p.priority_time);
                named
            }
            SelectionPolicy::PreferNamed => {
                named.sort_by_key(|p| p.priority_time);
                open.sort_by_key(|p| p.priority_time);
                named.append(&mut open);
                named
            }
        };
        candidates.truncate(count);

        tracing::debug!(
            "🔎 {} candidate(s) for executor '{}' in colony '{}'",
            candidates.len(),
            executor.name,
            colony_name
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use colony_core::types::FunctionSpec;
    use colony_store::MemoryStore;

    fn executor() -> Executor {
        Executor::new("worker-1", "cli", "dev")
    }

    fn scheduler(store: Arc<MemoryStore>, policy: SelectionPolicy) -> Scheduler {
        Scheduler::new(
            store,
            SchedulerConfig {
                candidate_limit: 10,
                selection_policy: policy,
            },
        )
    }

    #[tokio::test]
    async fn test_select_empty_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let s = scheduler(store, SelectionPolicy::MergeByPriority);
        let err = s.select("dev", &executor(), &Resources::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_select_only_returns_own_colony() {
        let store = Arc::new(MemoryStore::new());
        store.add_process(&Process::new(FunctionSpec::new("a", "prod", "cli"))).await.unwrap();
        let mine = Process::new(FunctionSpec::new("b", "dev", "cli"));
        store.add_process(&mine).await.unwrap();

        let s = scheduler(store, SelectionPolicy::MergeByPriority);
        for colony in ["dev", "prod"] {
            let member = Executor::new("worker-1", "cli", colony);
            let picked = s.select(colony, &member, &Resources::default()).await.unwrap();
            assert_eq!(picked.colony_name(), colony);
        }
    }

    #[tokio::test]
    async fn test_prioritize_is_sorted_and_stable() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut ids = Vec::new();
        for (name, prio) in [("t1", 0), ("t2", 0), ("urgent", 2), ("t3", 0)] {
            let p = Process::new_at(FunctionSpec::new(name, "dev", "cli").with_priority(prio), now);
            ids.push(p.id.clone());
            store.add_process(&p).await.unwrap();
        }

        let s = scheduler(store, SelectionPolicy::MergeByPriority);
        let out = s.prioritize("dev", &executor(), &Resources::default(), 10).await.unwrap();
        let names: Vec<&str> = out.iter().map(|p| p.spec.func_name.as_str()).collect();
        assert_eq!(names, vec!["urgent", "t1", "t2", "t3"]);
        assert!(out.windows(2).all(|w| w[0].priority_time <= w[1].priority_time));

        let two = s.prioritize("dev", &executor(), &Resources::default(), 2).await.unwrap();
        assert_eq!(two.len(), 2);
    }

    #[tokio::test]
    async fn test_named_and_open_are_merged_by_priority() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let open_old = Process::new_at(FunctionSpec::new("open", "dev", "cli"), now - chrono::Duration::seconds(5));
        let named_new = Process::new_at(
            FunctionSpec::new("named", "dev", "cli").with_executor_names(&["worker-1"]),
            now,
        );
        let not_mine = Process::new_at(
            FunctionSpec::new("other", "dev", "cli").with_executor_names(&["worker-9"]),
            now,
        );
        for p in [&open_old, &named_new, &not_mine] {
            store.add_process(p).await.unwrap();
        }

        let merged = scheduler(store.clone(), SelectionPolicy::MergeByPriority)
            .prioritize("dev", &executor(), &Resources::default(), 10)
            .await
            .unwrap();
        let names: Vec<&str> = merged.iter().map(|p| p.spec.func_name.as_str()).collect();
        assert_eq!(names, vec!["open", "named"]);

        let preferred = scheduler(store, SelectionPolicy::PreferNamed)
            .prioritize("dev", &executor(), &Resources::default(), 10)
            .await
            .unwrap();
        let names: Vec<&str> = preferred.iter().map(|p| p.spec.func_name.as_str()).collect();
        assert_eq!(names, vec!["named", "open"]);
    }

    #[tokio::test]
    async fn test_location_filter() {
        let store = Arc::new(MemoryStore::new());
        let mut spec = FunctionSpec::new("pinned", "dev", "cli");
        spec.conditions.location_name = "lab".into();
        store.add_process(&Process::new(spec)).await.unwrap();

        let s = scheduler(store, SelectionPolicy::MergeByPriority);
        assert!(s.select("dev", &executor().at_location("LAB"), &Resources::default()).await.is_ok());
        assert!(s.select("dev", &executor().at_location("cloud"), &Resources::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_unapproved_executor_rejected() {
        let store = Arc::new(MemoryStore::new());
        let s = scheduler(store, SelectionPolicy::MergeByPriority);
        let mut e = executor();
        e.approved = false;
        let err = s.prioritize("dev", &e, &Resources::default(), 1).await.unwrap_err();
        assert!(matches!(err, ColonyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_executor_outside_colony_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.add_process(&Process::new(FunctionSpec::new("a", "prod", "cli"))).await.unwrap();

        let s = scheduler(store, SelectionPolicy::MergeByPriority);
        let err = s.prioritize("prod", &executor(), &Resources::default(), 1).await.unwrap_err();
        assert!(matches!(err, ColonyError::Validation(_)));
        let err = s.select("prod", &executor(), &Resources::default()).await.unwrap_err();
        assert!(matches!(err, ColonyError::Validation(_)));
    }
}
