//! Cron engine: time-driven workflow instantiation with optional
//! coalescing behind the previous graph.

use chrono::{DateTime, Utc};
use colony_core::error::{ColonyError, Result};
use colony_core::traits::Stores;
use colony_core::types::{Cron, CronSchedule, WorkflowGraph};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::cron;
use crate::generator::SweepReport;
use crate::graph::{GraphEngine, MAX_CAS_ATTEMPTS, gave_up};

/// Seconds a claimed but not yet stored graph keeps the gate closed.
const PENDING_GRACE_SECS: i64 = 60;

pub struct CronEngine {
    stores: Stores,
    graphs: GraphEngine,
    period: Duration,
    sweep_lock: Mutex<()>,
}

impl CronEngine {
    pub fn new(stores: Stores, graphs: GraphEngine, period: Duration) -> Self {
        Self {
            stores,
            graphs,
            period,
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn cron_period(&self) -> Duration {
        self.period
    }

    /// Next fire time of `expr` after now.
    pub fn next(&self, expr: &str) -> Result<DateTime<Utc>> {
        cron::next(expr)
    }

    /// Jittered fire time in `[now, next(expr))`.
    pub fn random(&self, expr: &str) -> Result<DateTime<Utc>> {
        cron::random(expr)
    }

    pub async fn add_cron(&self, mut cron: Cron) -> Result<Cron> {
        if cron.name.trim().is_empty() {
            return Err(ColonyError::Validation("cron name is empty".into()));
        }
        if let CronSchedule::Expression(expr) = cron.schedule()? {
            cron::parse(&expr)?;
        }
        cron.workflow_spec.validate()?;
        if cron.colony_name != cron.workflow_spec.colony_name {
            return Err(ColonyError::Validation(format!(
                "cron '{}' belongs to colony '{}' but its workflow targets '{}'",
                cron.name, cron.colony_name, cron.workflow_spec.colony_name
            )));
        }
        if self
            .stores
            .crons
            .find_cron_by_name(&cron.colony_name, &cron.name)
            .await?
            .is_some()
        {
            return Err(ColonyError::Conflict(format!(
                "cron '{}' already exists in colony '{}'",
                cron.name, cron.colony_name
            )));
        }

        cron.next_run = None;
        cron.last_run = None;
        cron.prev_graph_id = None;
        cron.version = 0;
        self.stores.crons.add_cron(&cron).await?;
        tracing::info!(
            "⏰ Cron added: '{}' ({}) {}",
            cron.name,
            cron.id,
            describe(&cron)
        );
        Ok(cron)
    }

    pub async fn get_cron(&self, id: &str) -> Result<Cron> {
        self.stores
            .crons
            .get_cron(id)
            .await?
            .ok_or_else(|| ColonyError::NotFound(format!("cron {id}")))
    }

    pub async fn get_cron_by_name(&self, colony_name: &str, name: &str) -> Result<Cron> {
        self.stores
            .crons
            .find_cron_by_name(colony_name, name)
            .await?
            .ok_or_else(|| ColonyError::NotFound(format!("cron '{name}' in colony '{colony_name}'")))
    }

    pub async fn list_crons(&self) -> Result<Vec<Cron>> {
        self.stores.crons.list_crons().await
    }

    pub async fn remove_cron(&self, id: &str) -> Result<()> {
        if self.stores.crons.remove_cron(id).await? {
            tracing::info!("🗑️ Cron removed: {}", id);
            Ok(())
        } else {
            Err(ColonyError::NotFound(format!("cron {id}")))
        }
    }

    /// Fire a cron now, regardless of its next run. Returns `None` when the
    /// previous graph is still running and the cron waits for it.
    pub async fn run_cron(&self, id: &str) -> Result<Option<WorkflowGraph>> {
        let cron = self.get_cron(id).await?;
        self.fire(&cron, Utc::now()).await
    }

    pub async fn tick(&self) -> SweepReport {
        self.tick_at(Utc::now()).await
    }

    /// One sweep over every cron.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        let mut report = SweepReport::default();

        let crons = match self.stores.crons.list_crons().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("❌ Cron sweep could not list crons: {e}");
                report.failures += 1;
                return report;
            }
        };

        for cron in crons {
            match self.evaluate(&cron, now).await {
                Ok(Some(graph)) => report.graphs.push(graph.id),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("⚠️ Cron '{}' skipped: {e}", cron.name);
                    report.failures += 1;
                }
            }
        }
        report
    }

    async fn evaluate(&self, cron: &Cron, now: DateTime<Utc>) -> Result<Option<WorkflowGraph>> {
        match cron.next_run {
            None => {
                let mut updated = cron.clone();
                updated.next_run = Some(cron::next_run(&cron.schedule()?, now)?);
                match self.stores.crons.update_cron(&updated, cron.version).await {
                    Ok(_) => {
                        tracing::debug!("⏰ Cron '{}' first run at {:?}", cron.name, updated.next_run);
                        Ok(None)
                    }
                    Err(e) if e.is_retryable() => Ok(None),
                    Err(e) => Err(e),
                }
            }
            Some(due) if due <= now => self.fire(cron, now).await,
            Some(_) => Ok(None),
        }
    }

    /// The gate: free unless the cron waits for a previous graph that has
    /// not reached a terminal state. A claimed graph that is not stored yet
    /// counts as running for `PENDING_GRACE_SECS`.
    async fn blocked(&self, cron: &Cron, now: DateTime<Utc>) -> Result<bool> {
        if !cron.wait_for_prev_graph {
            return Ok(false);
        }
        let Some(prev_id) = &cron.prev_graph_id else {
            return Ok(false);
        };
        match self.graphs.refresh(prev_id).await {
            Ok(graph) => Ok(!graph.state.is_terminal()),
            Err(e) if e.is_not_found() => Ok(cron
                .last_run
                .is_some_and(|t| now.signed_duration_since(t) < chrono::Duration::seconds(PENDING_GRACE_SECS))),
            Err(e) => Err(e),
        }
    }

    async fn fire(&self, cron: &Cron, now: DateTime<Utc>) -> Result<Option<WorkflowGraph>> {
        match self.claim(cron, now).await? {
            Some(graph) => self.launch(cron, graph).await.map(Some),
            None => Ok(None),
        }
    }

    /// Advance the schedule and record the graph about to be built in one
    /// compare-and-swap. Losing the swap means someone else fired.
    async fn claim(&self, cron: &Cron, now: DateTime<Utc>) -> Result<Option<WorkflowGraph>> {
        if self.blocked(cron, now).await? {
            tracing::debug!("⏸️ Cron '{}' waits for graph {:?}", cron.name, cron.prev_graph_id);
            return Ok(None);
        }

        let graph = WorkflowGraph::new(&cron.colony_name, now);
        let mut claimed = cron.clone();
        claimed.last_run = Some(now);
        claimed.next_run = Some(cron::next_run(&cron.schedule()?, now)?);
        claimed.prev_graph_id = Some(graph.id.clone());
        match self.stores.crons.update_cron(&claimed, cron.version).await {
            Ok(_) => Ok(Some(graph)),
            Err(e) if e.is_retryable() => {
                tracing::debug!("⏰ Cron '{}' already fired elsewhere", cron.name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Build the claimed graph. On failure the claim is rolled back so the
    /// gate does not wait for a graph that will never exist.
    async fn launch(&self, cron: &Cron, graph: WorkflowGraph) -> Result<WorkflowGraph> {
        let graph_id = graph.id.clone();
        let built = match self.previous_outputs(cron).await {
            Ok(root_input) => {
                self.graphs
                    .instantiate(graph, &cron.workflow_spec, Vec::new(), root_input)
                    .await
            }
            Err(e) => Err(e),
        };

        match built {
            Ok(graph) => {
                tracing::info!("⏰ Cron '{}' triggered graph {}", cron.name, graph.id);
                Ok(graph)
            }
            Err(e) => {
                if let Err(undo) = self.release_claim(&cron.id, &graph_id, cron.prev_graph_id.clone()).await {
                    tracing::error!("❌ Cron '{}' could not release graph {}: {undo}", cron.name, graph_id);
                }
                Err(e)
            }
        }
    }

    async fn previous_outputs(&self, cron: &Cron) -> Result<Vec<serde_json::Value>> {
        let Some(prev_id) = &cron.prev_graph_id else {
            return Ok(Vec::new());
        };
        match self.graphs.leaf_outputs(prev_id).await {
            Ok(outputs) => Ok(outputs),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn release_claim(&self, cron_id: &str, graph_id: &str, previous: Option<String>) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut cron = self.get_cron(cron_id).await?;
            if cron.prev_graph_id.as_deref() != Some(graph_id) {
                return Ok(());
            }
            let expected = cron.version;
            cron.prev_graph_id = previous.clone();
            match self.stores.crons.update_cron(&cron, expected).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(gave_up(&format!("claim release of cron {cron_id}")))
    }
}

fn describe(cron: &Cron) -> String {
    match cron.schedule() {
        Ok(CronSchedule::Expression(expr)) => format!("expression '{expr}'"),
        Ok(CronSchedule::Interval { secs, random: false }) => format!("every {secs}s"),
        Ok(CronSchedule::Interval { secs, random: true }) => format!("randomly within {secs}s"),
        Err(_) => "invalid schedule".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessEngine;
    use crate::scheduler::Scheduler;
    use colony_core::config::SchedulerConfig;
    use colony_core::types::{Executor, FunctionSpec, ProcessState, Resources, WorkflowSpec};
    use colony_store::MemoryStore;
    use serde_json::Value;
    use std::sync::Arc;

    struct Fixture {
        crons: CronEngine,
        processes: ProcessEngine,
        graphs: GraphEngine,
    }

    fn fixture() -> Fixture {
        let stores = Stores::from_backend(Arc::new(MemoryStore::new()));
        let graphs = GraphEngine::new(stores.clone());
        let scheduler = Scheduler::new(stores.processes.clone(), SchedulerConfig::default());
        Fixture {
            crons: CronEngine::new(stores.clone(), graphs.clone(), Duration::from_secs(1)),
            processes: ProcessEngine::new(stores, scheduler, graphs.clone()),
            graphs,
        }
    }

    fn workflow() -> WorkflowSpec {
        WorkflowSpec::new("dev").with(FunctionSpec::new("backup", "dev", "cli").with_node_name("backup"))
    }

    async fn finish(f: &Fixture, graph_id: &str, output: &str) {
        let graph = f.graphs.get_graph(graph_id).await.unwrap();
        for member in f.graphs.members(&graph).await.unwrap() {
            let executor = Executor::new("worker", "cli", "dev");
            let claimed = f.processes.claim(&executor.id, &member.id).await.unwrap();
            f.processes
                .close_successful(&claimed.id, vec![Value::from(output)])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_add_cron_validation() {
        let f = fixture();
        assert!(f.crons.add_cron(Cron::with_expression("", "@daily", workflow())).await.is_err());
        assert!(f.crons.add_cron(Cron::with_expression("c", "not valid", workflow())).await.is_err());
        assert!(f.crons.add_cron(Cron::with_interval("c", 0, false, workflow())).await.is_err());
        let huge = f.crons.add_cron(Cron::with_interval("big", i64::MAX / 2, false, workflow())).await;
        assert!(matches!(huge, Err(ColonyError::Validation(_))));
        assert!(f.crons.tick().await.graphs.is_empty());
        assert!(f.crons.add_cron(Cron::with_interval("c", 10, false, WorkflowSpec::new("dev"))).await.is_err());

        let mut random_expr = Cron::with_expression("c", "@daily", workflow());
        random_expr.random = true;
        let err = f.crons.add_cron(random_expr).await.unwrap_err();
        assert!(matches!(err, ColonyError::Validation(_)));

        f.crons.add_cron(Cron::with_expression("c", "*/5 * * * * *", workflow())).await.unwrap();
        let dup = f.crons.add_cron(Cron::with_interval("c", 5, true, workflow())).await.unwrap_err();
        assert!(matches!(dup, ColonyError::Conflict(_)));
        assert_eq!(f.crons.cron_period(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_first_evaluation_only_schedules() {
        let f = fixture();
        let cron = f.crons.add_cron(Cron::with_interval("c", 60, false, workflow())).await.unwrap();
        let now = Utc::now();

        assert!(f.crons.tick_at(now).await.graphs.is_empty());
        let stored = f.crons.get_cron(&cron.id).await.unwrap();
        assert_eq!(stored.next_run, Some(now + chrono::Duration::seconds(60)));
        assert!(stored.last_run.is_none());
    }

    #[tokio::test]
    async fn test_interval_cron_fires_when_due() {
        let f = fixture();
        let cron = f.crons.add_cron(Cron::with_interval("c", 60, false, workflow())).await.unwrap();
        let now = Utc::now();
        f.crons.tick_at(now).await;

        assert!(f.crons.tick_at(now + chrono::Duration::seconds(30)).await.graphs.is_empty());
        let due = now + chrono::Duration::seconds(60);
        let report = f.crons.tick_at(due).await;
        assert_eq!(report.graphs.len(), 1);

        let stored = f.crons.get_cron(&cron.id).await.unwrap();
        assert_eq!(stored.last_run, Some(due));
        assert_eq!(stored.next_run, Some(due + chrono::Duration::seconds(60)));
        assert_eq!(stored.prev_graph_id.as_deref(), Some(report.graphs[0].as_str()));
    }

    #[tokio::test]
    async fn test_run_cron_coalesces_behind_running_graph() {
        let f = fixture();
        let cron = f
            .crons
            .add_cron(Cron::with_interval("c", 3600, false, workflow()).waiting_for_prev(true))
            .await
            .unwrap();

        let first = f.crons.run_cron(&cron.id).await.unwrap().unwrap();
        assert!(f.crons.run_cron(&cron.id).await.unwrap().is_none());
        assert!(f.crons.run_cron(&cron.id).await.unwrap().is_none());
        assert_eq!(f.graphs.list_graphs("dev").await.unwrap().len(), 1);

        finish(&f, &first.id, "snapshot-1").await;
        assert_eq!(f.graphs.get_graph(&first.id).await.unwrap().state, ProcessState::Success);

        let second = f.crons.run_cron(&cron.id).await.unwrap().unwrap();
        assert!(f.crons.run_cron(&cron.id).await.unwrap().is_none());
        assert_eq!(f.graphs.list_graphs("dev").await.unwrap().len(), 2);

        let members = f.graphs.members(&second).await.unwrap();
        assert_eq!(members[0].input, vec![Value::from("snapshot-1")]);
    }

    #[tokio::test]
    async fn test_sweep_skips_missed_triggers() {
        let f = fixture();
        let cron = f
            .crons
            .add_cron(Cron::with_interval("c", 1, false, workflow()).waiting_for_prev(true))
            .await
            .unwrap();
        let start = Utc::now();
        f.crons.tick_at(start).await;

        let mut fired = Vec::new();
        for s in 1..=5 {
            fired.extend(f.crons.tick_at(start + chrono::Duration::seconds(s)).await.graphs);
        }
        assert_eq!(fired.len(), 1);

        finish(&f, &fired[0], "done").await;
        let later = start + chrono::Duration::seconds(6);
        assert_eq!(f.crons.tick_at(later).await.graphs.len(), 1);
        assert!(f.crons.tick_at(later).await.graphs.is_empty());
        assert_eq!(f.graphs.list_graphs("dev").await.unwrap().len(), 2);
        assert!(f.crons.get_cron(&cron.id).await.unwrap().next_run.unwrap() > later);
    }

    #[tokio::test]
    async fn test_failed_graph_releases_gate() {
        let f = fixture();
        let cron = f
            .crons
            .add_cron(Cron::with_expression("c", "@hourly", workflow()).waiting_for_prev(true))
            .await
            .unwrap();
        let first = f.crons.run_cron(&cron.id).await.unwrap().unwrap();

        let executor = Executor::new("worker", "cli", "dev");
        let p = f.processes.assign("dev", &executor, &Resources::default()).await.unwrap();
        assert_eq!(p.graph_id.as_deref(), Some(first.id.as_str()));
        f.processes.mark_failed(&p.id, vec!["disk full".into()]).await.unwrap();

        assert!(f.crons.run_cron(&cron.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_without_waiting_every_run_fires() {
        let f = fixture();
        let cron = f.crons.add_cron(Cron::with_interval("c", 10, true, workflow())).await.unwrap();
        for _ in 0..3 {
            assert!(f.crons.run_cron(&cron.id).await.unwrap().is_some());
        }
        assert_eq!(f.graphs.list_graphs("dev").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_lookup_and_remove() {
        let f = fixture();
        let cron = f.crons.add_cron(Cron::with_expression("nightly", "0 0 3 * * *", workflow())).await.unwrap();
        assert_eq!(f.crons.get_cron_by_name("dev", "nightly").await.unwrap().id, cron.id);
        assert!(f.crons.get_cron_by_name("prod", "nightly").await.unwrap_err().is_not_found());
        assert!(f.crons.run_cron("missing").await.unwrap_err().is_not_found());

        f.crons.remove_cron(&cron.id).await.unwrap();
        assert!(f.crons.list_crons().await.unwrap().is_empty());
        assert!(f.crons.remove_cron(&cron.id).await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_next_and_random_helpers() {
        let f = fixture();
        let next = f.crons.next("0 * * * * *").unwrap();
        let jitter = f.crons.random("0 * * * * *").unwrap();
        assert!(jitter < next + chrono::Duration::seconds(60));
        assert!(f.crons.next("bogus").is_err());
    }

    #[tokio::test]
    async fn test_claimed_trigger_closes_gate_before_graph_exists() {
        let f = fixture();
        let cron = f
            .crons
            .add_cron(Cron::with_interval("c", 3600, false, workflow()).waiting_for_prev(true))
            .await
            .unwrap();
        let now = Utc::now();
        let before = f.crons.get_cron(&cron.id).await.unwrap();

        let pending = f.crons.claim(&before, now).await.unwrap().unwrap();
        let after = f.crons.get_cron(&cron.id).await.unwrap();
        assert_eq!(after.prev_graph_id.as_deref(), Some(pending.id.as_str()));

        // a caller that read the cron after the claim sees the pending graph
        assert!(f.crons.fire(&after, now).await.unwrap().is_none());
        assert!(f.crons.run_cron(&cron.id).await.unwrap().is_none());
        // a caller that read it before loses the swap
        assert!(f.crons.fire(&before, now).await.unwrap().is_none());

        let graph = f.crons.launch(&before, pending).await.unwrap();
        assert_eq!(f.graphs.list_graphs("dev").await.unwrap().len(), 1);
        assert!(f.crons.run_cron(&cron.id).await.unwrap().is_none());
        assert_eq!(f.graphs.get_graph(&graph.id).await.unwrap().state, ProcessState::Waiting);
    }

    #[tokio::test]
    async fn test_failed_launch_releases_claim() {
        let f = fixture();
        let broken = Cron::with_interval("broken", 60, false, WorkflowSpec::new("dev")).waiting_for_prev(true);
        f.crons.stores.crons.add_cron(&broken).await.unwrap();

        let err = f.crons.run_cron(&broken.id).await.unwrap_err();
        assert!(matches!(err, ColonyError::Validation(_)));
        let stored = f.crons.get_cron(&broken.id).await.unwrap();
        assert!(stored.prev_graph_id.is_none());
        assert!(stored.last_run.is_some());
        assert!(f.graphs.list_graphs("dev").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_cron_does_not_stop_sweep() {
        let f = fixture();
        let healthy = f.crons.add_cron(Cron::with_interval("healthy", 60, false, workflow())).await.unwrap();
        let mut corrupt = Cron::with_interval("corrupt", 60, false, workflow());
        corrupt.interval_secs = 0;
        f.crons.stores.crons.add_cron(&corrupt).await.unwrap();

        let start = Utc::now();
        assert_eq!(f.crons.tick_at(start).await.failures, 1);

        let report = f.crons.tick_at(start + chrono::Duration::seconds(60)).await;
        assert_eq!(report.failures, 1);
        assert_eq!(report.graphs.len(), 1);
        let stored = f.crons.get_cron(&healthy.id).await.unwrap();
        assert_eq!(stored.prev_graph_id.as_deref(), Some(report.graphs[0].as_str()));
    }
}
