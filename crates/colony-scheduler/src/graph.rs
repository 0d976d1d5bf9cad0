//! Workflow graph engine.
//!
//! Builds graphs from workflow specs, releases children when their parents
//! succeed, and rolls member states up into the graph's aggregate state.

use chrono::{DateTime, Utc};
use colony_core::error::{ColonyError, Result};
use colony_core::traits::Stores;
use colony_core::types::{Process, ProcessState, WorkflowGraph, WorkflowSpec};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Optimistic updates give up after this many lost races in a row.
pub(crate) const MAX_CAS_ATTEMPTS: usize = 16;

pub(crate) fn gave_up(what: &str) -> ColonyError {
    ColonyError::Conflict(format!("{what}: too many concurrent updates"))
}

/// Aggregate state of a graph given its members.
pub fn aggregate_state(members: &[Process]) -> ProcessState {
    if members.is_empty() {
        return ProcessState::Waiting;
    }
    if members.iter().all(|p| p.state == ProcessState::Success) {
        return ProcessState::Success;
    }
    if members.iter().any(Process::is_terminally_failed) {
        return ProcessState::Failed;
    }
    let started = members.iter().any(|p| {
        p.state != ProcessState::Waiting || p.start_time.is_some() || p.retries > 0
    });
    if started {
        ProcessState::Running
    } else {
        ProcessState::Waiting
    }
}

#[derive(Clone)]
pub struct GraphEngine {
    stores: Stores,
}

impl GraphEngine {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Instantiate a workflow. Non-empty `args` replace the args of every
    /// root; non-empty `root_input` becomes the input of every root.
    pub async fn submit_workflow(
        &self,
        spec: &WorkflowSpec,
        args: Vec<Value>,
        root_input: Vec<Value>,
    ) -> Result<WorkflowGraph> {
        self.submit_workflow_at(spec, args, root_input, Utc::now()).await
    }

    pub async fn submit_workflow_at(
        &self,
        spec: &WorkflowSpec,
        args: Vec<Value>,
        root_input: Vec<Value>,
        now: DateTime<Utc>,
    ) -> Result<WorkflowGraph> {
        self.instantiate(WorkflowGraph::new(&spec.colony_name, now), spec, args, root_input)
            .await
    }

    /// Like [`submit_workflow_at`](Self::submit_workflow_at) for a graph
    /// whose ID and submission time were fixed beforehand.
    pub async fn instantiate(
        &self,
        mut graph: WorkflowGraph,
        spec: &WorkflowSpec,
        args: Vec<Value>,
        root_input: Vec<Value>,
    ) -> Result<WorkflowGraph> {
        spec.validate()?;
        if graph.colony_name != spec.colony_name {
            return Err(ColonyError::Validation(format!(
                "graph {} belongs to colony '{}' but its workflow targets '{}'",
                graph.id, graph.colony_name, spec.colony_name
            )));
        }

        let now = graph.submission_time;
        let mut processes: Vec<Process> = spec
            .function_specs
            .iter()
            .map(|fs| {
                let mut p = Process::new_at(fs.clone(), now);
                p.graph_id = Some(graph.id.clone());
                p
            })
            .collect();

        let ids_by_name: HashMap<String, String> = processes
            .iter()
            .map(|p| (p.spec.node_name.clone(), p.id.clone()))
            .collect();

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for p in processes.iter_mut() {
            let mut parents = Vec::new();
            for dep in &p.spec.conditions.dependencies {
                // validate() guarantees every dependency names a node
                if let Some(parent_id) = ids_by_name.get(dep) {
                    if !parents.contains(parent_id) {
                        parents.push(parent_id.clone());
                        children.entry(parent_id.clone()).or_default().push(p.id.clone());
                    }
                }
            }

            if parents.is_empty() {
                p.wait_for_parents = false;
                if !args.is_empty() {
                    p.spec.args = args.clone();
                }
                if !root_input.is_empty() {
                    p.input = root_input.clone();
                }
                graph.root_ids.push(p.id.clone());
            } else {
                p.wait_for_parents = true;
                p.pending_parents = parents.clone();
                p.parents = parents;
            }
        }
        for p in processes.iter_mut() {
            if let Some(c) = children.remove(&p.id) {
                p.children = c;
            }
        }
        graph.process_ids = processes.iter().map(|p| p.id.clone()).collect();

        self.stores.graphs.add_graph(&graph, &processes).await?;
        tracing::info!(
            "🧩 Workflow graph {} submitted to colony '{}' ({} processes, {} roots)",
            graph.id,
            graph.colony_name,
            graph.process_ids.len(),
            graph.root_ids.len()
        );
        Ok(graph)
    }

    pub async fn get_graph(&self, id: &str) -> Result<WorkflowGraph> {
        self.stores
            .graphs
            .get_graph(id)
            .await?
            .ok_or_else(|| ColonyError::NotFound(format!("workflow graph {id}")))
    }

    pub async fn list_graphs(&self, colony_name: &str) -> Result<Vec<WorkflowGraph>> {
        self.stores.graphs.list_graphs(colony_name).await
    }

    /// Member processes in submission order.
    pub async fn members(&self, graph: &WorkflowGraph) -> Result<Vec<Process>> {
        let mut members = self.stores.processes.find_processes_by_graph(&graph.id).await?;
        let pos: HashMap<&str, usize> = graph
            .process_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        members.sort_by_key(|p| pos.get(p.id.as_str()).copied().unwrap_or(usize::MAX));
        Ok(members)
    }

    /// Concatenated outputs of the processes nothing depends on.
    pub async fn leaf_outputs(&self, graph_id: &str) -> Result<Vec<Value>> {
        let graph = self.get_graph(graph_id).await?;
        Ok(self
            .members(&graph)
            .await?
            .into_iter()
            .filter(|p| p.children.is_empty())
            .flat_map(|p| p.output)
            .collect())
    }

    /// A member started running; the graph may leave WAITING.
    pub(crate) async fn process_started(&self, process: &Process) -> Result<()> {
        if let Some(graph_id) = &process.graph_id {
            self.refresh(graph_id).await?;
        }
        Ok(())
    }

    /// A member reached SUCCESS or FAILED: release children, then roll up.
    pub(crate) async fn process_closed(&self, process: &Process) -> Result<()> {
        let Some(graph_id) = &process.graph_id else {
            return Ok(());
        };

        if process.state == ProcessState::Success {
            for child_id in &process.children {
                if self.release_child(child_id, &process.id).await? {
                    tracing::debug!("🔓 Process {} released by parent {}", child_id, process.id);
                }
            }
        }

        self.refresh(graph_id).await?;
        Ok(())
    }

    /// A member was reset for another attempt.
    pub(crate) async fn process_reset(&self, process: &Process) -> Result<()> {
        if let Some(graph_id) = &process.graph_id {
            self.refresh(graph_id).await?;
        }
        Ok(())
    }

    /// Drop `parent_id` from the child's pending set; the last parent makes
    /// the child schedulable and hands it the parents' outputs as input.
    /// Returns true if this call released the child.
    async fn release_child(&self, child_id: &str, parent_id: &str) -> Result<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(mut child) = self.stores.processes.get_process(child_id).await? else {
                tracing::warn!("⚠️ Child process {} of {} is missing", child_id, parent_id);
                return Ok(false);
            };
            if !child.pending_parents.iter().any(|p| p == parent_id) {
                return Ok(false);
            }

            let expected = child.version;
            child.pending_parents.retain(|p| p != parent_id);
            let released = child.pending_parents.is_empty();
            if released {
                child.input = self.parent_outputs(&child.parents).await?;
                child.wait_for_parents = false;
            }

            match self.stores.processes.update_process(&child, expected).await {
                Ok(_) => return Ok(released),
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(gave_up(&format!("release of process {child_id}")))
    }

    async fn parent_outputs(&self, parent_ids: &[String]) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        for id in parent_ids {
            if let Some(parent) = self.stores.processes.get_process(id).await? {
                out.extend(parent.output);
            }
        }
        Ok(out)
    }

    /// Finish releases that an interrupted cascade left behind: any member
    /// still pending on a parent that already succeeded. Returns true when
    /// something changed.
    async fn release_ready(&self, members: &[Process]) -> Result<bool> {
        let succeeded: HashSet<&str> = members
            .iter()
            .filter(|p| p.state == ProcessState::Success)
            .map(|p| p.id.as_str())
            .collect();
        let mut changed = false;
        for member in members.iter().filter(|p| p.state == ProcessState::Waiting && p.wait_for_parents) {
            for parent_id in member.pending_parents.iter().filter(|id| succeeded.contains(id.as_str())) {
                self.release_child(&member.id, parent_id).await?;
                changed = true;
            }
        }
        if changed {
            tracing::debug!("🔧 Repaired pending releases in a workflow graph");
        }
        Ok(changed)
    }

    /// Refresh every active graph. Returns how many could not be refreshed.
    pub async fn reconcile(&self) -> usize {
        let graphs = match self.stores.graphs.list_active_graphs().await {
            Ok(graphs) => graphs,
            Err(e) => {
                tracing::error!("❌ Graph reconcile could not list graphs: {e}");
                return 1;
            }
        };
        let mut failures = 0;
        for graph in graphs {
            if let Err(e) = self.refresh(&graph.id).await {
                tracing::warn!("⚠️ Workflow graph {} not refreshed: {e}", graph.id);
                failures += 1;
            }
        }
        failures
    }

    /// Recompute and store the aggregate state, repairing unfinished
    /// releases first. Terminal graphs are left alone.
    pub async fn refresh(&self, graph_id: &str) -> Result<WorkflowGraph> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut graph = self.get_graph(graph_id).await?;
            if graph.state.is_terminal() {
                return Ok(graph);
            }

            let mut members = self.members(&graph).await?;
            if self.release_ready(&members).await? {
                members = self.members(&graph).await?;
            }
            let state = aggregate_state(&members);
            if state == graph.state {
                return Ok(graph);
            }
            if state == ProcessState::Failed {
                self.fail_blocked(&graph).await?;
            }

            let expected = graph.version;
            let now = Utc::now();
            if graph.start_time.is_none() && state != ProcessState::Waiting {
                graph.start_time = members.iter().filter_map(|p| p.start_time).min().or(Some(now));
            }
            if state.is_terminal() {
                graph.end_time = Some(now);
            }
            graph.state = state;

            match self.stores.graphs.update_graph(&graph, expected).await {
                Ok(stored) => {
                    match stored.state {
                        ProcessState::Success => {
                            tracing::info!("✅ Workflow graph {} succeeded", stored.id)
                        }
                        ProcessState::Failed => {
                            tracing::warn!("❌ Workflow graph {} failed", stored.id)
                        }
                        _ => tracing::debug!("🧩 Workflow graph {} is now {}", stored.id, stored.state),
                    }
                    return Ok(stored);
                }
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(gave_up(&format!("workflow graph {graph_id}")))
    }

    /// Fail members that can never run because an ancestor failed for good.
    async fn fail_blocked(&self, graph: &WorkflowGraph) -> Result<()> {
        for member in self.members(graph).await? {
            if member.state != ProcessState::Waiting || !member.wait_for_parents {
                continue;
            }
            for _ in 0..MAX_CAS_ATTEMPTS {
                let Some(mut p) = self.stores.processes.get_process(&member.id).await? else {
                    break;
                };
                if p.state != ProcessState::Waiting || !p.wait_for_parents {
                    break;
                }
                let expected = p.version;
                p.state = ProcessState::Failed;
                p.end_time = Some(Utc::now());
                p.errors.push("parent process failed".into());
                // no retries for a process that never ran
                p.retries = p.retries.max(p.spec.max_retries);
                match self.stores.processes.update_process(&p, expected).await {
                    Ok(_) => break,
                    Err(e) if e.is_retryable() => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_core::types::FunctionSpec;
    use colony_store::MemoryStore;
    use std::sync::Arc;

    fn node(name: &str, deps: &[&str]) -> FunctionSpec {
        FunctionSpec::new("work", "dev", "cli")
            .with_node_name(name)
            .with_dependencies(deps)
    }

    fn engine() -> GraphEngine {
        GraphEngine::new(Stores::from_backend(Arc::new(MemoryStore::new())))
    }

    fn diamond() -> WorkflowSpec {
        WorkflowSpec::new("dev")
            .with(node("a", &[]))
            .with(node("b", &["a"]))
            .with(node("c", &["a"]))
            .with(node("d", &["b", "c"]))
    }

    fn with_state(mut p: Process, state: ProcessState) -> Process {
        p.state = state;
        p
    }

    #[test]
    fn test_aggregate_state_rules() {
        let base = Process::new(FunctionSpec::new("x", "dev", "cli"));
        let waiting = base.clone();
        let running = with_state(base.clone(), ProcessState::Running);
        let success = with_state(base.clone(), ProcessState::Success);
        let failed_final = with_state(base.clone(), ProcessState::Failed);
        let mut failed_retryable = with_state(base.clone(), ProcessState::Failed);
        failed_retryable.spec.max_retries = 3;

        assert_eq!(aggregate_state(&[waiting.clone(), waiting.clone()]), ProcessState::Waiting);
        assert_eq!(aggregate_state(&[waiting.clone(), running.clone()]), ProcessState::Running);
        assert_eq!(aggregate_state(&[success.clone(), waiting.clone()]), ProcessState::Running);
        assert_eq!(aggregate_state(&[success.clone(), success.clone()]), ProcessState::Success);
        assert_eq!(aggregate_state(&[success.clone(), failed_final]), ProcessState::Failed);
        assert_eq!(aggregate_state(&[failed_retryable, waiting]), ProcessState::Running);
    }

    #[tokio::test]
    async fn test_submit_builds_edges() {
        let engine = engine();
        let graph = engine.submit_workflow(&diamond(), Vec::new(), Vec::new()).await.unwrap();
        assert_eq!(graph.state, ProcessState::Waiting);
        assert_eq!(graph.process_ids.len(), 4);
        assert_eq!(graph.root_ids.len(), 1);

        let members = engine.members(&graph).await.unwrap();
        let by_node: HashMap<&str, &Process> =
            members.iter().map(|p| (p.spec.node_name.as_str(), p)).collect();
        let (a, b, c, d) = (by_node["a"], by_node["b"], by_node["c"], by_node["d"]);

        assert!(!a.wait_for_parents);
        assert_eq!(graph.root_ids, vec![a.id.clone()]);
        assert_eq!(a.children, vec![b.id.clone(), c.id.clone()]);
        assert!(d.wait_for_parents);
        assert_eq!(d.parents, vec![b.id.clone(), c.id.clone()]);
        assert_eq!(d.pending_parents, d.parents);
        assert!(d.children.is_empty());
    }

    #[tokio::test]
    async fn test_submit_applies_args_and_root_input_to_roots_only() {
        let engine = engine();
        let spec = WorkflowSpec::new("dev").with(node("a", &[])).with(node("b", &["a"]));
        let graph = engine
            .submit_workflow(&spec, vec![Value::from("x")], vec![Value::from(1)])
            .await
            .unwrap();
        let members = engine.members(&graph).await.unwrap();
        assert_eq!(members[0].spec.args, vec![Value::from("x")]);
        assert_eq!(members[0].input, vec![Value::from(1)]);
        assert!(members[1].spec.args.is_empty());
        assert!(members[1].input.is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_dependency() {
        let engine = engine();
        let spec = WorkflowSpec::new("dev").with(node("a", &["nope"]));
        let err = engine.submit_workflow(&spec, Vec::new(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, ColonyError::Validation(_)));
        assert!(engine.list_graphs("dev").await.unwrap().is_empty());
    }
}
