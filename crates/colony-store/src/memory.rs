//! In-process store. Every operation runs under one write lock, so claims
//! and compare-and-swap updates are atomic with respect to each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_core::error::{ColonyError, Result};
use colony_core::traits::{CandidateQuery, CronStore, GeneratorStore, GraphStore, ProcessStore};
use colony_core::types::{Cron, Generator, GeneratorArg, Process, WorkflowGraph};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// Insertion-ordered map, so listings and tie-breaks follow submission order.
struct Table<T> {
    rows: HashMap<String, T>,
    order: Vec<String>,
}

impl<T: Clone> Table<T> {
    fn new() -> Self {
        Self {
            rows: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn insert(&mut self, id: &str, row: T) -> Result<()> {
        if self.rows.contains_key(id) {
            return Err(ColonyError::Conflict(format!("{id} already exists")));
        }
        self.rows.insert(id.to_string(), row);
        self.order.push(id.to_string());
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        if self.rows.remove(id).is_some() {
            self.order.retain(|o| o != id);
            true
        } else {
            false
        }
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(|id| self.rows.get(id))
    }
}

/// Shared compare-and-swap logic for versioned rows.
fn swap<T: Clone>(
    table: &mut Table<T>,
    id: &str,
    new: &T,
    expected: u64,
    version_of: fn(&T) -> u64,
    set_version: fn(&mut T, u64),
) -> Result<T> {
    let current = table
        .rows
        .get_mut(id)
        .ok_or_else(|| ColonyError::NotFound(id.to_string()))?;
    if version_of(current) != expected {
        return Err(ColonyError::Conflict(format!(
            "{id} changed concurrently (expected version {expected}, found {})",
            version_of(current)
        )));
    }
    let mut stored = new.clone();
    set_version(&mut stored, expected + 1);
    *current = stored.clone();
    Ok(stored)
}

struct State {
    processes: Table<Process>,
    graphs: Table<WorkflowGraph>,
    generators: Table<Generator>,
    args: HashMap<String, VecDeque<GeneratorArg>>,
    next_seq: i64,
    crons: Table<Cron>,
}

pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                processes: Table::new(),
                graphs: Table::new(),
                generators: Table::new(),
                args: HashMap::new(),
                next_seq: 1,
                crons: Table::new(),
            }),
        }
    }

    fn sorted_candidates<'a>(
        procs: impl Iterator<Item = &'a Process>,
        limit: usize,
    ) -> Vec<Process> {
        let mut found: Vec<Process> = procs.cloned().collect();
        // sort_by_key is stable, so insertion order breaks ties
        found.sort_by_key(|p| p.priority_time);
        found.truncate(limit);
        found
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn add_process(&self, process: &Process) -> Result<()> {
        let mut state = self.state.write().await;
        state.processes.insert(&process.id, process.clone())
    }

    async fn get_process(&self, id: &str) -> Result<Option<Process>> {
        let state = self.state.read().await;
        Ok(state.processes.rows.get(id).cloned())
    }

    async fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<Process>> {
        let state = self.state.read().await;
        Ok(Self::sorted_candidates(
            state.processes.iter().filter(|p| query.matches_open(p)),
            query.limit,
        ))
    }

    async fn find_candidates_by_name(&self, query: &CandidateQuery) -> Result<Vec<Process>> {
        let state = self.state.read().await;
        Ok(Self::sorted_candidates(
            state.processes.iter().filter(|p| query.matches_named(p)),
            query.limit,
        ))
    }

    async fn find_processes_by_graph(&self, graph_id: &str) -> Result<Vec<Process>> {
        let state = self.state.read().await;
        Ok(state
            .processes
            .iter()
            .filter(|p| p.graph_id.as_deref() == Some(graph_id))
            .cloned()
            .collect())
    }

    async fn claim_process(&self, id: &str, executor_id: &str, at: DateTime<Utc>) -> Result<Process> {
        let mut state = self.state.write().await;
        let process = state
            .processes
            .rows
            .get_mut(id)
            .ok_or_else(|| ColonyError::NotFound(format!("process {id}")))?;
        if !process.is_claimable() {
            return Err(ColonyError::Conflict(format!("process {id} is no longer claimable")));
        }
        process.apply_claim(executor_id, at);
        process.version += 1;
        Ok(process.clone())
    }

    async fn update_process(&self, process: &Process, expected_version: u64) -> Result<Process> {
        let mut state = self.state.write().await;
        swap(
            &mut state.processes,
            &process.id,
            process,
            expected_version,
            |p| p.version,
            |p, v| p.version = v,
        )
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn add_graph(&self, graph: &WorkflowGraph, processes: &[Process]) -> Result<()> {
        let mut state = self.state.write().await;
        if state.graphs.rows.contains_key(&graph.id)
            || processes.iter().any(|p| state.processes.rows.contains_key(&p.id))
        {
            return Err(ColonyError::Conflict(format!("graph {} already exists", graph.id)));
        }
        state.graphs.insert(&graph.id, graph.clone())?;
        for p in processes {
            state.processes.insert(&p.id, p.clone())?;
        }
        Ok(())
    }

    async fn get_graph(&self, id: &str) -> Result<Option<WorkflowGraph>> {
        let state = self.state.read().await;
        Ok(state.graphs.rows.get(id).cloned())
    }

    async fn list_graphs(&self, colony_name: &str) -> Result<Vec<WorkflowGraph>> {
        let state = self.state.read().await;
        Ok(state
            .graphs
            .iter()
            .filter(|g| g.colony_name == colony_name)
            .cloned()
            .collect())
    }

    async fn list_active_graphs(&self) -> Result<Vec<WorkflowGraph>> {
        let state = self.state.read().await;
        Ok(state
            .graphs
            .iter()
            .filter(|g| !g.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn update_graph(&self, graph: &WorkflowGraph, expected_version: u64) -> Result<WorkflowGraph> {
        let mut state = self.state.write().await;
        swap(
            &mut state.graphs,
            &graph.id,
            graph,
            expected_version,
            |g| g.version,
            |g, v| g.version = v,
        )
    }
}

#[async_trait]
impl GeneratorStore for MemoryStore {
    async fn add_generator(&self, generator: &Generator) -> Result<()> {
        let mut state = self.state.write().await;
        state.generators.insert(&generator.id, generator.clone())
    }

    async fn get_generator(&self, id: &str) -> Result<Option<Generator>> {
        let state = self.state.read().await;
        Ok(state.generators.rows.get(id).cloned())
    }

    async fn find_generator_by_name(&self, colony_name: &str, name: &str) -> Result<Option<Generator>> {
        let state = self.state.read().await;
        Ok(state
            .generators
            .iter()
            .find(|g| g.colony_name == colony_name && g.name == name)
            .cloned())
    }

    async fn list_generators(&self) -> Result<Vec<Generator>> {
        let state = self.state.read().await;
        Ok(state.generators.iter().cloned().collect())
    }

    async fn remove_generator(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        state.args.remove(id);
        Ok(state.generators.remove(id))
    }

    async fn update_generator(&self, generator: &Generator, expected_version: u64) -> Result<Generator> {
        let mut state = self.state.write().await;
        swap(
            &mut state.generators,
            &generator.id,
            generator,
            expected_version,
            |g| g.version,
            |g, v| g.version = v,
        )
    }

    async fn add_generator_arg(&self, arg: &GeneratorArg) -> Result<GeneratorArg> {
        let mut state = self.state.write().await;
        if !state.generators.rows.contains_key(&arg.generator_id) {
            return Err(ColonyError::NotFound(format!("generator {}", arg.generator_id)));
        }
        let mut stored = arg.clone();
        stored.seq = state.next_seq;
        state.next_seq += 1;
        state
            .args
            .entry(arg.generator_id.clone())
            .or_default()
            .push_back(stored.clone());
        Ok(stored)
    }

    async fn count_generator_args(&self, generator_id: &str) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state.args.get(generator_id).map_or(0, VecDeque::len))
    }

    async fn take_generator_args(&self, generator_id: &str, n: usize) -> Result<Vec<GeneratorArg>> {
        let mut state = self.state.write().await;
        let Some(queue) = state.args.get_mut(generator_id) else {
            return Ok(Vec::new());
        };
        let n = n.min(queue.len());
        Ok(queue.drain(..n).collect())
    }

    async fn restore_generator_args(&self, args: &[GeneratorArg]) -> Result<()> {
        let mut state = self.state.write().await;
        for arg in args {
            if !state.generators.rows.contains_key(&arg.generator_id) {
                continue;
            }
            let queue = state.args.entry(arg.generator_id.clone()).or_default();
            let pos = queue.partition_point(|a| a.seq < arg.seq);
            queue.insert(pos, arg.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl CronStore for MemoryStore {
    async fn add_cron(&self, cron: &Cron) -> Result<()> {
        let mut state = self.state.write().await;
        state.crons.insert(&cron.id, cron.clone())
    }

    async fn get_cron(&self, id: &str) -> Result<Option<Cron>> {
        let state = self.state.read().await;
        Ok(state.crons.rows.get(id).cloned())
    }

    async fn find_cron_by_name(&self, colony_name: &str, name: &str) -> Result<Option<Cron>> {
        let state = self.state.read().await;
        Ok(state
            .crons
            .iter()
            .find(|c| c.colony_name == colony_name && c.name == name)
            .cloned())
    }

    async fn list_crons(&self) -> Result<Vec<Cron>> {
        let state = self.state.read().await;
        Ok(state.crons.iter().cloned().collect())
    }

    async fn remove_cron(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(state.crons.remove(id))
    }

    async fn update_cron(&self, cron: &Cron, expected_version: u64) -> Result<Cron> {
        let mut state = self.state.write().await;
        swap(
            &mut state.crons,
            &cron.id,
            cron,
            expected_version,
            |c| c.version,
            |c, v| c.version = v,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_core::types::{FunctionSpec, Resources, WorkflowSpec};
    use std::sync::Arc;

    fn query() -> CandidateQuery {
        CandidateQuery {
            colony_name: "dev".into(),
            executor_name: "worker-1".into(),
            executor_type: "cli".into(),
            location_name: String::new(),
            resources: Resources::default(),
            limit: 10,
        }
    }

    fn process() -> Process {
        Process::new(FunctionSpec::new("echo", "dev", "cli"))
    }

    #[tokio::test]
    async fn test_candidates_filter_and_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let late = Process::new_at(FunctionSpec::new("late", "dev", "cli"), now);
        let early = Process::new_at(FunctionSpec::new("early", "dev", "cli").with_priority(1), now);
        let other_colony = Process::new(FunctionSpec::new("x", "prod", "cli"));
        let other_type = Process::new(FunctionSpec::new("x", "dev", "gpu"));
        let named = Process::new(FunctionSpec::new("named", "dev", "cli").with_executor_names(&["worker-1"]));
        for p in [&late, &early, &other_colony, &other_type, &named] {
            store.add_process(p).await.unwrap();
        }

        let open = store.find_candidates(&query()).await.unwrap();
        let names: Vec<&str> = open.iter().map(|p| p.spec.func_name.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);

        let by_name = store.find_candidates_by_name(&query()).await.unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].id, named.id);
    }

    #[tokio::test]
    async fn test_candidates_respect_resources_and_limit() {
        let store = MemoryStore::new();
        let mut heavy = FunctionSpec::new("heavy", "dev", "cli");
        heavy.conditions.resources.memory = 4096;
        store.add_process(&Process::new(heavy)).await.unwrap();
        for _ in 0..5 {
            store.add_process(&process()).await.unwrap();
        }

        let mut q = query();
        q.limit = 3;
        assert_eq!(store.find_candidates(&q).await.unwrap().len(), 3);

        q.limit = 10;
        assert_eq!(store.find_candidates(&q).await.unwrap().len(), 5);
        q.resources.memory = 8192;
        assert_eq!(store.find_candidates(&q).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryStore::new();
        let p = process();
        store.add_process(&p).await.unwrap();

        let claimed = store.claim_process(&p.id, "e1", Utc::now()).await.unwrap();
        assert_eq!(claimed.version, 1);
        let err = store.claim_process(&p.id, "e2", Utc::now()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.claim_process("missing", "e1", Utc::now()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_concurrent_claims() {
        let store = Arc::new(MemoryStore::new());
        let p = process();
        store.add_process(&p).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = p.id.clone();
            handles.push(tokio::spawn(async move {
                store.claim_process(&id, &format!("e{i}"), Utc::now()).await.is_ok()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_update_process_cas() {
        let store = MemoryStore::new();
        let mut p = process();
        store.add_process(&p).await.unwrap();

        p.output = vec![serde_json::json!("done")];
        let stored = store.update_process(&p, 0).await.unwrap();
        assert_eq!(stored.version, 1);

        let err = store.update_process(&p, 0).await.unwrap_err();
        assert!(matches!(err, ColonyError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_args_queue_order_and_restore() {
        let store = MemoryStore::new();
        let g = Generator::new("g", WorkflowSpec::new("dev"), 2, 0);
        store.add_generator(&g).await.unwrap();
        for i in 0..5 {
            store
                .add_generator_arg(&GeneratorArg::new(&g.id, "dev", &format!("a{i}")))
                .await
                .unwrap();
        }

        let taken = store.take_generator_args(&g.id, 2).await.unwrap();
        let values: Vec<&str> = taken.iter().map(|a| a.arg.as_str()).collect();
        assert_eq!(values, vec!["a0", "a1"]);
        assert_eq!(store.count_generator_args(&g.id).await.unwrap(), 3);

        store.restore_generator_args(&taken).await.unwrap();
        let all = store.take_generator_args(&g.id, 10).await.unwrap();
        let values: Vec<&str> = all.iter().map(|a| a.arg.as_str()).collect();
        assert_eq!(values, vec!["a0", "a1", "a2", "a3", "a4"]);
    }

    #[tokio::test]
    async fn test_arg_for_unknown_generator() {
        let store = MemoryStore::new();
        let err = store
            .add_generator_arg(&GeneratorArg::new("nope", "dev", "x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_generator_drops_args() {
        let store = MemoryStore::new();
        let g = Generator::new("g", WorkflowSpec::new("dev"), 2, 0);
        store.add_generator(&g).await.unwrap();
        store.add_generator_arg(&GeneratorArg::new(&g.id, "dev", "x")).await.unwrap();

        assert!(store.remove_generator(&g.id).await.unwrap());
        assert!(!store.remove_generator(&g.id).await.unwrap());
        assert_eq!(store.count_generator_args(&g.id).await.unwrap(), 0);
    }
}
