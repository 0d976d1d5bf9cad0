use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Process, WorkflowGraph};

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert a graph together with all of its member processes.
    async fn add_graph(&self, graph: &WorkflowGraph, processes: &[Process]) -> Result<()>;

    async fn get_graph(&self, id: &str) -> Result<Option<WorkflowGraph>>;

    async fn list_graphs(&self, colony_name: &str) -> Result<Vec<WorkflowGraph>>;

    /// Graphs in every colony that are still WAITING or RUNNING.
    async fn list_active_graphs(&self) -> Result<Vec<WorkflowGraph>>;

    async fn update_graph(&self, graph: &WorkflowGraph, expected_version: u64) -> Result<WorkflowGraph>;
}
