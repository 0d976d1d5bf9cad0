//! Workflow templates and instantiated workflow graphs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{ColonyError, Result};
use crate::types::process::{FunctionSpec, ProcessState};

/// A DAG template: function specs linked by `conditions.dependencies`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub colony_name: String,
    pub function_specs: Vec<FunctionSpec>,
}

impl WorkflowSpec {
    pub fn new(colony_name: &str) -> Self {
        Self {
            colony_name: colony_name.into(),
            function_specs: Vec::new(),
        }
    }

    pub fn with(mut self, spec: FunctionSpec) -> Self {
        self.function_specs.push(spec);
        self
    }

    /// Check node names, colony membership, dependency references and cycles.
    pub fn validate(&self) -> Result<()> {
        if self.colony_name.is_empty() {
            return Err(ColonyError::Validation("workflow has no colony name".into()));
        }
        if self.function_specs.is_empty() {
            return Err(ColonyError::Validation("workflow has no function specs".into()));
        }

        let mut names = HashSet::new();
        for spec in &self.function_specs {
            if spec.node_name.is_empty() {
                return Err(ColonyError::Validation(format!(
                    "function spec '{}' has no node name",
                    spec.func_name
                )));
            }
            if !names.insert(spec.node_name.as_str()) {
                return Err(ColonyError::Validation(format!(
                    "duplicate node name '{}'",
                    spec.node_name
                )));
            }
            if spec.conditions.colony_name != self.colony_name {
                return Err(ColonyError::Validation(format!(
                    "node '{}' targets colony '{}' but workflow belongs to '{}'",
                    spec.node_name, spec.conditions.colony_name, self.colony_name
                )));
            }
            spec.check_time_limits()?;
        }

        for spec in &self.function_specs {
            for dep in &spec.conditions.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(ColonyError::Validation(format!(
                        "node '{}' depends on unknown node '{}'",
                        spec.node_name, dep
                    )));
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm over node names.
    fn check_acyclic(&self) -> Result<()> {
        let mut indegree: HashMap<&str, usize> = self
            .function_specs
            .iter()
            .map(|s| {
                let distinct: HashSet<&String> = s.conditions.dependencies.iter().collect();
                (s.node_name.as_str(), distinct.len())
            })
            .collect();
        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0;

        while let Some(node) = ready.pop() {
            visited += 1;
            for spec in &self.function_specs {
                if spec.conditions.dependencies.iter().any(|d| d == node) {
                    if let Some(d) = indegree.get_mut(spec.node_name.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(spec.node_name.as_str());
                        }
                    }
                }
            }
        }

        if visited == self.function_specs.len() {
            Ok(())
        } else {
            Err(ColonyError::Validation("workflow dependencies contain a cycle".into()))
        }
    }
}

/// One instantiated workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: String,
    pub colony_name: String,
    pub state: ProcessState,
    pub process_ids: Vec<String>,
    pub root_ids: Vec<String>,
    pub submission_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub version: u64,
}

impl WorkflowGraph {
    pub fn new(colony_name: &str, submitted: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            colony_name: colony_name.into(),
            state: ProcessState::Waiting,
            process_ids: Vec::new(),
            root_ids: Vec::new(),
            submission_time: submitted,
            start_time: None,
            end_time: None,
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, deps: &[&str]) -> FunctionSpec {
        FunctionSpec::new("work", "dev", "cli")
            .with_node_name(name)
            .with_dependencies(deps)
    }

    #[test]
    fn test_valid_diamond() {
        let wf = WorkflowSpec::new("dev")
            .with(node("a", &[]))
            .with(node("b", &["a"]))
            .with(node("c", &["a"]))
            .with(node("d", &["b", "c"]));
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let wf = WorkflowSpec::new("dev").with(node("a", &["ghost"]));
        let err = wf.validate().unwrap_err();
        assert!(matches!(err, ColonyError::Validation(ref m) if m.contains("ghost")));
    }

    #[test]
    fn test_duplicate_and_missing_names_rejected() {
        let dup = WorkflowSpec::new("dev").with(node("a", &[])).with(node("a", &[]));
        assert!(matches!(dup.validate(), Err(ColonyError::Validation(_))));

        let unnamed = WorkflowSpec::new("dev").with(node("", &[]));
        assert!(matches!(unnamed.validate(), Err(ColonyError::Validation(_))));
    }

    #[test]
    fn test_cycle_rejected() {
        let wf = WorkflowSpec::new("dev")
            .with(node("a", &["b"]))
            .with(node("b", &["a"]));
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_colony_mismatch_rejected() {
        let wf = WorkflowSpec::new("prod").with(node("a", &[]));
        assert!(matches!(wf.validate(), Err(ColonyError::Validation(_))));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert!(WorkflowSpec::new("dev").validate().is_err());
    }
}
