//! Generators batch argument packets into new workflow instances.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::workflow::WorkflowSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generator {
    pub id: String,
    pub colony_name: String,
    pub name: String,
    pub workflow_spec: WorkflowSpec,
    /// Number of packets that triggers a full batch.
    pub trigger: i64,
    /// Seconds after which a partial batch is flushed. Zero or less disables it.
    pub timeout_secs: i64,
    pub last_run: Option<DateTime<Utc>>,
    /// When the oldest packet still waiting for a trigger arrived.
    pub first_pack: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Generator {
    pub fn new(name: &str, workflow_spec: WorkflowSpec, trigger: i64, timeout_secs: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            colony_name: workflow_spec.colony_name.clone(),
            name: name.into(),
            workflow_spec,
            trigger,
            timeout_secs,
            last_run: None,
            first_pack: None,
            version: 0,
        }
    }

    /// True when a non-empty partial batch has waited long enough.
    pub fn timed_out(&self, now: DateTime<Utc>) -> bool {
        if self.timeout_secs <= 0 {
            return false;
        }
        let Some(timeout) = Duration::try_seconds(self.timeout_secs) else {
            return false;
        };
        match self.first_pack.or(self.last_run) {
            Some(since) => now.signed_duration_since(since) >= timeout,
            None => false,
        }
    }
}

/// One queued argument packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorArg {
    pub id: String,
    pub generator_id: String,
    pub colony_name: String,
    pub arg: String,
    pub added: DateTime<Utc>,
    /// Queue position assigned by the store; lower is older.
    pub seq: i64,
}

impl GeneratorArg {
    pub fn new(generator_id: &str, colony_name: &str, arg: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            generator_id: generator_id.into(),
            colony_name: colony_name.into(),
            arg: arg.into(),
            added: Utc::now(),
            seq: 0,
        }
    }
}
