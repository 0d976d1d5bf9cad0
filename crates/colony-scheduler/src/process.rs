//! Process lifecycle: WAITING → RUNNING → SUCCESS | FAILED, and back to
//! WAITING through an explicit reset.

use chrono::Utc;
use colony_core::error::{ColonyError, Result};
use colony_core::traits::Stores;
use colony_core::types::{Executor, FunctionSpec, Process, ProcessState, Resources, Timings};
use colony_core::types::process::deadline;
use serde_json::Value;

use crate::graph::{GraphEngine, MAX_CAS_ATTEMPTS, gave_up};
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct ProcessEngine {
    stores: Stores,
    scheduler: Scheduler,
    graphs: GraphEngine,
}

impl ProcessEngine {
    pub fn new(stores: Stores, scheduler: Scheduler, graphs: GraphEngine) -> Self {
        Self {
            stores,
            scheduler,
            graphs,
        }
    }

    /// Submit a process that belongs to no workflow graph.
    pub async fn submit(&self, spec: FunctionSpec) -> Result<Process> {
        if spec.conditions.colony_name.is_empty() || spec.conditions.executor_type.is_empty() {
            return Err(ColonyError::Validation(
                "a process needs a colony name and an executor type".into(),
            ));
        }
        if !spec.conditions.dependencies.is_empty() {
            return Err(ColonyError::Validation(
                "dependencies are only allowed inside a workflow".into(),
            ));
        }
        spec.check_time_limits()?;
        let process = Process::new(spec);
        self.stores.processes.add_process(&process).await?;
        tracing::info!(
            "📥 Process {} submitted ({} in colony '{}')",
            process.id,
            process.spec.func_name,
            process.colony_name()
        );
        Ok(process)
    }

    pub async fn get(&self, id: &str) -> Result<Process> {
        self.stores
            .processes
            .get_process(id)
            .await?
            .ok_or_else(|| ColonyError::NotFound(format!("process {id}")))
    }

    /// Pick and claim the best candidate for `executor`. Candidates lost to
    /// other executors are skipped.
    pub async fn assign(&self, colony_name: &str, executor: &Executor, resources: &Resources) -> Result<Process> {
        let candidates = self
            .scheduler
            .prioritize(colony_name, executor, resources, self.scheduler.candidate_limit())
            .await?;
        for candidate in candidates {
            match self.claim(&executor.id, &candidate.id).await {
                Ok(process) => return Ok(process),
                Err(e) if e.is_retryable() => {
                    tracing::debug!("🏁 Lost claim on {} to another executor", candidate.id);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ColonyError::NotFound(format!(
            "no candidates for executor '{}' in colony '{}'",
            executor.name, colony_name
        )))
    }

    /// Claim one specific process. The store performs the WAITING → RUNNING
    /// switch as a single conditional write.
    pub async fn claim(&self, executor_id: &str, process_id: &str) -> Result<Process> {
        let process = self
            .stores
            .processes
            .claim_process(process_id, executor_id, Utc::now())
            .await?;
        tracing::info!("🏃 Process {} assigned to executor {}", process.id, executor_id);
        self.cascade(&process, self.graphs.process_started(&process).await);
        Ok(process)
    }

    /// Give a RUNNING process back to the pool without counting a failure.
    pub async fn unassign(&self, process_id: &str) -> Result<Process> {
        let process = self
            .transition(process_id, "unassign", &[ProcessState::Running], |p| {
                p.state = ProcessState::Waiting;
                p.assigned_executor_id = None;
                p.end_time = Some(Utc::now());
                p.exec_deadline = None;
                Ok(())
            })
            .await?;
        tracing::info!("↩️ Process {} unassigned", process.id);
        Ok(process)
    }

    pub async fn mark_successful(&self, process_id: &str) -> Result<Timings> {
        self.succeed(process_id, None).await
    }

    /// Like [`mark_successful`](Self::mark_successful) but also stores the output.
    pub async fn close_successful(&self, process_id: &str, output: Vec<Value>) -> Result<Timings> {
        self.succeed(process_id, Some(output)).await
    }

    async fn succeed(&self, process_id: &str, output: Option<Vec<Value>>) -> Result<Timings> {
        let process = self
            .transition(process_id, "close as successful", &[ProcessState::Running], |p| {
                p.state = ProcessState::Success;
                p.end_time = Some(Utc::now());
                if let Some(output) = &output {
                    p.output = output.clone();
                }
                Ok(())
            })
            .await?;
        let timings = process.timings();
        tracing::info!(
            "✅ Process {} succeeded (waited {}ms, ran {}ms)",
            process.id,
            timings.wait.num_milliseconds(),
            timings.exec.num_milliseconds()
        );
        self.cascade(&process, self.graphs.process_closed(&process).await);
        Ok(timings)
    }

    pub async fn mark_failed(&self, process_id: &str, errors: Vec<String>) -> Result<Process> {
        let process = self
            .transition(process_id, "close as failed", &[ProcessState::Running], |p| {
                p.state = ProcessState::Failed;
                p.end_time = Some(Utc::now());
                p.errors = errors.clone();
                Ok(())
            })
            .await?;
        tracing::warn!(
            "❌ Process {} failed (attempt {}/{}): {}",
            process.id,
            process.retries + 1,
            process.spec.max_retries + 1,
            process.errors.join("; ")
        );
        self.cascade(&process, self.graphs.process_closed(&process).await);
        Ok(process)
    }

    /// Reopen a FAILED process for another attempt. Rejected once the retry
    /// budget is spent.
    pub async fn reset(&self, process_id: &str) -> Result<Process> {
        let process = self
            .transition(process_id, "reset", &[ProcessState::Failed], |p| {
                if p.retries >= p.spec.max_retries {
                    return Err(ColonyError::invalid_transition(
                        &p.id,
                        p.state,
                        &format!("reset (retry limit {} reached)", p.spec.max_retries),
                    ));
                }
                let now = Utc::now();
                p.state = ProcessState::Waiting;
                p.assigned_executor_id = None;
                p.start_time = None;
                p.end_time = None;
                p.exec_deadline = None;
                p.submission_time = now;
                p.wait_deadline = deadline(now, p.spec.max_wait_time);
                p.retries += 1;
                Ok(())
            })
            .await?;
        tracing::info!(
            "🔁 Process {} reset (retry {}/{})",
            process.id,
            process.retries,
            process.spec.max_retries
        );
        self.cascade(&process, self.graphs.process_reset(&process).await);
        Ok(process)
    }

    /// The transition is already stored, so a failed graph update is only
    /// logged. The next refresh of the graph finishes the job.
    fn cascade(&self, process: &Process, outcome: Result<()>) {
        if let Err(e) = outcome {
            tracing::warn!(
                "⚠️ Graph update after process {} deferred: {e}",
                process.id
            );
        }
    }

    /// Read, check the source state, mutate and compare-and-swap, retrying
    /// lost races on a fresh copy.
    async fn transition<F>(&self, process_id: &str, action: &str, from: &[ProcessState], apply: F) -> Result<Process>
    where
        F: Fn(&mut Process) -> Result<()>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut process = self.get(process_id).await?;
            if !from.contains(&process.state) {
                return Err(ColonyError::invalid_transition(process_id, process.state, action));
            }
            let expected = process.version;
            apply(&mut process)?;
            match self.stores.processes.update_process(&process, expected).await {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(gave_up(&format!("{action} of process {process_id}")))
    }
}
