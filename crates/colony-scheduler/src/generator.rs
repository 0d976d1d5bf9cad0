//! Generator engine: batches packed arguments into workflow instances by
//! count threshold or timeout.

use chrono::{DateTime, Utc};
use colony_core::error::{ColonyError, Result};
use colony_core::traits::Stores;
use colony_core::types::process::check_span;
use colony_core::types::{Generator, GeneratorArg, WorkflowGraph};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::graph::{GraphEngine, MAX_CAS_ATTEMPTS, gave_up};

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// IDs of graphs created during the pass.
    pub graphs: Vec<String>,
    /// Entities skipped because of an error.
    pub failures: usize,
}

pub struct GeneratorEngine {
    stores: Stores,
    graphs: GraphEngine,
    period: Duration,
    sweep_lock: Mutex<()>,
}

impl GeneratorEngine {
    pub fn new(stores: Stores, graphs: GraphEngine, period: Duration) -> Self {
        Self {
            stores,
            graphs,
            period,
            sweep_lock: Mutex::new(()),
        }
    }

    /// How often the sweep runs.
    pub fn generator_period(&self) -> Duration {
        self.period
    }

    pub async fn add_generator(&self, mut generator: Generator) -> Result<Generator> {
        if generator.name.trim().is_empty() {
            return Err(ColonyError::Validation("generator name is empty".into()));
        }
        if generator.trigger < 1 {
            return Err(ColonyError::Validation(format!(
                "generator '{}' needs a trigger of at least 1",
                generator.name
            )));
        }
        check_span("timeout", generator.timeout_secs)?;
        generator.workflow_spec.validate()?;
        if generator.colony_name != generator.workflow_spec.colony_name {
            return Err(ColonyError::Validation(format!(
                "generator '{}' belongs to colony '{}' but its workflow targets '{}'",
                generator.name, generator.colony_name, generator.workflow_spec.colony_name
            )));
        }
        if self
            .stores
            .generators
            .find_generator_by_name(&generator.colony_name, &generator.name)
            .await?
            .is_some()
        {
            return Err(ColonyError::Conflict(format!(
                "generator '{}' already exists in colony '{}'",
                generator.name, generator.colony_name
            )));
        }

        generator.last_run = None;
        generator.first_pack = None;
        generator.version = 0;
        self.stores.generators.add_generator(&generator).await?;
        tracing::info!(
            "⚙️ Generator added: '{}' ({}) trigger={} timeout={}s",
            generator.name,
            generator.id,
            generator.trigger,
            generator.timeout_secs
        );
        Ok(generator)
    }

    pub async fn get_generator(&self, id: &str) -> Result<Generator> {
        self.stores
            .generators
            .get_generator(id)
            .await?
            .ok_or_else(|| ColonyError::NotFound(format!("generator {id}")))
    }

    pub async fn get_generator_by_name(&self, colony_name: &str, name: &str) -> Result<Generator> {
        self.stores
            .generators
            .find_generator_by_name(colony_name, name)
            .await?
            .ok_or_else(|| ColonyError::NotFound(format!("generator '{name}' in colony '{colony_name}'")))
    }

    pub async fn list_generators(&self) -> Result<Vec<Generator>> {
        self.stores.generators.list_generators().await
    }

    pub async fn remove_generator(&self, id: &str) -> Result<()> {
        if self.stores.generators.remove_generator(id).await? {
            tracing::info!("🗑️ Generator removed: {}", id);
            Ok(())
        } else {
            Err(ColonyError::NotFound(format!("generator {id}")))
        }
    }

    /// Queue one argument packet.
    pub async fn pack_generator(&self, generator_id: &str, colony_name: &str, arg: &str) -> Result<GeneratorArg> {
        let generator = self.get_generator(generator_id).await?;
        if generator.colony_name != colony_name {
            return Err(ColonyError::Validation(format!(
                "generator {} does not belong to colony '{}'",
                generator_id, colony_name
            )));
        }

        let stored = self
            .stores
            .generators
            .add_generator_arg(&GeneratorArg::new(generator_id, colony_name, arg))
            .await?;
        self.mark_first_pack(generator_id, stored.added).await?;
        tracing::debug!("📦 Packed arg #{} into generator '{}'", stored.seq, generator.name);
        Ok(stored)
    }

    async fn mark_first_pack(&self, generator_id: &str, at: DateTime<Utc>) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut generator = self.get_generator(generator_id).await?;
            if generator.first_pack.is_some() {
                return Ok(());
            }
            let expected = generator.version;
            generator.first_pack = Some(at);
            match self.stores.generators.update_generator(&generator, expected).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(gave_up(&format!("first pack of generator {generator_id}")))
    }

    pub async fn tick(&self) -> SweepReport {
        self.tick_at(Utc::now()).await
    }

    /// One sweep over every generator. Errors are logged per generator and
    /// never stop the pass.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        let mut report = SweepReport::default();

        let generators = match self.stores.generators.list_generators().await {
            Ok(g) => g,
            Err(e) => {
                tracing::error!("❌ Generator sweep could not list generators: {e}");
                report.failures += 1;
                return report;
            }
        };

        for generator in generators {
            match self.trigger(&generator, now).await {
                Ok(graphs) => report.graphs.extend(graphs.into_iter().map(|g| g.id)),
                Err(e) => {
                    tracing::warn!("⚠️ Generator '{}' skipped: {e}", generator.name);
                    report.failures += 1;
                }
            }
        }
        report
    }

    /// Submit every full batch, or flush a partial batch after the timeout.
    async fn trigger(&self, generator: &Generator, now: DateTime<Utc>) -> Result<Vec<WorkflowGraph>> {
        let trigger = usize::try_from(generator.trigger).unwrap_or(0);
        if trigger == 0 {
            return Ok(Vec::new());
        }

        let queued = self.stores.generators.count_generator_args(&generator.id).await?;
        let mut created = Vec::new();

        if queued >= trigger {
            for _ in 0..queued / trigger {
                match self.submit_batch(generator, trigger, now).await? {
                    Some(graph) => created.push(graph),
                    None => break,
                }
            }
        } else if queued > 0 && generator.timed_out(now) {
            if let Some(graph) = self.submit_batch(generator, queued, now).await? {
                created.push(graph);
            }
        }

        if !created.is_empty() {
            self.record_run(&generator.id, now).await?;
        }
        Ok(created)
    }

    /// Take exactly `n` packets and instantiate one graph from them. Packets
    /// are put back if fewer than `n` were available or instantiation failed.
    async fn submit_batch(&self, generator: &Generator, n: usize, now: DateTime<Utc>) -> Result<Option<WorkflowGraph>> {
        let taken = self.stores.generators.take_generator_args(&generator.id, n).await?;
        if taken.len() < n {
            self.stores.generators.restore_generator_args(&taken).await?;
            return Ok(None);
        }

        let args: Vec<Value> = taken.iter().map(|a| Value::String(a.arg.clone())).collect();
        match self
            .graphs
            .submit_workflow_at(&generator.workflow_spec, args, Vec::new(), now)
            .await
        {
            Ok(graph) => {
                tracing::info!(
                    "⚙️ Generator '{}' triggered graph {} ({} args)",
                    generator.name,
                    graph.id,
                    taken.len()
                );
                Ok(Some(graph))
            }
            Err(e) => {
                self.stores.generators.restore_generator_args(&taken).await?;
                Err(e)
            }
        }
    }

    async fn record_run(&self, generator_id: &str, now: DateTime<Utc>) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut generator = self.get_generator(generator_id).await?;
            let remaining = self.stores.generators.count_generator_args(generator_id).await?;
            let expected = generator.version;
            generator.last_run = Some(now);
            generator.first_pack = (remaining > 0).then_some(now);
            match self.stores.generators.update_generator(&generator, expected).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(gave_up(&format!("last run of generator {generator_id}")))
    }
}
