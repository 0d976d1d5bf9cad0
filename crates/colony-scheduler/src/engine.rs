//! Engine facade and background sweep loops.

use colony_core::config::ColonyConfig;
use colony_core::traits::Stores;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cron_engine::CronEngine;
use crate::generator::GeneratorEngine;
use crate::graph::GraphEngine;
use crate::process::ProcessEngine;
use crate::scheduler::Scheduler;

/// Every engine wired to one set of stores.
#[derive(Clone)]
pub struct ColonyEngine {
    pub scheduler: Scheduler,
    pub processes: ProcessEngine,
    pub graphs: GraphEngine,
    pub generators: Arc<GeneratorEngine>,
    pub crons: Arc<CronEngine>,
}

impl ColonyEngine {
    pub fn new(stores: Stores, config: &ColonyConfig) -> Self {
        let scheduler = Scheduler::new(stores.processes.clone(), config.scheduler.clone());
        let graphs = GraphEngine::new(stores.clone());
        let processes = ProcessEngine::new(stores.clone(), scheduler.clone(), graphs.clone());
        let generators = Arc::new(GeneratorEngine::new(
            stores.clone(),
            graphs.clone(),
            config.generator.period(),
        ));
        let crons = Arc::new(CronEngine::new(stores, graphs.clone(), config.cron.period()));
        Self {
            scheduler,
            processes,
            graphs,
            generators,
            crons,
        }
    }

    /// Start the sweeps enabled in `config`. Each loop exits once `shutdown`
    /// turns true or its sender is dropped.
    pub fn spawn_sweeps(&self, config: &ColonyConfig, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if config.generator.enabled {
            handles.push(tokio::spawn(run_generator_sweep(
                self.generators.clone(),
                shutdown.clone(),
            )));
        } else {
            tracing::info!("⚙️ Generator sweep disabled");
        }
        if config.cron.enabled {
            handles.push(tokio::spawn(run_cron_sweep(self.crons.clone(), shutdown.clone())));
        } else {
            tracing::info!("⏰ Cron sweep disabled");
        }
        if config.reconcile.enabled {
            handles.push(tokio::spawn(run_graph_sweep(
                self.graphs.clone(),
                config.reconcile.period(),
                shutdown,
            )));
        } else {
            tracing::info!("🔁 Graph reconcile sweep disabled");
        }
        handles
    }
}

fn sweep_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub async fn run_generator_sweep(engine: Arc<GeneratorEngine>, mut shutdown: watch::Receiver<bool>) {
    let period = engine.generator_period();
    tracing::info!("⚙️ Generator sweep started (every {:?})", period);
    let mut interval = sweep_interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = engine.tick().await;
                if !report.graphs.is_empty() {
                    tracing::info!("⚙️ Generator sweep created {} graph(s)", report.graphs.len());
                }
                if report.failures > 0 {
                    tracing::warn!("⚠️ Generator sweep had {} failure(s)", report.failures);
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
    tracing::info!("⚙️ Generator sweep stopped");
}

pub async fn run_cron_sweep(engine: Arc<CronEngine>, mut shutdown: watch::Receiver<bool>) {
    let period = engine.cron_period();
    tracing::info!("⏰ Cron sweep started (every {:?})", period);
    let mut interval = sweep_interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = engine.tick().await;
                for id in &report.graphs {
                    tracing::debug!("📣 Cron graph {}", id);
                }
                if report.failures > 0 {
                    tracing::warn!("⚠️ Cron sweep had {} failure(s)", report.failures);
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
    tracing::info!("⏰ Cron sweep stopped");
}

/// Re-derives every active graph so child releases and blocked-member
/// failures lost to an interrupted cascade are eventually applied.
pub async fn run_graph_sweep(graphs: GraphEngine, period: Duration, mut shutdown: watch::Receiver<bool>) {
    tracing::info!("🔁 Graph reconcile sweep started (every {:?})", period);
    let mut interval = sweep_interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let failures = graphs.reconcile().await;
                if failures > 0 {
                    tracing::warn!("⚠️ Graph reconcile had {} failure(s)", failures);
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
    tracing::info!("🔁 Graph reconcile sweep stopped");
}
