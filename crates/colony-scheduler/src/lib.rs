//! # Colony Scheduler
//!
//! Scheduling core for a colony of executors: candidate selection, process
//! lifecycle, workflow cascade, and the two time-driven triggers.
//!
//! ## Architecture
//! ```text
//! Executor polls ──► Scheduler (prioritize by priority time)
//!                       └── ProcessStore::claim_process (atomic)
//!
//! ProcessEngine: WAITING → RUNNING → SUCCESS | FAILED → (reset) WAITING
//!   └── on close → GraphEngine
//!                    ├── release children (pending parents drained)
//!                    ├── aggregate graph state
//!                    └── fail blocked members when the graph fails
//!
//! Sweeps (tokio interval, watch shutdown)
//!   ├── GeneratorEngine: packed args → batch of `trigger` or timeout flush
//!   └── CronEngine: expression / interval / random → graph, optional
//!                   coalescing behind the previous graph
//! ```

pub mod cron;
pub mod cron_engine;
pub mod engine;
pub mod generator;
pub mod graph;
pub mod process;
pub mod scheduler;

pub use cron_engine::CronEngine;
pub use engine::{ColonyEngine, run_cron_sweep, run_generator_sweep};
pub use generator::{GeneratorEngine, SweepReport};
pub use graph::{GraphEngine, aggregate_state};
pub use process::ProcessEngine;
pub use scheduler::Scheduler;
