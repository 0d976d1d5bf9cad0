//! Repository contracts, one per aggregate. The engine depends only on these.

pub mod cron;
pub mod generator;
pub mod graph;
pub mod process;

pub use cron::CronStore;
pub use generator::GeneratorStore;
pub use graph::GraphStore;
pub use process::{CandidateQuery, ProcessStore};

use std::sync::Arc;

/// A backend implementing every contract.
pub trait Store: ProcessStore + GraphStore + GeneratorStore + CronStore {}

impl<T: ProcessStore + GraphStore + GeneratorStore + CronStore> Store for T {}

/// One handle per aggregate, usually all pointing at the same backend.
#[derive(Clone)]
pub struct Stores {
    pub processes: Arc<dyn ProcessStore>,
    pub graphs: Arc<dyn GraphStore>,
    pub generators: Arc<dyn GeneratorStore>,
    pub crons: Arc<dyn CronStore>,
}

impl Stores {
    pub fn from_backend<T: Store + 'static>(backend: Arc<T>) -> Self {
        Self {
            processes: backend.clone(),
            graphs: backend.clone(),
            generators: backend.clone(),
            crons: backend,
        }
    }
}
