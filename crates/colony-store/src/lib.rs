//! # Colony Store
//!
//! Repository backends for the scheduling engine.
//!
//! ```text
//! Backend
//!   ├── MemoryStore  single RwLock, tests and throwaway daemons
//!   └── SqliteStore  WAL journal, conditional UPDATE claims, CAS by version
//! ```

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use colony_core::config::DatabaseConfig;
use colony_core::error::{ColonyError, Result};
use colony_core::traits::Stores;
use std::sync::Arc;

/// A concrete backend chosen from configuration.
pub enum Backend {
    Memory(Arc<MemoryStore>),
    Sqlite(Arc<SqliteStore>),
}

impl Backend {
    /// Open the backend named by `config.backend` ("memory" or "sqlite").
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        match config.backend.as_str() {
            "memory" => Ok(Self::Memory(Arc::new(MemoryStore::new()))),
            "sqlite" => Ok(Self::Sqlite(Arc::new(SqliteStore::open(&config.resolved_path())?))),
            other => Err(ColonyError::Config(format!("Unknown database backend: {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Sqlite(_) => "sqlite",
        }
    }

    pub fn stores(&self) -> Stores {
        match self {
            Self::Memory(m) => Stores::from_backend(m.clone()),
            Self::Sqlite(s) => Stores::from_backend(s.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory_backend() {
        let config = DatabaseConfig {
            backend: "memory".into(),
            path: String::new(),
        };
        let backend = Backend::open(&config).unwrap();
        assert_eq!(backend.name(), "memory");
    }

    #[test]
    fn test_unknown_backend() {
        let config = DatabaseConfig {
            backend: "postgres".into(),
            path: String::new(),
        };
        assert!(matches!(Backend::open(&config), Err(ColonyError::Config(_))));
    }
}
