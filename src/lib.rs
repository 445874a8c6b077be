// Bramble - disk-backed ordered key/value storage engine core

pub mod block;
pub mod btree;
pub mod error;
pub mod handle;
pub mod meta;
pub mod reconcile;

use std::sync::Arc;

pub use error::{EngineError, Result};

use block::{BlockStore, FileBlockStore, MemBlockStore};
use btree::TreeConfig;
use handle::HandleRegistry;
use meta::{Catalog, MemCatalog};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub leaf_page_max: u32,
    pub int_page_max: u32,
    pub split_pct: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            leaf_page_max: 32 * 1024,
            int_page_max: 16 * 1024,
            split_pct: 75,
        }
    }
}

impl Config {
    /// Tree defaults derived from the engine configuration.
    pub fn tree_defaults(&self) -> TreeConfig {
        TreeConfig {
            leaf_page_max: self.leaf_page_max,
            int_page_max: self.int_page_max,
            split_pct: self.split_pct,
            ..TreeConfig::default()
        }
    }
}

/// The engine: a block store, a metadata catalog, and the handle registry
/// mediating every table access.
pub struct Engine {
    config: Config,
    store: Arc<dyn BlockStore>,
    catalog: Arc<dyn Catalog>,
    registry: HandleRegistry,
}

impl Engine {
    /// Open an engine backed by a single block file under `data_dir`.
    pub fn open(config: Config) -> Result<Engine> {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = std::path::Path::new(&config.data_dir).join("bramble.db");
        let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::create(&path)?);
        Ok(Self::assemble(config, store))
    }

    /// Open an engine with heap-backed blocks; used by tests and tools.
    pub fn open_in_memory(config: Config) -> Engine {
        let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new());
        Self::assemble(config, store)
    }

    fn assemble(config: Config, store: Arc<dyn BlockStore>) -> Engine {
        let catalog: Arc<dyn Catalog> = Arc::new(MemCatalog::new());
        let registry = HandleRegistry::new(catalog.clone(), store.clone());
        Engine {
            config,
            store,
            catalog,
            registry,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Register a table with explicit tuning.
    pub fn create_table(&self, name: &str, config: TreeConfig) -> Result<()> {
        self.catalog.create(name, config)
    }

    /// Close every handle: user tables first, metadata last.
    pub fn shutdown(&self) -> Result<()> {
        self.registry.discard_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::OpenFlags;

    #[test]
    fn engine_round_trip() {
        let engine = Engine::open_in_memory(Config::default());
        engine
            .create_table("t", engine.config().tree_defaults())
            .unwrap();
        let h = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
        let tree = h.tree().unwrap();
        tree.root().unwrap().row_insert(b"k", b"v");
        engine.registry().release(h).unwrap();
        engine.shutdown().unwrap();
        assert!(engine
            .catalog()
            .checkpoint_addr("t", meta::LIVE_CHECKPOINT)
            .unwrap()
            .is_valid());
    }

    #[test]
    fn missing_table_is_not_found() {
        let engine = Engine::open_in_memory(Config::default());
        let err = engine
            .registry()
            .get("nope", None, OpenFlags::empty())
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
