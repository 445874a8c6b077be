//! Metadata catalog contract.
//!
//! The handle manager reads table configuration and checkpoint root
//! addresses through this trait; a full catalog (itself stored in a table)
//! lives outside the engine core. `MemCatalog` is the in-crate stand-in.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::block::BlockOff;
use crate::btree::TreeConfig;
use crate::error::{EngineError, Result};

/// Checkpoint name used for the live (non-checkpoint) tree.
pub const LIVE_CHECKPOINT: &str = "";

pub trait Catalog: Send + Sync {
    /// The opaque configuration string recorded for a table.
    fn read(&self, name: &str) -> Result<String>;

    /// Typed tuning values for a table.
    fn tree_config(&self, name: &str) -> Result<TreeConfig>;

    /// Root cookie for `(name, checkpoint)`.
    fn checkpoint_addr(&self, name: &str, checkpoint: &str) -> Result<BlockOff>;

    /// Record the root cookie for `(name, checkpoint)`.
    fn set_checkpoint_addr(&self, name: &str, checkpoint: &str, off: BlockOff) -> Result<()>;

    /// Register a table.
    fn create(&self, name: &str, config: TreeConfig) -> Result<()>;

    /// Forget a table and all its checkpoints.
    fn remove(&self, name: &str) -> Result<()>;
}

struct TableMeta {
    config: TreeConfig,
    checkpoints: HashMap<String, BlockOff>,
}

pub struct MemCatalog {
    tables: RwLock<HashMap<String, TableMeta>>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog for MemCatalog {
    fn read(&self, name: &str) -> Result<String> {
        let tables = self.tables.read();
        let meta = tables
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("table {name}")))?;
        Ok(meta.config.render())
    }

    fn tree_config(&self, name: &str) -> Result<TreeConfig> {
        let tables = self.tables.read();
        tables
            .get(name)
            .map(|m| m.config.clone())
            .ok_or_else(|| EngineError::NotFound(format!("table {name}")))
    }

    fn checkpoint_addr(&self, name: &str, checkpoint: &str) -> Result<BlockOff> {
        let tables = self.tables.read();
        let meta = tables
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("table {name}")))?;
        meta.checkpoints.get(checkpoint).copied().ok_or_else(|| {
            EngineError::NotFound(format!("table {name} checkpoint {checkpoint:?}"))
        })
    }

    fn set_checkpoint_addr(&self, name: &str, checkpoint: &str, off: BlockOff) -> Result<()> {
        let mut tables = self.tables.write();
        let meta = tables
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(format!("table {name}")))?;
        meta.checkpoints.insert(checkpoint.to_string(), off);
        Ok(())
    }

    fn create(&self, name: &str, config: TreeConfig) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(EngineError::InvalidState(format!(
                "table {name} already exists"
            )));
        }
        tables.insert(
            name.to_string(),
            TableMeta {
                config,
                checkpoints: HashMap::new(),
            },
        );
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.remove(name).is_none() {
            return Err(EngineError::NotFound(format!("table {name}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_table_is_not_found() {
        let catalog = MemCatalog::new();
        assert!(catalog.read("nope").unwrap_err().is_not_found());
        assert!(catalog
            .checkpoint_addr("nope", LIVE_CHECKPOINT)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn checkpoint_addr_round_trip() {
        let catalog = MemCatalog::new();
        catalog.create("t", TreeConfig::default()).unwrap();
        assert!(catalog
            .checkpoint_addr("t", LIVE_CHECKPOINT)
            .unwrap_err()
            .is_not_found());
        let off = BlockOff { addr: 7, size: 512 };
        catalog.set_checkpoint_addr("t", LIVE_CHECKPOINT, off).unwrap();
        assert_eq!(catalog.checkpoint_addr("t", LIVE_CHECKPOINT).unwrap(), off);
        catalog.set_checkpoint_addr("t", "snap1", off).unwrap();
        assert_eq!(catalog.checkpoint_addr("t", "snap1").unwrap(), off);
    }

    #[test]
    fn duplicate_create_rejected() {
        let catalog = MemCatalog::new();
        catalog.create("t", TreeConfig::default()).unwrap();
        assert!(catalog.create("t", TreeConfig::default()).is_err());
    }
}
