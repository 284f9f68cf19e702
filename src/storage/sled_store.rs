// Sled-backed key-value store for secrets, deadline fallbacks and caches.
use crate::storage::KeyValueStore;
use anyhow::Context;
use sled::{
    Config,
    Db,
    Tree,
};
use std::path::Path;

const TREE_NAME: &str = "rps_mirror";

#[derive(Clone)]
pub struct SledStore {
    tree: Tree,
}

impl SledStore {
    pub fn new(db: &Db) -> crate::Result<Self> {
        let tree = db
            .open_tree(TREE_NAME)
            .with_context(|| format!("open {TREE_NAME} tree"))?;
        Ok(Self { tree })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let config = Config::default().path(path);
        let db = config.open().context("open sled database")?;
        Self::new(&db)
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> crate::Result<Option<Vec<u8>>> {
        let value = self
            .tree
            .get(key.as_bytes())
            .with_context(|| format!("read {key}"))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> crate::Result<()> {
        self.tree
            .insert(key.as_bytes(), value)
            .with_context(|| format!("write {key}"))?;
        self.tree.flush().with_context(|| format!("flush {key}"))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> crate::Result<()> {
        self.tree
            .remove(key.as_bytes())
            .with_context(|| format!("remove {key}"))?;
        self.tree.flush().with_context(|| format!("flush {key}"))?;
        Ok(())
    }
}
