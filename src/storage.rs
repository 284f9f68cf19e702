use anyhow::Context;
use serde::{
    Serialize,
    de::DeserializeOwned,
};
use std::sync::Arc;

pub mod in_memory_store;
pub mod sled_store;

pub use in_memory_store::InMemoryStore;
pub use sled_store::SledStore;

/// Durable client-side key-value store. Every component mirrors its state here
/// right after mutating it.
pub trait KeyValueStore: Send + Sync {
    /// read the raw value stored under `key`
    fn get(&self, key: &str) -> crate::Result<Option<Vec<u8>>>;

    /// write or overwrite the value under `key`
    fn put(&self, key: &str, value: &[u8]) -> crate::Result<()>;

    /// remove `key`, a missing key is not an error
    fn remove(&self, key: &str) -> crate::Result<()>;
}

pub type SharedStore = Arc<dyn KeyValueStore>;

pub fn read_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> crate::Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .with_context(|| format!("deserialize value stored under {key}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub fn write_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> crate::Result<()> {
    let bytes = serde_json::to_vec(value)
        .with_context(|| format!("serialize value for {key}"))?;
    store.put(key, &bytes)
}
