//! Persistence sink: a small key-value store behind a trait.
//!
//! `SledStore` is the on-device backend (direct host filesystem); `MemoryStore` backs tests
//! and ephemeral sessions. `TypedStore` layers JSON (de)serialization on top.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreResult;

const STORE_DEFAULT_PATH: &str = "./data/sentinel_store";

/// Last-write-wins byte store. No transactions.
pub trait KvStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Sled-backed store. Every write is flushed so a crash loses at most the in-flight write.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open at the given path, or `./data/sentinel_store`.
    pub fn open(path: Option<impl AsRef<Path>>) -> StoreResult<Self> {
        let p = path
            .map(|x| x.as_ref().to_path_buf())
            .unwrap_or_else(|| Path::new(STORE_DEFAULT_PATH).to_path_buf());
        let db = sled::open(p)?;
        Ok(Self { db })
    }

    /// Throwaway database removed on drop.
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.db.insert(key.as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.db.remove(key.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// JSON view over a shared `KvStore`.
#[derive(Clone)]
pub struct TypedStore {
    inner: Arc<dyn KvStore>,
}

impl TypedStore {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self { inner }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.inner.put(key, &bytes)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.inner.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key)
    }

    pub fn raw(&self) -> &Arc<dyn KvStore> {
        &self.inner
    }
}
