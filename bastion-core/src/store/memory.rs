//! In-memory record store. The binary seeds it from a JSON document at
//! startup; tests seed it directly.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{CoreError, Result};

use super::{Bastion, ConfigStore, Mapping};

#[derive(Debug, Default, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub bastions: Vec<Bastion>,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    bastions: HashMap<String, Bastion>,
    mappings: HashMap<String, Mapping>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write().expect("store lock poisoned");
            for b in seed.bastions {
                inner.bastions.insert(b.name.clone(), b);
            }
            for m in seed.mappings {
                inner.mappings.insert(m.id.clone(), m);
            }
        }
        store
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let seed: StoreSeed = serde_json::from_str(raw)
            .map_err(|e| CoreError::InvalidRequest(format!("bad store document: {}", e)))?;
        Ok(Self::from_seed(seed))
    }

    pub fn put_bastion(&self, bastion: Bastion) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.bastions.insert(bastion.name.clone(), bastion);
    }

    pub fn put_mapping(&self, mapping: Mapping) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.mappings.insert(mapping.id.clone(), mapping);
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn list_bastions_by_names(&self, names: &[String]) -> Result<Vec<Bastion>> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match inner.bastions.get(name) {
                Some(b) => out.push(b.clone()),
                None => {
                    return Err(CoreError::NotFound(format!("bastion '{}'", name)));
                }
            }
        }
        Ok(out)
    }

    async fn get_mapping(&self, id: &str) -> Result<Mapping> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .mappings
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("mapping '{}'", id)))
    }

    async fn list_mappings(&self) -> Result<Vec<Mapping>> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.mappings.values().cloned().collect())
    }

    async fn list_mappings_by_local_port(&self, port: u16) -> Result<Vec<Mapping>> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .mappings
            .values()
            .filter(|m| m.local_port == port)
            .cloned()
            .collect())
    }
}
