use crate::{json_file, Result};
use async_trait::async_trait;
use faas_common::Function;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Function metadata store keyed by function name.
///
/// Every operation is atomic for its key. `insert` is a compare-and-insert:
/// it returns `false` and leaves the existing record untouched when the name
/// is already taken.
#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;
    async fn insert(&self, function: &Function) -> Result<bool>;
    async fn delete(&self, name: &str) -> Result<bool>;
    async fn get_by_name(&self, name: &str) -> Result<Option<Function>>;
    async fn get_all(&self) -> Result<Vec<Function>>;
}

// In-memory registry for development/testing
#[derive(Default, Clone)]
pub struct InMemoryRegistry {
    functions: Arc<RwLock<BTreeMap<String, Function>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FunctionRegistry for InMemoryRegistry {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.functions.read().await.contains_key(name))
    }

    async fn insert(&self, function: &Function) -> Result<bool> {
        let mut functions = self.functions.write().await;
        if functions.contains_key(&function.name) {
            return Ok(false);
        }
        functions.insert(function.name.clone(), function.clone());
        Ok(true)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.functions.write().await.remove(name).is_some())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Function>> {
        Ok(self.functions.read().await.get(name).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Function>> {
        Ok(self.functions.read().await.values().cloned().collect())
    }
}

/// Registry backed by a single JSON document, rewritten on every mutation.
pub struct JsonFileRegistry {
    path: PathBuf,
    functions: RwLock<BTreeMap<String, Function>>,
}

impl JsonFileRegistry {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let functions: BTreeMap<String, Function> = json_file::load(&path).await?;
        info!(path = %path.display(), count = functions.len(), "Loaded function registry");
        Ok(Self {
            path,
            functions: RwLock::new(functions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FunctionRegistry for JsonFileRegistry {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.functions.read().await.contains_key(name))
    }

    async fn insert(&self, function: &Function) -> Result<bool> {
        let mut functions = self.functions.write().await;
        if functions.contains_key(&function.name) {
            return Ok(false);
        }
        functions.insert(function.name.clone(), function.clone());
        if let Err(e) = json_file::save(&self.path, &*functions).await {
            // Keep memory and disk in agreement.
            functions.remove(&function.name);
            return Err(e);
        }
        debug!(name = %function.name, "Function record persisted");
        Ok(true)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut functions = self.functions.write().await;
        let Some(removed) = functions.remove(name) else {
            return Ok(false);
        };
        if let Err(e) = json_file::save(&self.path, &*functions).await {
            functions.insert(name.to_string(), removed);
            return Err(e);
        }
        Ok(true)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Function>> {
        Ok(self.functions.read().await.get(name).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Function>> {
        Ok(self.functions.read().await.values().cloned().collect())
    }
}
