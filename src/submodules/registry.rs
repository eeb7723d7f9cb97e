//! Id-keyed table of submodule definitions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{SubmoduleCatalog, SubmoduleDefinition};

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("submodule id must not be empty")]
    EmptySubmoduleId,

    #[error("submodule installer failed: {0}")]
    InstallFailed(String),
}

/// Deferred source of definitions, run once by [`SubmoduleRegistry::initialize`]
pub type SubmoduleInstaller = Box<
    dyn FnOnce() -> BoxFuture<'static, Result<Vec<Arc<dyn SubmoduleDefinition>>, RegistryError>>
        + Send,
>;

/// Lookup table from submodule id to definition.
#[derive(Default)]
pub struct SubmoduleRegistry {
    entries: RwLock<BTreeMap<String, Arc<dyn SubmoduleDefinition>>>,
    installers: Mutex<Vec<SubmoduleInstaller>>,
    initialized: tokio::sync::Mutex<bool>,
}

impl SubmoduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any previous one with the same id
    pub fn register(&self, definition: Arc<dyn SubmoduleDefinition>) -> Result<(), RegistryError> {
        let id = definition.submodule_id().trim().to_string();
        if id.is_empty() {
            return Err(RegistryError::EmptySubmoduleId);
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&id) {
            warn!(submodule_id = %id, "Submodule already registered, overwriting");
        }
        entries.insert(id.clone(), definition);
        debug!(submodule_id = %id, "Registered submodule");
        Ok(())
    }

    /// Queue definitions to be installed on the first `initialize`
    pub fn defer(&self, installer: SubmoduleInstaller) {
        self.installers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(installer);
    }

    pub fn has(&self, submodule_id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(submodule_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SubmoduleCatalog for SubmoduleRegistry {
    async fn initialize(&self) -> Result<(), RegistryError> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        let pending: Vec<SubmoduleInstaller> = std::mem::take(
            &mut *self
                .installers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for installer in pending {
            for definition in installer().await? {
                self.register(definition)?;
            }
        }

        *initialized = true;
        info!(count = self.len(), ids = ?self.ids(), "Submodule registry initialized");
        Ok(())
    }

    fn get(&self, submodule_id: &str) -> Option<Arc<dyn SubmoduleDefinition>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(submodule_id)
            .cloned()
    }
}
