//! Submodules: independently built assessment tasks plugged into flow steps.
//!
//! The orchestrator only sees the [`SubmoduleDefinition`] capability set and
//! looks definitions up by id through a [`SubmoduleCatalog`].

mod paged;
mod registry;

use async_trait::async_trait;
use std::sync::Arc;

pub use paged::PagedSubmodule;
pub use registry::{RegistryError, SubmoduleInstaller, SubmoduleRegistry};

/// Capabilities a submodule exposes to the flow.
pub trait SubmoduleDefinition: Send + Sync {
    /// Kebab-case id referenced by `FlowStep::submodule_id`
    fn submodule_id(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Page to open for a page-number token (`"1"` when nothing is stored)
    fn initial_page(&self, page_num: &str) -> String;

    /// Map a page id back to the page number worth persisting
    fn resolve_page_num(&self, _page_id: &str) -> Option<String> {
        None
    }

    /// Number of pages the submodule considers "done" at, if it knows
    fn total_steps(&self) -> Option<u32> {
        None
    }

    fn on_initialize(&self) {}

    fn on_destroy(&self) {}
}

/// Lookup of submodule definitions by id.
#[async_trait]
pub trait SubmoduleCatalog: Send + Sync {
    /// Idempotent; must finish before `get` is meaningful
    async fn initialize(&self) -> Result<(), RegistryError>;

    fn get(&self, submodule_id: &str) -> Option<Arc<dyn SubmoduleDefinition>>;
}
