//! Mapping of (definition, progress) to the step and submodule to show.

use std::fmt;
use std::sync::Arc;

use tracing::error;

use crate::submodules::{SubmoduleCatalog, SubmoduleDefinition};
use crate::types::{normalize_page_num, FlowDefinition, FlowProgress, FlowStep};

/// Page number handed to a submodule when nothing is stored
pub const DEFAULT_PAGE_NUM: &str = "1";

/// Where the student is right now.
#[derive(Clone)]
pub struct ResolveResult {
    pub step_index: usize,
    pub step: Option<FlowStep>,
    pub submodule_id: Option<String>,
    pub module_page_num: Option<String>,
    pub initial_page_id: Option<String>,
    /// `None` when the step's submodule is not registered
    pub submodule: Option<Arc<dyn SubmoduleDefinition>>,
}

impl ResolveResult {
    pub fn has_submodule(&self) -> bool {
        self.submodule.is_some()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.step
            .as_ref()
            .and_then(|s| s.display_name.as_deref())
            .or_else(|| self.submodule.as_ref().map(|s| s.display_name()))
    }
}

impl fmt::Debug for ResolveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveResult")
            .field("step_index", &self.step_index)
            .field("submodule_id", &self.submodule_id)
            .field("module_page_num", &self.module_page_num)
            .field("initial_page_id", &self.initial_page_id)
            .field("has_submodule", &self.has_submodule())
            .finish_non_exhaustive()
    }
}

/// Resolve progress against a definition. Never fails: an unregistered
/// submodule is logged and reported as `submodule: None`.
pub fn resolve_progress(
    definition: &FlowDefinition,
    progress: &FlowProgress,
    catalog: &dyn SubmoduleCatalog,
) -> ResolveResult {
    let step_index = definition.clamp_step_index(progress.step_index);
    let step = definition.steps.get(step_index).cloned();
    let submodule_id = step.as_ref().map(|s| s.submodule_id.clone());

    let submodule = submodule_id.as_deref().and_then(|id| {
        let found = catalog.get(id);
        if found.is_none() {
            error!(
                flow_id = %definition.flow_id,
                step_index,
                submodule_id = id,
                "Submodule not registered"
            );
        }
        found
    });

    let module_page_num = normalize_page_num(progress.module_page_num.as_deref());
    let initial_page_id = submodule.as_ref().map(|s| {
        s.initial_page(module_page_num.as_deref().unwrap_or(DEFAULT_PAGE_NUM))
    });

    ResolveResult {
        step_index,
        step,
        submodule_id,
        module_page_num,
        initial_page_id,
        submodule,
    }
}
