//! Per-flow progress persistence on top of a [`FlowCache`].

use std::sync::Arc;

use tracing::warn;

use super::cache::FlowCache;
use crate::types::{normalize_page_num, FlowDefinition, FlowProgress};

const FIELD_DEFINITION: &str = "definition";
const FIELD_STEP_INDEX: &str = "stepIndex";
const FIELD_MODULE_PAGE_NUM: &str = "modulePageNum";
const FIELD_COMPLETED: &str = "completed";

const ALL_FIELDS: [&str; 4] = [
    FIELD_DEFINITION,
    FIELD_STEP_INDEX,
    FIELD_MODULE_PAGE_NUM,
    FIELD_COMPLETED,
];

/// Cache key for one field of one flow
pub fn flow_key(flow_id: &str, field: &str) -> String {
    format!("flow.{flow_id}.{field}")
}

/// Typed view of the cached fields for one flow.
///
/// Nothing here returns an error: an unreadable or unwritable cache is
/// logged and treated as empty.
#[derive(Clone)]
pub struct ProgressStore {
    flow_id: String,
    cache: Arc<dyn FlowCache>,
}

impl ProgressStore {
    pub fn new(flow_id: impl Into<String>, cache: Arc<dyn FlowCache>) -> Self {
        Self {
            flow_id: flow_id.into(),
            cache,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    fn read(&self, field: &str) -> Option<String> {
        match self.cache.get(&flow_key(&self.flow_id, field)) {
            Ok(value) => value,
            Err(e) => {
                warn!(flow_id = %self.flow_id, field, error = %e, "Failed to read flow cache");
                None
            }
        }
    }

    fn write(&self, field: &str, value: &str) {
        if let Err(e) = self.cache.set(&flow_key(&self.flow_id, field), value) {
            warn!(flow_id = %self.flow_id, field, error = %e, "Failed to write flow cache");
        }
    }

    fn delete(&self, field: &str) {
        if let Err(e) = self.cache.remove(&flow_key(&self.flow_id, field)) {
            warn!(flow_id = %self.flow_id, field, error = %e, "Failed to remove flow cache entry");
        }
    }

    pub fn load_definition(&self) -> Option<FlowDefinition> {
        let raw = self.read(FIELD_DEFINITION)?;
        match serde_json::from_str(&raw) {
            Ok(definition) => Some(definition),
            Err(e) => {
                warn!(flow_id = %self.flow_id, error = %e, "Failed to parse cached definition");
                None
            }
        }
    }

    pub fn save_definition(&self, definition: &FlowDefinition) {
        match serde_json::to_string(definition) {
            Ok(raw) => self.write(FIELD_DEFINITION, &raw),
            Err(e) => warn!(flow_id = %self.flow_id, error = %e, "Failed to cache definition"),
        }
    }

    /// Cached progress, or `None` when neither step nor page was ever stored
    pub fn load_progress(&self) -> Option<FlowProgress> {
        let step_raw = self.read(FIELD_STEP_INDEX);
        let page_raw = self.read(FIELD_MODULE_PAGE_NUM);

        if step_raw.is_none() && page_raw.is_none() {
            return None;
        }

        let step_index = step_raw
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(0);
        let module_page_num = page_raw.filter(|p| !p.trim().is_empty());

        Some(FlowProgress {
            step_index,
            module_page_num,
            ..FlowProgress::default()
        })
    }

    /// Write step and page; a missing page removes the cached one
    pub fn persist_progress(&self, progress: &FlowProgress) {
        self.write(FIELD_STEP_INDEX, &progress.step_index.to_string());

        match normalize_page_num(progress.module_page_num.as_deref()) {
            Some(page) => self.write(FIELD_MODULE_PAGE_NUM, &page),
            None => self.delete(FIELD_MODULE_PAGE_NUM),
        }

        if progress.is_completed() {
            self.write(FIELD_COMPLETED, "true");
        }
    }

    pub fn mark_completed(&self) {
        self.write(FIELD_COMPLETED, "true");
    }

    pub fn is_completed(&self) -> bool {
        self.read(FIELD_COMPLETED).as_deref() == Some("true")
    }

    /// Remove every cached field for this flow
    pub fn clear(&self) {
        for field in ALL_FIELDS {
            self.delete(field);
        }
    }
}
