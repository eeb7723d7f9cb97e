//! URL builders for the flow endpoints.

use crate::config::EndpointsConfig;

/// Progress path used when no progress template is configured
pub const FALLBACK_PROGRESS_TEMPLATE: &str = "/api/flows/{flow_id}/progress";

const FLOW_ID_PLACEHOLDER: &str = "{flow_id}";

/// Definition and progress paths for a flow id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEndpoints {
    definition: String,
    progress: Option<String>,
}

impl Default for FlowEndpoints {
    fn default() -> Self {
        Self::from_config(&EndpointsConfig::default())
    }
}

impl FlowEndpoints {
    pub fn new(definition: impl Into<String>, progress: Option<String>) -> Self {
        Self {
            definition: definition.into(),
            progress,
        }
    }

    pub fn from_config(config: &EndpointsConfig) -> Self {
        Self::new(config.definition.clone(), config.progress.clone())
    }

    /// Path serving the definition (optionally with embedded progress)
    pub fn definition(&self, flow_id: &str) -> String {
        fill(&self.definition, flow_id)
    }

    /// Path for progress reads and heartbeat pushes
    pub fn progress(&self, flow_id: &str) -> String {
        let template = self
            .progress
            .as_deref()
            .unwrap_or(FALLBACK_PROGRESS_TEMPLATE);
        fill(template, flow_id)
    }
}

fn fill(template: &str, flow_id: &str) -> String {
    template.replace(FLOW_ID_PLACEHOLDER, flow_id)
}
