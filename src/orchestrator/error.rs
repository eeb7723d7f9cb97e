use thiserror::Error;

use crate::submodules::RegistryError;

/// Failures of the flow orchestrator and controller.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error("flow definition not found for {flow_id}")]
    DefinitionNotFound { flow_id: String },

    #[error("flow {flow_id} has no steps")]
    EmptyFlow { flow_id: String },

    #[error("orchestrator for flow {flow_id} has been disposed")]
    Disposed { flow_id: String },

    #[error("submodule not found: {submodule_id}")]
    SubmoduleNotFound { submodule_id: String },

    #[error("submodule registry failed: {0}")]
    Registry(#[from] RegistryError),
}

impl FlowError {
    pub fn disposed(flow_id: impl Into<String>) -> Self {
        FlowError::Disposed {
            flow_id: flow_id.into(),
        }
    }

    /// An expected teardown race, never shown to the student
    pub fn is_disposed(&self) -> bool {
        matches!(self, FlowError::Disposed { .. })
    }

    /// Whether retrying the load sequence can help
    pub fn is_retryable(&self) -> bool {
        !self.is_disposed()
    }
}
