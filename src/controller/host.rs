//! Host application seam and the submodule mount contract.

use async_trait::async_trait;
use serde_json::Value;

use super::flow_controller::FlowController;
use crate::types::FlowContextOperation;

/// Services the surrounding application provides to a flow.
#[async_trait]
pub trait FlowHost: Send + Sync {
    /// Record an operation; returns whether it was accepted
    fn log_operation(&self, operation: FlowContextOperation) -> bool;

    /// Called once when the last step completes, before the redirect
    async fn on_flow_completed(&self) {}

    /// Leave the flow for `route`
    async fn redirect(&self, route: &str);
}

/// Everything a submodule receives when it is shown.
#[derive(Clone)]
pub struct SubmoduleMount {
    pub user_context: Value,
    pub initial_page_id: String,
    /// The step's `overrides`, or `null`
    pub options: Value,
    pub flow_context: FlowContextHandle,
}

/// The flow as seen from inside a submodule
#[derive(Clone)]
pub struct FlowContextHandle {
    pub flow_id: String,
    pub submodule_id: String,
    pub step_index: usize,
    pub module_page_num: Option<String>,
    pub(crate) controller: FlowController,
}

impl FlowContextHandle {
    /// The submodule finished its last page
    pub async fn on_complete(&self) {
        self.controller.complete_step(Some(self.step_index)).await;
    }

    /// Time ran out; handled like completion
    pub async fn on_timeout(&self) {
        self.controller.complete_step(Some(self.step_index)).await;
    }

    /// Persist the submodule's current page number
    pub fn update_module_progress(&self, page_num: &str) {
        self.controller.update_module_progress(page_num);
    }
}
