//! Flow controller and its host-facing contracts.

mod flow_controller;
mod host;
mod state;

pub use flow_controller::{
    flow_id_from_url, ControllerSettings, FlowController, DEFAULT_COMPLETION_ROUTE,
};
pub use host::{FlowContextHandle, FlowHost, SubmoduleMount};
pub use state::{FlowPhase, FlowViewState};
