//! Flow orchestration: loading, resolving and advancing a flow.

mod error;
mod flow_orchestrator;
mod normalize;
mod resolve;

pub use error::FlowError;
pub use flow_orchestrator::{FlowOrchestrator, FlowServices, LoadedFlow, PageNumUpdate};
pub use normalize::normalize_progress;
pub use resolve::{resolve_progress, ResolveResult, DEFAULT_PAGE_NUM};
