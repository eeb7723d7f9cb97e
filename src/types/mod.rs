//! Flow data model shared by the store, orchestrator and controller.

pub mod flow;
pub mod page_num;

pub use flow::{
    normalize_page_num, FlowContextOperation, FlowContextValue, FlowDefinition, FlowProgress,
    FlowStep, TransitionPage,
};
pub use page_num::CompositePageNum;
