//! Host navigation interception.

pub mod bridge;

pub use bridge::{
    after_navigate, before_navigate, navigate_fn, AfterNavigate, BeforeNavigate,
    FlowContextBinding, FlowContextSink, HostContext, NavigateFn, NavigateOptions,
    NavigationBridge, DEFAULT_ALIASES, PRIMARY_ENTRY_POINT,
};
