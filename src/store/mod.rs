//! Durable per-flow storage.

pub mod cache;
pub mod progress;

pub use cache::{CacheError, FileFlowCache, FlowCache, MemoryFlowCache};
pub use progress::{flow_key, ProgressStore};
