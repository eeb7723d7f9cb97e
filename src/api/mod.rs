//! Assessment backend access: transport, envelope handling and endpoints.

pub mod client;
pub mod endpoints;
pub mod envelope;
pub mod error;

pub use client::{ApiClient, HttpApiClient};
pub use endpoints::FlowEndpoints;
pub use envelope::extract_payload;
pub use error::ApiError;
