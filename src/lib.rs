//! Assessment flow - orchestration of multi-step timed assessments
//!
//! A flow is an ordered list of steps, each backed by a submodule. This
//! crate loads flow definitions, tracks and persists a student's progress,
//! drives the active step and reports progress back to the backend.

pub mod api;
pub mod config;
pub mod controller;
pub mod logging;
pub mod navigation;
pub mod orchestrator;
pub mod services;
pub mod store;
pub mod submodules;
pub mod types;
