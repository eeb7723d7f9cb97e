//! Progress heartbeat - best-effort periodic push of the current position.
//!
//! The local progress store stays authoritative; a failed tick is logged and
//! the next tick is the retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{ApiClient, ApiError};
use crate::orchestrator::{FlowOrchestrator, DEFAULT_PAGE_NUM};
use crate::types::FlowProgress;

/// Default push interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Configured intervals below this are raised to it
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Student identifiers attached to every heartbeat when known
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatIdentity {
    pub exam_no: Option<String>,
    pub batch_code: Option<String>,
}

impl HeartbeatIdentity {
    /// Pick `examNo`/`batchCode` out of a host user context
    pub fn from_user_context(user_context: &Value) -> Self {
        let field = |name: &str| {
            user_context.get(name).and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };
        Self {
            exam_no: field("examNo"),
            batch_code: field("batchCode"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub flow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exam_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_code: Option<String>,
    pub step_index: i64,
    pub module_page_num: String,
    /// Milliseconds since the epoch
    pub ts: i64,
}

impl HeartbeatPayload {
    pub fn new(flow_id: &str, progress: &FlowProgress, identity: &HeartbeatIdentity) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            exam_no: identity.exam_no.clone(),
            batch_code: identity.batch_code.clone(),
            step_index: progress.step_index,
            module_page_num: progress
                .module_page_num
                .clone()
                .unwrap_or_else(|| DEFAULT_PAGE_NUM.to_string()),
            ts: Utc::now().timestamp_millis(),
        }
    }
}

/// POST one heartbeat. Never retried.
pub async fn push_heartbeat(
    api: &dyn ApiClient,
    path: &str,
    payload: &HeartbeatPayload,
) -> Result<(), ApiError> {
    let body = serde_json::to_value(payload)?;
    api.post(path, &body).await?;
    debug!(
        flow_id = %payload.flow_id,
        step_index = payload.step_index,
        module_page_num = %payload.module_page_num,
        "Heartbeat sent"
    );
    Ok(())
}

/// Clamp a configured interval to the allowed minimum
pub fn effective_interval(interval: Duration) -> Duration {
    interval.max(MIN_HEARTBEAT_INTERVAL)
}

/// Periodic heartbeat for one orchestrator
pub struct ProgressHeartbeat {
    orchestrator: Arc<FlowOrchestrator>,
    api: Arc<dyn ApiClient>,
    path: String,
    interval: Duration,
    identity: HeartbeatIdentity,
}

impl ProgressHeartbeat {
    pub fn new(orchestrator: Arc<FlowOrchestrator>) -> Self {
        let services = orchestrator.services();
        let api = services.api.clone();
        let path = services.endpoints.progress(orchestrator.flow_id());
        Self {
            orchestrator,
            api,
            path,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            identity: HeartbeatIdentity::default(),
        }
    }

    /// Tick interval, used as given
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_identity(mut self, identity: HeartbeatIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Payload for the orchestrator's latest progress
    fn payload(&self) -> Option<HeartbeatPayload> {
        let progress = self.orchestrator.progress()?;
        Some(HeartbeatPayload::new(
            self.orchestrator.flow_id(),
            &progress,
            &self.identity,
        ))
    }

    /// Send one heartbeat now; failures are logged
    pub async fn tick(&self) {
        let Some(payload) = self.payload() else {
            debug!(flow_id = %self.orchestrator.flow_id(), "No progress to report, skipping heartbeat");
            return;
        };
        if let Err(e) = push_heartbeat(self.api.as_ref(), &self.path, &payload).await {
            warn!(
                flow_id = %payload.flow_id,
                step_index = payload.step_index,
                error = %e,
                "Heartbeat failed"
            );
        }
    }

    /// Tick until cancelled or the orchestrator is disposed. The first tick
    /// fires immediately; ticks never overlap.
    #[instrument(skip_all, fields(flow_id = %self.orchestrator.flow_id()))]
    pub async fn run(self, cancel: CancellationToken) {
        info!("Heartbeat started, interval: {:?}", self.interval);

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Heartbeat stopped");
                    break;
                }
                _ = interval.tick() => {
                    if self.orchestrator.is_disposed() {
                        debug!("Orchestrator disposed, heartbeat stopping");
                        break;
                    }
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.tick() => {}
                    }
                }
            }
        }
    }

    pub fn spawn(self) -> HeartbeatHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        HeartbeatHandle {
            cancel,
            task: Some(task),
        }
    }
}

/// Running heartbeat; dropping it stops the task
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop and wait for the task to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
