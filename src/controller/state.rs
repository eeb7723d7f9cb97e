//! Observable controller state.

use crate::orchestrator::ResolveResult;
use crate::types::{FlowDefinition, FlowProgress, TransitionPage};

/// What the controller is currently showing.
#[derive(Debug, Clone, Default)]
pub enum FlowPhase {
    /// No flow id
    #[default]
    Idle,
    Loading,
    /// Load failed; `retryable` errors offer a retry action
    Error { message: String, retryable: bool },
    /// Between steps, waiting for acknowledgement
    Transition(TransitionPage),
    Active(ResolveResult),
    /// Last step finished, student redirected away
    Completed,
}

impl FlowPhase {
    pub fn name(&self) -> &'static str {
        match self {
            FlowPhase::Idle => "idle",
            FlowPhase::Loading => "loading",
            FlowPhase::Error { .. } => "error",
            FlowPhase::Transition(_) => "transition",
            FlowPhase::Active(_) => "active",
            FlowPhase::Completed => "completed",
        }
    }
}

/// Snapshot published on every controller state change
#[derive(Debug, Clone, Default)]
pub struct FlowViewState {
    pub flow_id: Option<String>,
    pub phase: FlowPhase,
    pub definition: Option<FlowDefinition>,
    pub progress: Option<FlowProgress>,
}

impl FlowViewState {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn loading(flow_id: &str) -> Self {
        Self {
            flow_id: Some(flow_id.to_string()),
            phase: FlowPhase::Loading,
            ..Self::default()
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.phase, FlowPhase::Loading)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.phase, FlowPhase::Completed)
    }

    pub fn active(&self) -> Option<&ResolveResult> {
        match &self.phase {
            FlowPhase::Active(resolved) => Some(resolved),
            _ => None,
        }
    }

    pub fn transition(&self) -> Option<&TransitionPage> {
        match &self.phase {
            FlowPhase::Transition(page) => Some(page),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.phase {
            FlowPhase::Error { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Heartbeats only run while a resolved step is on screen
    pub fn wants_heartbeat(&self) -> bool {
        self.flow_id.is_some() && matches!(self.phase, FlowPhase::Active(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_idle() {
        let state = FlowViewState::default();
        assert_eq!(state.phase.name(), "idle");
        assert!(!state.wants_heartbeat());
    }

    #[test]
    fn test_loading_and_error_do_not_heartbeat() {
        let mut state = FlowViewState::loading("g7");
        assert!(state.is_loading());
        assert!(!state.wants_heartbeat());

        state.phase = FlowPhase::Error {
            message: "flow definition not found for g7".into(),
            retryable: true,
        };
        assert_eq!(state.error_message(), Some("flow definition not found for g7"));
        assert!(!state.wants_heartbeat());

        state.phase = FlowPhase::Transition(TransitionPage::default());
        assert!(state.transition().is_some());
        assert!(!state.wants_heartbeat());
    }
}
