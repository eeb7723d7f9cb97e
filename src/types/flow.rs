//! Flow definition and progress records.
//!
//! These mirror the JSON shapes served by the assessment backend and kept in
//! the durable cache, so every struct uses camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A flow: an ordered, linear list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Filled from the requested id when the backend leaves it out
    #[serde(default)]
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Route of the flow, `/flow/<flowId>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// draft/published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub steps: Vec<FlowStep>,
}

impl FlowDefinition {
    /// Build a definition from submodule ids, one step each
    pub fn from_submodules<I, S>(flow_id: impl Into<String>, submodule_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            flow_id: flow_id.into(),
            name: None,
            url: None,
            description: None,
            status: None,
            version: None,
            steps: submodule_ids.into_iter().map(FlowStep::new).collect(),
        }
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Highest addressable step index (0 for an empty flow)
    pub fn max_step_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    /// Clamp an arbitrary (possibly negative) index into the step range
    pub fn clamp_step_index(&self, step_index: i64) -> usize {
        if step_index <= 0 {
            return 0;
        }
        usize::try_from(step_index)
            .unwrap_or(usize::MAX)
            .min(self.max_step_index())
    }
}

/// One position in a flow, referencing exactly one submodule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStep {
    /// Submodule id (kebab-case, e.g. `g7-experiment`)
    pub submodule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Page shown between this step and the next
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_page: Option<TransitionPage>,
    /// Opaque configuration handed to the submodule as its options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<serde_json::Value>,
}

impl FlowStep {
    pub fn new(submodule_id: impl Into<String>) -> Self {
        Self {
            submodule_id: submodule_id.into(),
            display_name: None,
            transition_page: None,
            overrides: None,
        }
    }

    pub fn with_transition_page(mut self, page: TransitionPage) -> Self {
        self.transition_page = Some(page);
        self
    }

    pub fn with_overrides(mut self, overrides: serde_json::Value) -> Self {
        self.overrides = Some(overrides);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionPage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Seconds before moving on by itself; 0 waits for the student
    #[serde(default)]
    pub auto_next_seconds: u32,
}

/// How far a student has advanced within a flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowProgress {
    /// Signed on the wire: cached or remote values may be out of range
    #[serde(default)]
    pub step_index: i64,
    #[serde(default)]
    pub module_page_num: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_completed: Option<BTreeMap<String, bool>>,
}

impl FlowProgress {
    pub fn at(step_index: i64, module_page_num: Option<&str>) -> Self {
        Self {
            step_index,
            module_page_num: module_page_num.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.unwrap_or(false)
    }
}

/// Trim a page number and drop it when nothing is left.
pub fn normalize_page_num(page_num: Option<&str>) -> Option<String> {
    page_num
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

/// Operation reported to the host when a step is first shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowContextOperation {
    pub target_element: String,
    pub event_type: String,
    pub value: FlowContextValue,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowContextValue {
    pub flow_id: String,
    pub step_index: usize,
    pub submodule_id: String,
    pub module_name: String,
}

impl FlowContextOperation {
    pub const EVENT_TYPE: &'static str = "flow_context";
    pub const TARGET_ELEMENT: &'static str = "页面";

    pub fn new(
        flow_id: impl Into<String>,
        step_index: usize,
        submodule_id: impl Into<String>,
        module_name: impl Into<String>,
    ) -> Self {
        Self {
            target_element: Self::TARGET_ELEMENT.to_string(),
            event_type: Self::EVENT_TYPE.to_string(),
            value: FlowContextValue {
                flow_id: flow_id.into(),
                step_index,
                submodule_id: submodule_id.into(),
                module_name: module_name.into(),
            },
            time: Utc::now(),
        }
    }
}
