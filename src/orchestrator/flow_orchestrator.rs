//! The flow state machine: `Uninitialized -> Loaded -> Disposed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::error::FlowError;
use super::normalize::normalize_progress;
use super::resolve::{resolve_progress, ResolveResult};
use crate::api::{extract_payload, ApiClient, ApiError, FlowEndpoints};
use crate::store::{FlowCache, ProgressStore};
use crate::submodules::SubmoduleCatalog;
use crate::types::{normalize_page_num, FlowDefinition, FlowProgress};

/// Collaborators shared by every orchestrator a controller creates.
#[derive(Clone)]
pub struct FlowServices {
    pub api: Arc<dyn ApiClient>,
    pub endpoints: FlowEndpoints,
    pub catalog: Arc<dyn SubmoduleCatalog>,
    pub cache: Arc<dyn FlowCache>,
}

impl FlowServices {
    pub fn new(
        api: Arc<dyn ApiClient>,
        endpoints: FlowEndpoints,
        catalog: Arc<dyn SubmoduleCatalog>,
        cache: Arc<dyn FlowCache>,
    ) -> Self {
        Self {
            api,
            endpoints,
            catalog,
            cache,
        }
    }
}

/// What to do with the stored page number in [`FlowOrchestrator::update_progress`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageNumUpdate {
    Keep,
    Clear,
    /// A blank value clears
    Set(String),
}

impl PageNumUpdate {
    fn apply(self, current: Option<String>) -> Option<String> {
        match self {
            PageNumUpdate::Keep => current,
            PageNumUpdate::Clear => None,
            PageNumUpdate::Set(page) => normalize_page_num(Some(&page)),
        }
    }
}

impl From<Option<String>> for PageNumUpdate {
    fn from(page: Option<String>) -> Self {
        page.map_or(PageNumUpdate::Clear, PageNumUpdate::Set)
    }
}

/// Result of a successful [`FlowOrchestrator::load`]
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedFlow {
    pub definition: FlowDefinition,
    pub progress: FlowProgress,
}

struct DefinitionBundle {
    definition: FlowDefinition,
    progress: Option<FlowProgress>,
}

#[derive(Default)]
struct OrchestratorState {
    definition: Option<FlowDefinition>,
    progress: Option<FlowProgress>,
    has_loaded: bool,
    completed: bool,
}

/// Loads, resolves and advances one flow for one student.
///
/// All methods take `&self`; a controller keeps the instance in an `Arc` and
/// may dispose it while a `load()` is suspended elsewhere. Disposal is
/// terminal.
pub struct FlowOrchestrator {
    flow_id: String,
    services: FlowServices,
    store: ProgressStore,
    state: Mutex<OrchestratorState>,
    load_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl FlowOrchestrator {
    pub fn new(flow_id: impl Into<String>, services: FlowServices) -> Self {
        let flow_id = flow_id.into();
        let store = ProgressStore::new(flow_id.clone(), services.cache.clone());
        Self {
            flow_id,
            services,
            store,
            state: Mutex::new(OrchestratorState::default()),
            load_lock: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_active(&self) -> Result<(), FlowError> {
        if self.is_disposed() {
            return Err(FlowError::disposed(&self.flow_id));
        }
        Ok(())
    }

    /// Load definition and progress, network first with cache fallback.
    ///
    /// Repeated calls return the in-memory result without I/O; concurrent
    /// calls wait for the first one.
    #[instrument(skip(self), fields(flow_id = %self.flow_id))]
    pub async fn load(&self) -> Result<LoadedFlow, FlowError> {
        self.ensure_active()?;
        let _load = self.load_lock.lock().await;
        self.ensure_active()?;

        let (mut definition, mut progress) = {
            let state = self.state();
            if state.has_loaded {
                if let (Some(definition), Some(progress)) = (&state.definition, &state.progress) {
                    debug!("Reusing in-memory flow data");
                    return Ok(LoadedFlow {
                        definition: definition.clone(),
                        progress: progress.clone(),
                    });
                }
            }
            (state.definition.clone(), state.progress.clone())
        };
        if definition.is_none() {
            definition = self.store.load_definition();
        }
        if progress.is_none() {
            progress = self.store.load_progress();
        }

        let fetched = self.fetch_definition_bundle().await;
        self.ensure_active()?;
        match fetched {
            Ok(bundle) => {
                self.store.save_definition(&bundle.definition);
                definition = Some(bundle.definition);
                if bundle.progress.is_some() {
                    progress = bundle.progress;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to load definition from backend, falling back to cache");
            }
        }

        if progress.is_none() {
            let fetched = self.fetch_progress().await;
            self.ensure_active()?;
            match fetched {
                Ok(remote) => progress = remote,
                Err(e) => warn!(error = %e, "Failed to load progress from backend"),
            }
        }

        let Some(definition) = definition else {
            return Err(FlowError::DefinitionNotFound {
                flow_id: self.flow_id.clone(),
            });
        };
        if definition.is_empty() {
            return Err(FlowError::EmptyFlow {
                flow_id: self.flow_id.clone(),
            });
        }

        let progress = normalize_progress(progress, &definition);

        // Commit under the state lock so dispose() cannot interleave
        let mut state = self.state();
        self.ensure_active()?;
        state.definition = Some(definition.clone());
        state.progress = Some(progress.clone());
        state.has_loaded = true;
        self.store.persist_progress(&progress);
        drop(state);

        info!(
            step_index = progress.step_index,
            module_page_num = ?progress.module_page_num,
            steps = definition.step_count(),
            "Flow loaded"
        );

        Ok(LoadedFlow {
            definition,
            progress,
        })
    }

    /// Resolve a (definition, progress) pair to the step to display
    pub fn resolve(
        &self,
        definition: &FlowDefinition,
        progress: &FlowProgress,
    ) -> Result<ResolveResult, FlowError> {
        self.ensure_active()?;
        Ok(resolve_progress(
            definition,
            progress,
            self.services.catalog.as_ref(),
        ))
    }

    /// Resolve the in-memory state; `None` before the first load
    pub fn resolve_current(&self) -> Result<Option<ResolveResult>, FlowError> {
        self.ensure_active()?;
        let (definition, progress) = {
            let state = self.state();
            (state.definition.clone(), state.progress.clone())
        };
        match (definition, progress) {
            (Some(d), Some(p)) => self.resolve(&d, &p).map(Some),
            _ => Ok(None),
        }
    }

    /// Overwrite the step index and, depending on `page`, the page number.
    /// The index is clamped once a definition is loaded.
    pub fn update_progress(&self, step_index: usize, page: PageNumUpdate) -> Result<(), FlowError> {
        self.ensure_active()?;
        let mut state = self.state();
        self.write_progress(&mut state, step_index, page);
        Ok(())
    }

    fn write_progress(
        &self,
        state: &mut OrchestratorState,
        step_index: usize,
        page: PageNumUpdate,
    ) {
        let step_index = i64::try_from(step_index).unwrap_or(i64::MAX);
        let step_index = match &state.definition {
            Some(definition) => definition.clamp_step_index(step_index) as i64,
            None => step_index,
        };

        let previous = state.progress.take().unwrap_or_default();
        let progress = FlowProgress {
            step_index,
            module_page_num: page.apply(previous.module_page_num),
            last_updated: Some(Utc::now()),
            ..previous
        };

        self.store.persist_progress(&progress);
        debug!(
            flow_id = %self.flow_id,
            step_index,
            module_page_num = ?progress.module_page_num,
            "Progress updated"
        );
        state.progress = Some(progress);
    }

    /// Move to the next step with a cleared page number.
    ///
    /// Returns `false` and marks the flow completed when the current step is
    /// the last one.
    pub fn next_step(&self) -> Result<bool, FlowError> {
        self.ensure_active()?;
        let mut state = self.state();

        let Some(definition) = &state.definition else {
            warn!(flow_id = %self.flow_id, "next_step called before the flow was loaded");
            return Ok(false);
        };

        let current = state.progress.as_ref().map_or(0, |p| p.step_index);
        let current = definition.clamp_step_index(current);
        let next = current + 1;

        if next >= definition.step_count() {
            info!(flow_id = %self.flow_id, "Flow completed");
            self.complete(&mut state);
            return Ok(false);
        }

        self.write_progress(&mut state, next, PageNumUpdate::Clear);
        Ok(true)
    }

    /// Set the completion flag, independent of `next_step`
    pub fn mark_completed(&self) -> Result<(), FlowError> {
        self.ensure_active()?;
        let mut state = self.state();
        self.complete(&mut state);
        Ok(())
    }

    fn complete(&self, state: &mut OrchestratorState) {
        self.store.mark_completed();
        state.completed = true;
        if let Some(progress) = state.progress.as_mut() {
            progress.completed = Some(true);
            self.store.persist_progress(progress);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state().completed || self.store.is_completed()
    }

    /// Remove everything cached for this flow
    pub fn clear_cache(&self) -> Result<(), FlowError> {
        self.ensure_active()?;
        self.store.clear();
        info!(flow_id = %self.flow_id, "Flow cache cleared");
        Ok(())
    }

    /// Tear down; a second call does nothing
    pub fn dispose(&self) {
        let mut state = self.state();
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        *state = OrchestratorState::default();
        debug!(flow_id = %self.flow_id, "Disposed orchestrator");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn has_loaded(&self) -> bool {
        self.state().has_loaded
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn definition(&self) -> Option<FlowDefinition> {
        self.state().definition.clone()
    }

    pub fn progress(&self) -> Option<FlowProgress> {
        self.state().progress.clone()
    }

    pub fn step_count(&self) -> Option<usize> {
        self.state().definition.as_ref().map(FlowDefinition::step_count)
    }

    pub(crate) fn services(&self) -> &FlowServices {
        &self.services
    }

    async fn fetch_definition_bundle(&self) -> Result<DefinitionBundle, ApiError> {
        let path = self.services.endpoints.definition(&self.flow_id);
        let response = self.services.api.get(&path).await?;
        let payload = extract_payload(response, false)?
            .ok_or_else(|| ApiError::invalid_response("missing definition payload"))?;

        let (definition, progress) = match payload {
            Value::Object(mut map) if map.contains_key("definition") => {
                let definition = match map.remove("definition") {
                    Some(Value::Null) | None => {
                        return Err(ApiError::invalid_response("definition is null"));
                    }
                    Some(definition) => definition,
                };
                let progress = match map.remove("progress") {
                    Some(Value::Null) | None => None,
                    Some(progress) => Some(serde_json::from_value(progress)?),
                };
                (definition, progress)
            }
            other => (other, None),
        };

        let mut definition: FlowDefinition = serde_json::from_value(definition)?;
        if definition.flow_id.is_empty() {
            definition.flow_id.clone_from(&self.flow_id);
        }
        Ok(DefinitionBundle {
            definition,
            progress,
        })
    }

    async fn fetch_progress(&self) -> Result<Option<FlowProgress>, ApiError> {
        let path = self.services.endpoints.progress(&self.flow_id);
        let response = self.services.api.get(&path).await?;
        if matches!(&response, Value::String(s) if s.is_empty()) {
            return Ok(None);
        }

        let payload = match extract_payload(response, true)? {
            Some(Value::Object(mut map)) if map.contains_key("progress") => {
                match map.remove("progress") {
                    Some(Value::Null) | None => return Ok(None),
                    Some(progress) => progress,
                }
            }
            Some(payload) => payload,
            None => return Ok(None),
        };
        Ok(Some(serde_json::from_value(payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFlowCache;
    use crate::submodules::{PagedSubmodule, SubmoduleRegistry};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct ScriptedApi {
        routes: HashMap<String, Result<Value, ApiError>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        fn with(mut self, path: &str, response: Result<Value, ApiError>) -> Self {
            self.routes.insert(path.to_string(), response);
            self
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ApiClient for ScriptedApi {
        async fn get(&self, path: &str) -> Result<Value, ApiError> {
            self.calls.lock().unwrap().push(path.to_string());
            self.routes
                .get(path)
                .cloned()
                .unwrap_or_else(|| Err(ApiError::network("connection refused")))
        }

        async fn post(&self, path: &str, _body: &Value) -> Result<Value, ApiError> {
            self.calls.lock().unwrap().push(path.to_string());
            Ok(Value::Null)
        }
    }

    const DEF_PATH: &str = "/stu/api/flows/g7";
    const PROGRESS_PATH: &str = "/stu/api/flows/g7/progress";

    fn definition_json(steps: &[&str]) -> Value {
        let steps: Vec<Value> = steps.iter().map(|s| json!({ "submoduleId": s })).collect();
        json!({ "flowId": "g7", "steps": steps })
    }

    fn build(api: ScriptedApi) -> (FlowOrchestrator, Arc<ScriptedApi>, Arc<MemoryFlowCache>) {
        let api = Arc::new(api);
        let cache = Arc::new(MemoryFlowCache::new());
        let registry = SubmoduleRegistry::new();
        for id in ["a", "b", "c", "d", "e"] {
            registry
                .register(Arc::new(PagedSubmodule::new(id, id.to_uppercase())))
                .unwrap();
        }
        let services = FlowServices::new(
            api.clone(),
            FlowEndpoints::default(),
            Arc::new(registry),
            cache.clone(),
        );
        (FlowOrchestrator::new("g7", services), api, cache)
    }

    #[tokio::test]
    async fn test_load_is_idempotent_without_extra_calls() {
        let api = ScriptedApi::default()
            .with(DEF_PATH, Ok(json!({ "code": 200, "obj": definition_json(&["a", "b"]) })))
            .with(PROGRESS_PATH, Ok(json!({ "code": 200, "obj": { "stepIndex": 1 } })));
        let (orch, api, _) = build(api);

        let first = orch.load().await.unwrap();
        let calls = api.calls();
        let second = orch.load().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.calls(), calls);
        assert_eq!(first.progress.step_index, 1);
    }

    #[tokio::test]
    async fn test_embedded_progress_skips_progress_fetch() {
        let bundle = json!({
            "obj": {
                "definition": definition_json(&["a", "b", "c"]),
                "progress": { "stepIndex": 2, "modulePageNum": "4" }
            }
        });
        let (orch, api, _) = build(ScriptedApi::default().with(DEF_PATH, Ok(bundle)));

        let loaded = orch.load().await.unwrap();
        assert_eq!(loaded.progress.step_index, 2);
        assert_eq!(loaded.progress.module_page_num.as_deref(), Some("4"));
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_null_definition_in_bundle_falls_back() {
        let bundle = json!({ "obj": { "definition": null } });
        let (orch, _, _) = build(ScriptedApi::default().with(DEF_PATH, Ok(bundle)));

        let err = orch.load().await.unwrap_err();
        assert!(matches!(err, FlowError::DefinitionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_empty_flow() {
        let (orch, _, _) =
            build(ScriptedApi::default().with(DEF_PATH, Ok(json!({ "obj": definition_json(&[]) }))));
        assert!(matches!(
            orch.load().await.unwrap_err(),
            FlowError::EmptyFlow { .. }
        ));
    }

    #[tokio::test]
    async fn test_cache_fallback_clamps_progress() {
        let (orch, _, cache) = build(ScriptedApi::default());
        let def = FlowDefinition::from_submodules("g7", ["a", "b", "c"]);
        cache
            .set("flow.g7.definition", &serde_json::to_string(&def).unwrap())
            .unwrap();
        cache.set("flow.g7.stepIndex", "5").unwrap();

        let loaded = orch.load().await.unwrap();
        let resolved = orch.resolve(&loaded.definition, &loaded.progress).unwrap();
        assert_eq!(resolved.step_index, 2);
        assert_eq!(cache.get("flow.g7.stepIndex").unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_remote_definition_is_cached() {
        let (orch, _, cache) = build(
            ScriptedApi::default().with(DEF_PATH, Ok(json!({ "obj": definition_json(&["a"]) }))),
        );
        orch.load().await.unwrap();
        assert!(cache.get("flow.g7.definition").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_definition_without_flow_id_takes_requested_id() {
        let (orch, _, _) = build(
            ScriptedApi::default().with(DEF_PATH, Ok(json!({ "steps": [{ "submoduleId": "a" }] }))),
        );
        assert_eq!(orch.load().await.unwrap().definition.flow_id, "g7");
    }

    #[tokio::test]
    async fn test_progress_error_envelope_is_ignored() {
        let api = ScriptedApi::default()
            .with(DEF_PATH, Ok(json!({ "obj": definition_json(&["a", "b"]) })))
            .with(PROGRESS_PATH, Ok(json!({ "code": 500, "msg": "db down" })));
        let (orch, _, _) = build(api);
        assert_eq!(orch.load().await.unwrap().progress.step_index, 0);
    }

    #[tokio::test]
    async fn test_completion_boundary() {
        let (orch, _, _) = build(ScriptedApi::default().with(
            DEF_PATH,
            Ok(json!({ "obj": definition_json(&["a", "b", "c", "d"]) })),
        ));
        orch.load().await.unwrap();

        for expected in 1..4 {
            assert!(orch.next_step().unwrap());
            assert_eq!(orch.progress().unwrap().step_index, expected);
        }
        assert!(!orch.is_completed());
        assert!(!orch.next_step().unwrap());
        assert!(orch.is_completed());
        assert_eq!(orch.progress().unwrap().step_index, 3);
    }

    #[tokio::test]
    async fn test_next_step_clears_page() {
        let (orch, _, _) = build(ScriptedApi::default().with(
            DEF_PATH,
            Ok(json!({ "obj": definition_json(&["a", "b"]) })),
        ));
        orch.load().await.unwrap();
        orch.update_progress(0, PageNumUpdate::Set("3".into())).unwrap();
        assert!(orch.next_step().unwrap());
        assert_eq!(orch.progress().unwrap().module_page_num, None);
    }

    #[test]
    fn test_next_step_before_load() {
        let (orch, _, _) = build(ScriptedApi::default());
        assert!(!orch.next_step().unwrap());
        assert!(!orch.is_completed());
    }

    #[tokio::test]
    async fn test_update_progress_page_semantics() {
        let (orch, _, cache) = build(ScriptedApi::default().with(
            DEF_PATH,
            Ok(json!({ "obj": definition_json(&["a", "b", "c"]) })),
        ));
        orch.load().await.unwrap();

        orch.update_progress(1, PageNumUpdate::Set("5".into())).unwrap();
        orch.update_progress(2, PageNumUpdate::Keep).unwrap();
        let progress = orch.progress().unwrap();
        assert_eq!(progress.step_index, 2);
        assert_eq!(progress.module_page_num.as_deref(), Some("5"));
        assert!(progress.last_updated.is_some());

        orch.update_progress(9, PageNumUpdate::Clear).unwrap();
        let progress = orch.progress().unwrap();
        assert_eq!(progress.step_index, 2);
        assert_eq!(progress.module_page_num, None);
        assert!(cache.get("flow.g7.modulePageNum").unwrap().is_none());

        orch.update_progress(0, PageNumUpdate::Set("  ".into())).unwrap();
        assert_eq!(orch.progress().unwrap().module_page_num, None);
    }

    #[tokio::test]
    async fn test_dispose_is_terminal() {
        let (orch, _, _) = build(ScriptedApi::default().with(
            DEF_PATH,
            Ok(json!({ "obj": definition_json(&["a", "b"]) })),
        ));
        let loaded = orch.load().await.unwrap();

        orch.dispose();
        orch.dispose();

        assert!(orch.is_disposed());
        assert!(orch.load().await.unwrap_err().is_disposed());
        assert!(orch
            .resolve(&loaded.definition, &loaded.progress)
            .unwrap_err()
            .is_disposed());
        assert!(orch.resolve_current().unwrap_err().is_disposed());
        assert!(orch
            .update_progress(1, PageNumUpdate::Keep)
            .unwrap_err()
            .is_disposed());
        assert!(orch.next_step().unwrap_err().is_disposed());
        assert!(orch.mark_completed().unwrap_err().is_disposed());
        assert!(orch.clear_cache().unwrap_err().is_disposed());

        assert_eq!(orch.flow_id(), "g7");
        assert!(orch.definition().is_none());
        assert!(orch.progress().is_none());
        assert!(!orch.has_loaded());
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let (orch, _, cache) = build(ScriptedApi::default().with(
            DEF_PATH,
            Ok(json!({ "obj": definition_json(&["a"]) })),
        ));
        orch.load().await.unwrap();
        orch.mark_completed().unwrap();
        assert!(!cache.is_empty());

        orch.clear_cache().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_page_num_update_from_option() {
        assert_eq!(PageNumUpdate::from(None), PageNumUpdate::Clear);
        assert_eq!(
            PageNumUpdate::from(Some("2".to_string())),
            PageNumUpdate::Set("2".into())
        );
    }
}
