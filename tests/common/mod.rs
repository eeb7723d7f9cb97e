//! Shared fixtures for integration tests: a scripted backend, a recording
//! host and counting submodules. No network is touched.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assessment_flow::api::{ApiClient, ApiError, FlowEndpoints};
use assessment_flow::controller::{ControllerSettings, FlowController, FlowHost};
use assessment_flow::orchestrator::FlowServices;
use assessment_flow::store::{FlowCache, MemoryFlowCache};
use assessment_flow::submodules::{PagedSubmodule, SubmoduleDefinition, SubmoduleRegistry};
use assessment_flow::types::FlowContextOperation;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

// ─── Paths ───────────────────────────────────────────────────────────────────

pub fn definition_path(flow_id: &str) -> String {
    FlowEndpoints::default().definition(flow_id)
}

pub fn progress_path(flow_id: &str) -> String {
    FlowEndpoints::default().progress(flow_id)
}

/// Backend definition payload with one step per submodule id
pub fn definition_json(flow_id: &str, submodule_ids: &[&str]) -> Value {
    let steps: Vec<Value> = submodule_ids
        .iter()
        .map(|id| json!({ "submoduleId": id }))
        .collect();
    json!({ "code": 200, "msg": "ok", "obj": { "flowId": flow_id, "steps": steps } })
}

// ─── Scripted Backend ────────────────────────────────────────────────────────

/// Canned responses per path. Unknown paths fail like an unreachable server.
/// A gated path waits until the test releases it.
#[derive(Default)]
pub struct ScriptedApi {
    routes: Mutex<HashMap<String, Result<Value, ApiError>>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    gets: Mutex<Vec<String>>,
    posts: Mutex<Vec<(String, Value)>>,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, path: &str, response: Value) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Ok(response));
    }

    pub fn fail(&self, path: &str, error: ApiError) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Err(error));
    }

    /// Hold GETs of `path` until `release` is called
    pub fn gate(&self, path: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates
            .lock()
            .unwrap()
            .insert(path.to_string(), gate.clone());
        gate
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    pub fn get_count(&self, path: &str) -> usize {
        self.gets.lock().unwrap().iter().filter(|p| *p == path).count()
    }

    pub fn posts(&self) -> Vec<(String, Value)> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApiClient for ScriptedApi {
    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.gets.lock().unwrap().push(path.to_string());

        let gate = self.gates.lock().unwrap().get(path).cloned();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| ApiError::network("gate closed"))?;
            permit.forget();
        }

        self.routes
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_else(|| Err(ApiError::network("connection refused")))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.posts
            .lock()
            .unwrap()
            .push((path.to_string(), body.clone()));
        Ok(json!({ "code": 200, "obj": null }))
    }
}

// ─── Submodules ──────────────────────────────────────────────────────────────

/// Paged submodule that counts lifecycle callbacks
pub struct CountingSubmodule {
    inner: PagedSubmodule,
    pub initialized: AtomicUsize,
    pub destroyed: AtomicUsize,
}

impl CountingSubmodule {
    pub fn new(id: &str, total_pages: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: PagedSubmodule::new(id, format!("{id} module")).with_total_pages(total_pages),
            initialized: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        })
    }

    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl SubmoduleDefinition for CountingSubmodule {
    fn submodule_id(&self) -> &str {
        self.inner.submodule_id()
    }

    fn display_name(&self) -> &str {
        self.inner.display_name()
    }

    fn initial_page(&self, page_num: &str) -> String {
        self.inner.initial_page(page_num)
    }

    fn resolve_page_num(&self, page_id: &str) -> Option<String> {
        self.inner.resolve_page_num(page_id)
    }

    fn total_steps(&self) -> Option<u32> {
        self.inner.total_steps()
    }

    fn on_initialize(&self) {
        self.initialized.fetch_add(1, Ordering::SeqCst);
    }

    fn on_destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn registry_with(submodules: &[Arc<CountingSubmodule>]) -> Arc<SubmoduleRegistry> {
    let registry = Arc::new(SubmoduleRegistry::new());
    for submodule in submodules {
        registry.register(submodule.clone()).unwrap();
    }
    registry
}

// ─── Host ────────────────────────────────────────────────────────────────────

/// Host that records everything the controller asks of it
pub struct RecordingHost {
    pub operations: Mutex<Vec<FlowContextOperation>>,
    pub redirects: Mutex<Vec<String>>,
    pub completions: AtomicUsize,
    pub accept_operations: AtomicBool,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            operations: Mutex::new(Vec::new()),
            redirects: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            accept_operations: AtomicBool::new(true),
        })
    }

    pub fn operations(&self) -> Vec<FlowContextOperation> {
        self.operations.lock().unwrap().clone()
    }

    pub fn redirects(&self) -> Vec<String> {
        self.redirects.lock().unwrap().clone()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlowHost for RecordingHost {
    fn log_operation(&self, operation: FlowContextOperation) -> bool {
        if !self.accept_operations.load(Ordering::SeqCst) {
            return false;
        }
        self.operations.lock().unwrap().push(operation);
        true
    }

    async fn on_flow_completed(&self) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }

    async fn redirect(&self, route: &str) {
        self.redirects.lock().unwrap().push(route.to_string());
    }
}

// ─── Wiring ──────────────────────────────────────────────────────────────────

pub fn services(
    api: Arc<ScriptedApi>,
    registry: Arc<SubmoduleRegistry>,
    cache: Arc<dyn FlowCache>,
) -> FlowServices {
    FlowServices::new(api, FlowEndpoints::default(), registry, cache)
}

pub fn memory_cache() -> Arc<dyn FlowCache> {
    Arc::new(MemoryFlowCache::new())
}

/// Controller settings with heartbeats off unless a test opts in
pub fn quiet_settings() -> ControllerSettings {
    ControllerSettings {
        heartbeat_enabled: false,
        ..ControllerSettings::default()
    }
}

pub struct Harness {
    pub api: Arc<ScriptedApi>,
    pub host: Arc<RecordingHost>,
    pub cache: Arc<dyn FlowCache>,
    pub controller: FlowController,
}

pub fn harness(
    api: Arc<ScriptedApi>,
    registry: Arc<SubmoduleRegistry>,
    settings: ControllerSettings,
) -> Harness {
    let host = RecordingHost::new();
    let cache = memory_cache();
    let controller = FlowController::new(
        services(api.clone(), registry, cache.clone()),
        host.clone(),
        settings,
    );
    Harness {
        api,
        host,
        cache,
        controller,
    }
}

/// Let spawned tasks run until nothing is ready
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}
