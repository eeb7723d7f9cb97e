//! Flow controller: one live orchestrator per flow id.
//!
//! Every load sequence captures the generation and cancellation token current
//! when it started. Before committing anything it checks both, so a slow load
//! for a flow id that has since been replaced never overwrites newer state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::host::{FlowContextHandle, FlowHost, SubmoduleMount};
use super::state::{FlowPhase, FlowViewState};
use crate::config::Config;
use crate::navigation::{
    after_navigate, before_navigate, FlowContextBinding, HostContext, NavigationBridge,
    DEFAULT_ALIASES,
};
use crate::orchestrator::{
    FlowError, FlowOrchestrator, FlowServices, PageNumUpdate, ResolveResult,
};
use crate::services::{HeartbeatHandle, HeartbeatIdentity, ProgressHeartbeat};
use crate::submodules::SubmoduleCatalog;
use crate::types::FlowContextOperation;

/// Route students are sent to once a flow is complete
pub const DEFAULT_COMPLETION_ROUTE: &str = "/login";

/// Controller behaviour switches, usually taken from [`Config`]
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub completion_route: String,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval: Duration,
    pub navigation_aliases: Vec<String>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            completion_route: DEFAULT_COMPLETION_ROUTE.to_string(),
            heartbeat_enabled: true,
            heartbeat_interval: crate::services::DEFAULT_HEARTBEAT_INTERVAL,
            navigation_aliases: DEFAULT_ALIASES.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            completion_route: config.flow.completion_route.clone(),
            heartbeat_enabled: config.heartbeat.enabled,
            heartbeat_interval: config.heartbeat.effective_interval(),
            navigation_aliases: config.flow.navigation_aliases.clone(),
        }
    }
}

static FLOW_PATH: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)/flow/([^/?#]+)").ok());

/// Flow id from a `/flow/<flowId>` route, absolute URL or bare path.
/// The segment is returned as written, without percent-decoding.
pub fn flow_id_from_url(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let path = if url.contains("://") {
        reqwest::Url::parse(url)
            .map(|parsed| parsed.path().to_string())
            .unwrap_or_else(|_| url.to_string())
    } else {
        url.to_string()
    };

    let pattern = FLOW_PATH.as_ref()?;
    pattern
        .captures(&path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

type PendingLoad = Shared<BoxFuture<'static, ()>>;

/// Identifies one run of the load sequence
#[derive(Clone)]
struct LoadTicket {
    id: u64,
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    flow_id: Option<String>,
    generation: u64,
    orchestrator: Option<Arc<FlowOrchestrator>>,
    cancel: CancellationToken,
    load_seq: u64,
    pending_load: Option<(u64, PendingLoad)>,
    heartbeat: Option<HeartbeatHandle>,
    completion_signaled: bool,
    /// Step whose completion waits for the host navigation to finish
    deferred_completion: Option<usize>,
    logged_steps: HashSet<(String, usize)>,
    identity: HeartbeatIdentity,
}

impl Slot {
    fn is_current(&self, generation: u64, cancel: &CancellationToken) -> bool {
        self.generation == generation && !cancel.is_cancelled()
    }

    fn next_load(&mut self) -> LoadTicket {
        self.load_seq += 1;
        LoadTicket {
            id: self.load_seq,
            generation: self.generation,
            cancel: self.cancel.clone(),
        }
    }

    /// A load still running; one that already finished is never joined
    fn joinable_load(&self) -> Option<(u64, PendingLoad)> {
        self.pending_load
            .as_ref()
            .filter(|(_, load)| load.peek().is_none())
            .cloned()
    }

    fn release_load(&mut self, load_id: u64) {
        if self.pending_load.as_ref().is_some_and(|(id, _)| *id == load_id) {
            self.pending_load = None;
        }
    }

    /// Drop everything scoped to the current flow id
    fn teardown(&mut self) {
        self.cancel.cancel();
        self.generation += 1;
        if let Some(orchestrator) = self.orchestrator.take() {
            orchestrator.dispose();
        }
        self.heartbeat = None;
        self.pending_load = None;
        self.completion_signaled = false;
        self.deferred_completion = None;
        self.logged_steps.clear();
    }
}

struct Inner {
    services: FlowServices,
    host: Arc<dyn FlowHost>,
    settings: ControllerSettings,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<FlowViewState>,
    bridge: NavigationBridge,
}

/// Drives one flow at a time for a host application.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FlowController {
    inner: Arc<Inner>,
}

impl FlowController {
    pub fn new(services: FlowServices, host: Arc<dyn FlowHost>, settings: ControllerSettings) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let before = weak.clone();
            let after = weak.clone();
            let bridge = NavigationBridge::new()
                .with_aliases(settings.navigation_aliases.clone())
                .with_before(before_navigate(move |page_id, _options| {
                    let weak = before.clone();
                    async move {
                        match weak.upgrade() {
                            Some(inner) => FlowController { inner }.before_navigate(page_id).await,
                            None => true,
                        }
                    }
                }))
                .with_after(after_navigate(move |_page_id, _options| {
                    let weak = after.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            FlowController { inner }.after_navigate().await;
                        }
                    }
                }));

            Inner {
                services,
                host,
                settings,
                slot: Mutex::new(Slot::default()),
                state_tx: watch::channel(FlowViewState::idle()).0,
                bridge,
            }
        });
        Self { inner }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowViewState> {
        self.inner.state_tx.subscribe()
    }

    pub fn state(&self) -> FlowViewState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn flow_id(&self) -> Option<String> {
        self.slot().flow_id.clone()
    }

    pub fn orchestrator(&self) -> Option<Arc<FlowOrchestrator>> {
        self.slot().orchestrator.clone()
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.slot()
            .heartbeat
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Student identifiers for heartbeats started from now on
    pub fn set_user_context(&self, user_context: &Value) {
        self.slot().identity = HeartbeatIdentity::from_user_context(user_context);
    }

    /// Switch to another flow. The previous orchestrator is disposed and
    /// any in-flight load for it is abandoned. Returns the new load task.
    #[instrument(skip(self))]
    pub fn set_flow_id(&self, flow_id: Option<String>) -> Option<JoinHandle<()>> {
        let flow_id = flow_id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty());

        {
            let mut slot = self.slot();
            if slot.flow_id == flow_id {
                return None;
            }
            slot.teardown();
            slot.flow_id.clone_from(&flow_id);

            let Some(flow_id) = flow_id else {
                self.inner.state_tx.send_replace(FlowViewState::idle());
                info!("Flow cleared");
                return None;
            };

            info!(flow_id = %flow_id, "Starting flow");
            slot.orchestrator = Some(Arc::new(FlowOrchestrator::new(
                flow_id.clone(),
                self.inner.services.clone(),
            )));
            slot.cancel = CancellationToken::new();
            self.inner
                .state_tx
                .send_replace(FlowViewState::loading(&flow_id));
        }

        self.start_load()
    }

    /// Retry action: re-run the load sequence for the current flow id,
    /// joining one that is already in flight
    pub fn reload(&self) -> Option<JoinHandle<()>> {
        self.start_load()
    }

    fn start_load(&self) -> Option<JoinHandle<()>> {
        self.spawn_load().map(|(_, task)| task)
    }

    fn spawn_load(&self) -> Option<(u64, JoinHandle<()>)> {
        let mut slot = self.slot();
        if let Some((load_id, pending)) = slot.joinable_load() {
            debug!(load_id, "Joining in-flight load");
            return Some((load_id, tokio::spawn(pending)));
        }

        let flow_id = slot.flow_id.clone()?;
        let orchestrator = slot.orchestrator.clone()?;
        let ticket = slot.next_load();

        let load = self
            .clone()
            .run_load(flow_id, orchestrator, ticket.clone())
            .boxed()
            .shared();
        slot.pending_load = Some((ticket.id, load.clone()));
        Some((ticket.id, tokio::spawn(load)))
    }

    fn is_stale(&self, generation: u64, cancel: &CancellationToken) -> bool {
        !self.slot().is_current(generation, cancel)
    }

    /// Publish `state` only if the sequence that produced it is still current
    fn commit(&self, generation: u64, cancel: &CancellationToken, state: FlowViewState) -> bool {
        self.publish(generation, cancel, None, state)
    }

    /// Publish the state that ends a load. The load stops being joinable in
    /// the same critical section.
    fn commit_load(&self, ticket: &LoadTicket, state: FlowViewState) -> bool {
        self.publish(ticket.generation, &ticket.cancel, Some(ticket.id), state)
    }

    fn publish(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        finished_load: Option<u64>,
        state: FlowViewState,
    ) -> bool {
        let mut slot = self.slot();
        if !slot.is_current(generation, cancel) {
            return false;
        }
        if let Some(load_id) = finished_load {
            slot.release_load(load_id);
        }

        let heartbeat = if state.wants_heartbeat() {
            self.spawn_heartbeat(&slot)
        } else {
            None
        };
        slot.heartbeat = heartbeat;
        self.inner.state_tx.send_replace(state);
        true
    }

    fn spawn_heartbeat(&self, slot: &Slot) -> Option<HeartbeatHandle> {
        if !self.inner.settings.heartbeat_enabled {
            return None;
        }
        let orchestrator = slot.orchestrator.clone()?;
        Some(
            ProgressHeartbeat::new(orchestrator)
                .with_interval(self.inner.settings.heartbeat_interval)
                .with_identity(slot.identity.clone())
                .spawn(),
        )
    }

    fn fail(&self, ticket: &LoadTicket, flow_id: &str, err: &FlowError) {
        error!(flow_id, error = %err, "Flow load failed");
        let previous = self.state();
        self.commit_load(
            ticket,
            FlowViewState {
                flow_id: Some(flow_id.to_string()),
                phase: FlowPhase::Error {
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                },
                ..previous
            },
        );
    }

    #[instrument(skip(self, orchestrator, ticket), fields(load_id = ticket.id))]
    async fn run_load(self, flow_id: String, orchestrator: Arc<FlowOrchestrator>, ticket: LoadTicket) {
        self.load_sequence(&flow_id, &orchestrator, &ticket).await;
        self.slot().release_load(ticket.id);
    }

    async fn load_sequence(&self, flow_id: &str, orchestrator: &FlowOrchestrator, ticket: &LoadTicket) {
        let (generation, cancel) = (ticket.generation, &ticket.cancel);
        if self.is_stale(generation, cancel) {
            return;
        }
        {
            let previous = self.state();
            self.commit(
                generation,
                cancel,
                FlowViewState {
                    flow_id: Some(flow_id.to_string()),
                    phase: FlowPhase::Loading,
                    ..previous
                },
            );
        }

        let initialized = tokio::select! {
            () = cancel.cancelled() => return,
            result = self.inner.services.catalog.initialize() => result,
        };
        if self.is_stale(generation, cancel) {
            return;
        }
        if let Err(e) = initialized {
            self.fail(ticket, flow_id, &FlowError::from(e));
            return;
        }

        let loaded = tokio::select! {
            () = cancel.cancelled() => return,
            result = orchestrator.load() => result,
        };
        if self.is_stale(generation, cancel) {
            return;
        }
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) if e.is_disposed() => {
                debug!(flow_id, "Orchestrator disposed during load, aborting");
                return;
            }
            Err(e) => {
                self.fail(ticket, flow_id, &e);
                return;
            }
        };

        let resolved = match orchestrator.resolve(&loaded.definition, &loaded.progress) {
            Ok(resolved) => resolved,
            Err(e) if e.is_disposed() => return,
            Err(e) => {
                self.fail(ticket, flow_id, &e);
                return;
            }
        };

        let Some(submodule) = resolved.submodule.clone() else {
            let err = FlowError::SubmoduleNotFound {
                submodule_id: resolved.submodule_id.clone().unwrap_or_default(),
            };
            self.fail(ticket, flow_id, &err);
            return;
        };

        if self.is_stale(generation, cancel) {
            return;
        }
        self.log_flow_context_once(flow_id, &resolved);
        submodule.on_initialize();

        let committed = self.commit_load(
            ticket,
            FlowViewState {
                flow_id: Some(flow_id.to_string()),
                phase: FlowPhase::Active(resolved.clone()),
                definition: Some(loaded.definition),
                progress: Some(loaded.progress),
            },
        );
        if committed {
            info!(
                flow_id,
                step_index = resolved.step_index,
                submodule_id = ?resolved.submodule_id,
                "Step ready"
            );
        }
    }

    /// Report a `flow_context` operation to the host once per step
    fn log_flow_context_once(&self, flow_id: &str, resolved: &ResolveResult) {
        let key = (flow_id.to_string(), resolved.step_index);
        if self.slot().logged_steps.contains(&key) {
            debug!(flow_id, step_index = resolved.step_index, "flow_context already logged");
            return;
        }

        let submodule_id = resolved.submodule_id.clone().unwrap_or_default();
        let module_name = resolved
            .display_name()
            .map_or_else(|| submodule_id.clone(), str::to_string);
        let operation =
            FlowContextOperation::new(flow_id, resolved.step_index, submodule_id, module_name);

        if !self.inner.host.log_operation(operation) {
            warn!(flow_id, step_index = resolved.step_index, "flow_context operation was not recorded");
            return;
        }
        self.slot().logged_steps.insert(key);
    }

    /// The active submodule reported completion
    pub async fn handle_submodule_complete(&self) {
        self.complete_step(None).await;
    }

    /// Completion for `expected_step`; ignored when another step is showing
    /// or the step already completed
    pub(crate) async fn complete_step(&self, expected_step: Option<usize>) {
        let state = self.state();
        let Some(resolved) = state.active().cloned() else {
            debug!(phase = state.phase.name(), "Completion outside an active step ignored");
            return;
        };
        if expected_step.is_some_and(|step| step != resolved.step_index) {
            debug!(
                expected = ?expected_step,
                active = resolved.step_index,
                "Completion for a step no longer shown ignored"
            );
            return;
        }

        let already_signaled = std::mem::replace(&mut self.slot().completion_signaled, true);
        if already_signaled {
            debug!(step_index = resolved.step_index, "Step already completing");
            return;
        }
        self.finish_step(state, resolved).await;
    }

    async fn finish_step(&self, state: FlowViewState, resolved: ResolveResult) {
        let (generation, cancel, orchestrator) = {
            let slot = self.slot();
            let Some(orchestrator) = slot.orchestrator.clone() else {
                return;
            };
            (slot.generation, slot.cancel.clone(), orchestrator)
        };

        info!(
            flow_id = ?state.flow_id,
            step_index = resolved.step_index,
            "Submodule completed"
        );
        if let Some(submodule) = &resolved.submodule {
            submodule.on_destroy();
        }

        if let Some(page) = resolved.step.and_then(|step| step.transition_page) {
            self.commit(
                generation,
                &cancel,
                FlowViewState {
                    phase: FlowPhase::Transition(page),
                    ..state
                },
            );
            return;
        }

        self.advance(generation, cancel, orchestrator).await;
    }

    /// Leave the transition page and move on
    pub async fn acknowledge_transition(&self) {
        if self.state().transition().is_none() {
            return;
        }
        let (generation, cancel, orchestrator) = {
            let slot = self.slot();
            let Some(orchestrator) = slot.orchestrator.clone() else {
                return;
            };
            (slot.generation, slot.cancel.clone(), orchestrator)
        };
        self.advance(generation, cancel, orchestrator).await;
    }

    async fn advance(
        &self,
        generation: u64,
        cancel: CancellationToken,
        orchestrator: Arc<FlowOrchestrator>,
    ) {
        let has_next = match orchestrator.next_step() {
            Ok(has_next) => has_next,
            Err(e) if e.is_disposed() => return,
            Err(e) => {
                warn!(error = %e, "Failed to advance flow");
                return;
            }
        };

        {
            let mut slot = self.slot();
            if !slot.is_current(generation, &cancel) {
                return;
            }
            slot.completion_signaled = false;
            slot.deferred_completion = None;
        }

        if has_next {
            if let Some((load_id, load)) = self.spawn_load() {
                if let Err(e) = load.await {
                    warn!(load_id, error = %e, "Step load task failed");
                    self.slot().release_load(load_id);
                }
            }
            return;
        }

        info!(flow_id = orchestrator.flow_id(), "Flow completed, leaving");
        self.inner.host.on_flow_completed().await;
        if self.is_stale(generation, &cancel) {
            return;
        }
        self.inner
            .host
            .redirect(&self.inner.settings.completion_route)
            .await;

        let previous = self.state();
        self.commit(
            generation,
            &cancel,
            FlowViewState {
                phase: FlowPhase::Completed,
                progress: orchestrator.progress().or(previous.progress.clone()),
                ..previous
            },
        );
    }

    /// Persist a page number for the active step
    pub fn update_module_progress(&self, page_num: &str) {
        let page_num = page_num.trim();
        if page_num.is_empty() {
            return;
        }
        let Some(step_index) = self.state().active().map(|r| r.step_index) else {
            return;
        };
        let Some(orchestrator) = self.orchestrator() else {
            return;
        };

        if let Some(current) = orchestrator.progress() {
            if current.step_index == step_index as i64
                && current.module_page_num.as_deref() == Some(page_num)
            {
                return;
            }
        }

        if let Err(e) = orchestrator.update_progress(step_index, PageNumUpdate::Set(page_num.to_string())) {
            if !e.is_disposed() {
                warn!(error = %e, "Failed to persist module progress");
            }
            return;
        }

        let progress = orchestrator.progress();
        self.inner.state_tx.send_if_modified(|state| {
            if state.active().map(|r| r.step_index) != Some(step_index) {
                return false;
            }
            state.progress.clone_from(&progress);
            true
        });
    }

    /// Pre-navigation hook: persist the target page and, when it reaches the
    /// submodule's last page, claim the step's completion. The completion
    /// itself runs in [`Self::after_navigate`], once the host has navigated.
    /// Never vetoes.
    pub async fn before_navigate(&self, page_id: String) -> bool {
        let state = self.state();
        let Some(resolved) = state.active().cloned() else {
            return true;
        };
        let Some(submodule) = resolved.submodule.clone() else {
            return true;
        };
        if page_id.is_empty() {
            return true;
        }

        let Some(page_num) = submodule.resolve_page_num(&page_id) else {
            warn!(page_id = %page_id, "Unable to resolve module page number");
            return true;
        };
        self.update_module_progress(&page_num);

        let Some(total) = submodule.total_steps().filter(|t| *t > 0) else {
            return true;
        };
        let reached_end = page_num.trim().parse::<u32>().is_ok_and(|n| n >= total);
        if !reached_end {
            return true;
        }

        {
            let mut slot = self.slot();
            if std::mem::replace(&mut slot.completion_signaled, true) {
                return true;
            }
            slot.deferred_completion = Some(resolved.step_index);
        }
        warn!(
            step_index = resolved.step_index,
            submodule_id = ?resolved.submodule_id,
            page_num = %page_num,
            total,
            "Completion fallback triggered by navigation"
        );
        true
    }

    /// Post-navigation hook: finish a step claimed by [`Self::before_navigate`]
    pub async fn after_navigate(&self) {
        let Some(step_index) = self.slot().deferred_completion.take() else {
            return;
        };
        let state = self.state();
        let Some(resolved) = state.active().filter(|r| r.step_index == step_index).cloned() else {
            debug!(step_index, "Step changed before its deferred completion ran");
            return;
        };
        self.finish_step(state, resolved).await;
    }

    /// Host context whose navigation goes through this controller
    pub fn bridge_host(&self, host: &HostContext) -> HostContext {
        let state = self.state();
        if let (Some(flow_id), Some(resolved)) = (state.flow_id.as_ref(), state.active()) {
            self.inner.bridge.bind_flow_context(
                host,
                FlowContextBinding {
                    flow_id: flow_id.clone(),
                    submodule_id: resolved.submodule_id.clone().unwrap_or_default(),
                    step_index: resolved.step_index,
                },
            );
        }
        self.inner.bridge.bridge(host)
    }

    /// Clear the host's flow binding when the flow view goes away
    pub fn release_host(&self, host: &HostContext) {
        self.inner.bridge.release_flow_context(host);
    }

    /// Props for the active submodule
    pub fn mount(&self, user_context: Value) -> Option<SubmoduleMount> {
        let state = self.state();
        let flow_id = state.flow_id.clone()?;
        let resolved = state.active()?;

        Some(SubmoduleMount {
            user_context,
            initial_page_id: resolved.initial_page_id.clone()?,
            options: resolved
                .step
                .as_ref()
                .and_then(|s| s.overrides.clone())
                .unwrap_or(Value::Null),
            flow_context: FlowContextHandle {
                flow_id,
                submodule_id: resolved.submodule_id.clone().unwrap_or_default(),
                step_index: resolved.step_index,
                module_page_num: state
                    .progress
                    .as_ref()
                    .and_then(|p| p.module_page_num.clone()),
                controller: self.clone(),
            },
        })
    }

    /// Tear down the current flow and go idle
    pub fn shutdown(&self) {
        self.set_flow_id(None);
    }

    pub fn catalog(&self) -> &Arc<dyn SubmoduleCatalog> {
        &self.inner.services.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiClient, ApiError, FlowEndpoints};
    use crate::store::MemoryFlowCache;
    use crate::submodules::{PagedSubmodule, SubmoduleDefinition, SubmoduleRegistry};
    use async_trait::async_trait;
    use serde_json::json;

    struct DefinitionApi {
        steps: Vec<&'static str>,
    }

    #[async_trait]
    impl ApiClient for DefinitionApi {
        async fn get(&self, path: &str) -> Result<Value, ApiError> {
            if path != FlowEndpoints::default().definition("g7") {
                return Err(ApiError::network("connection refused"));
            }
            let steps: Vec<Value> = self.steps.iter().map(|s| json!({ "submoduleId": s })).collect();
            Ok(json!({ "code": 200, "obj": { "flowId": "g7", "steps": steps } }))
        }

        async fn post(&self, _path: &str, _body: &Value) -> Result<Value, ApiError> {
            Ok(Value::Null)
        }
    }

    struct SilentHost;

    #[async_trait]
    impl FlowHost for SilentHost {
        fn log_operation(&self, _operation: FlowContextOperation) -> bool {
            true
        }

        async fn on_flow_completed(&self) {}

        async fn redirect(&self, _route: &str) {}
    }

    /// Breaks while mounting
    struct BrokenSubmodule;

    impl SubmoduleDefinition for BrokenSubmodule {
        fn submodule_id(&self) -> &str {
            "broken"
        }

        fn display_name(&self) -> &str {
            "Broken"
        }

        fn initial_page(&self, page_num: &str) -> String {
            format!("page-{page_num}")
        }

        fn on_initialize(&self) {
            panic!("submodule failed to mount");
        }
    }

    fn controller(steps: &[&'static str]) -> FlowController {
        let registry = SubmoduleRegistry::new();
        for id in ["a", "b"] {
            registry
                .register(Arc::new(PagedSubmodule::new(id, id.to_uppercase())))
                .unwrap();
        }
        registry.register(Arc::new(BrokenSubmodule)).unwrap();

        let services = FlowServices::new(
            Arc::new(DefinitionApi { steps: steps.to_vec() }),
            FlowEndpoints::default(),
            Arc::new(registry),
            Arc::new(MemoryFlowCache::new()),
        );
        let settings = ControllerSettings {
            heartbeat_enabled: false,
            ..ControllerSettings::default()
        };
        FlowController::new(services, Arc::new(SilentHost), settings)
    }

    fn active_step(controller: &FlowController) -> Option<usize> {
        controller.state().active().map(|r| r.step_index)
    }

    #[tokio::test]
    async fn test_final_commit_releases_its_load() {
        let controller = controller(&["a", "b"]);
        controller.set_flow_id(Some("g7".into())).unwrap().await.unwrap();

        let (ticket, other) = {
            let mut slot = controller.slot();
            let other = slot.next_load();
            let ticket = slot.next_load();
            let running = futures_util::future::pending::<()>().boxed().shared();
            slot.pending_load = Some((ticket.id, running));
            (ticket, other)
        };

        // Another load's commit leaves it registered
        assert!(controller.commit_load(&other, controller.state()));
        assert!(controller.slot().pending_load.is_some());

        assert!(controller.commit_load(&ticket, controller.state()));
        assert!(controller.slot().pending_load.is_none());
    }

    #[tokio::test]
    async fn test_advance_starts_fresh_load_over_finished_one() {
        let controller = controller(&["a", "b"]);
        controller.set_flow_id(Some("g7".into())).unwrap().await.unwrap();
        assert_eq!(active_step(&controller), Some(0));

        // A finished load that has not been released yet
        let finished = async {}.boxed().shared();
        finished.clone().await;
        {
            let mut slot = controller.slot();
            let ticket = slot.next_load();
            slot.pending_load = Some((ticket.id, finished));
        }

        controller.handle_submodule_complete().await;
        assert_eq!(active_step(&controller), Some(1));
        assert_eq!(controller.orchestrator().unwrap().progress().unwrap().step_index, 1);
    }

    #[tokio::test]
    async fn test_failed_step_load_does_not_escape_completion() {
        let controller = controller(&["a", "broken"]);
        controller.set_flow_id(Some("g7".into())).unwrap().await.unwrap();

        controller.handle_submodule_complete().await;

        assert!(controller.state().active().is_none());
        assert_eq!(controller.state().phase.name(), "loading");
        // The dead load is not joined by the next reload
        assert!(controller.slot().pending_load.is_none());
    }

    #[test]
    fn test_flow_id_from_url() {
        assert_eq!(flow_id_from_url("/flow/g7-2025").as_deref(), Some("g7-2025"));
        assert_eq!(
            flow_id_from_url("https://exam.example.com/flow/g4?x=1#top").as_deref(),
            Some("g4")
        );
        assert_eq!(flow_id_from_url("/FLOW/abc/step").as_deref(), Some("abc"));
        assert_eq!(flow_id_from_url("/flow/a%20b").as_deref(), Some("a%20b"));
        assert_eq!(flow_id_from_url("/flows/abc"), None);
        assert_eq!(flow_id_from_url("/flow/"), None);
        assert_eq!(flow_id_from_url(""), None);
    }

    #[test]
    fn test_settings_from_config_clamp_interval() {
        let mut config = Config::default();
        config.heartbeat.interval_secs = 1;
        let settings = ControllerSettings::from_config(&config);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(settings.completion_route, "/login");
        assert_eq!(settings.navigation_aliases, vec!["set_current_page_id".to_string()]);
    }
}
