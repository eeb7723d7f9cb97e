//! Navigation interception.
//!
//! A host exposes one or more navigation entry points. The bridge hands out
//! a copy of the host context in which every one of them is the same wrapped
//! function: `before` may veto, the host navigates, then `after` runs.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

/// Name of the host's primary navigation entry point
pub const PRIMARY_ENTRY_POINT: &str = "navigate_to_page";

/// Other names hosts use for the same capability
pub const DEFAULT_ALIASES: &[&str] = &["set_current_page_id"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavigateOptions {
    pub replace: bool,
    pub state: Option<Value>,
}

/// Host navigation; resolves to whether navigation happened
pub type NavigateFn = Arc<dyn Fn(String, NavigateOptions) -> BoxFuture<'static, bool> + Send + Sync>;

/// Pre-navigation hook; `false` vetoes
pub type BeforeNavigate =
    Arc<dyn Fn(String, NavigateOptions) -> BoxFuture<'static, bool> + Send + Sync>;

/// Post-navigation hook
pub type AfterNavigate =
    Arc<dyn Fn(String, NavigateOptions) -> BoxFuture<'static, ()> + Send + Sync>;

/// Receives the current flow binding, `None` on unmount
pub type FlowContextSink = Arc<dyn Fn(Option<FlowContextBinding>) + Send + Sync>;

pub fn navigate_fn<F, Fut>(f: F) -> NavigateFn
where
    F: Fn(String, NavigateOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |page, options| f(page, options).boxed())
}

pub fn before_navigate<F, Fut>(f: F) -> BeforeNavigate
where
    F: Fn(String, NavigateOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |page, options| f(page, options).boxed())
}

pub fn after_navigate<F, Fut>(f: F) -> AfterNavigate
where
    F: Fn(String, NavigateOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |page, options| f(page, options).boxed())
}

/// Data pointer identity of two shared closures
fn same_target<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

fn same_hook<T: ?Sized>(a: Option<&Arc<T>>, b: Option<&Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => same_target(a, b),
        _ => false,
    }
}

/// Which step of which flow the host is currently showing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowContextBinding {
    pub flow_id: String,
    pub submodule_id: String,
    pub step_index: usize,
}

/// What the host application exposes to pages.
#[derive(Clone, Default)]
pub struct HostContext {
    entry_points: BTreeMap<String, NavigateFn>,
    flow_context_sink: Option<FlowContextSink>,
    pub extras: BTreeMap<String, Value>,
}

impl HostContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host context whose primary entry point is `navigate`
    pub fn with_navigate(navigate: NavigateFn) -> Self {
        Self::new().with_entry_point(PRIMARY_ENTRY_POINT, navigate)
    }

    pub fn with_entry_point(mut self, name: impl Into<String>, navigate: NavigateFn) -> Self {
        self.entry_points.insert(name.into(), navigate);
        self
    }

    pub fn with_flow_context_sink(mut self, sink: FlowContextSink) -> Self {
        self.flow_context_sink = Some(sink);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    pub fn navigate(&self) -> Option<&NavigateFn> {
        self.entry_point(PRIMARY_ENTRY_POINT)
    }

    pub fn entry_point(&self, name: &str) -> Option<&NavigateFn> {
        self.entry_points.get(name)
    }

    pub fn entry_point_names(&self) -> impl Iterator<Item = &str> {
        self.entry_points.keys().map(String::as_str)
    }
}

struct Memo {
    underlying: NavigateFn,
    before: Option<BeforeNavigate>,
    after: Option<AfterNavigate>,
    wrapped: NavigateFn,
}

/// Wraps a host's navigation so flow hooks see every transition.
pub struct NavigationBridge {
    aliases: Vec<String>,
    hooks: Mutex<(Option<BeforeNavigate>, Option<AfterNavigate>)>,
    memo: Mutex<Option<Memo>>,
    binding: Mutex<Option<FlowContextBinding>>,
}

impl Default for NavigationBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl NavigationBridge {
    pub fn new() -> Self {
        Self {
            aliases: DEFAULT_ALIASES.iter().map(|s| (*s).to_string()).collect(),
            hooks: Mutex::new((None, None)),
            memo: Mutex::new(None),
            binding: Mutex::new(None),
        }
    }

    /// Replace the alias list (the primary entry point is always rebound)
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_before(self, hook: BeforeNavigate) -> Self {
        self.lock_hooks().0 = Some(hook);
        self
    }

    pub fn with_after(self, hook: AfterNavigate) -> Self {
        self.lock_hooks().1 = Some(hook);
        self
    }

    /// Swap hooks; the wrapped function changes identity only if they differ
    pub fn set_hooks(&self, before: Option<BeforeNavigate>, after: Option<AfterNavigate>) {
        *self.lock_hooks() = (before, after);
    }

    fn lock_hooks(&self) -> std::sync::MutexGuard<'_, (Option<BeforeNavigate>, Option<AfterNavigate>)> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The intercepting wrapper for `underlying`, reused while the
    /// underlying function and both hooks stay the same
    pub fn wrap(&self, underlying: &NavigateFn) -> NavigateFn {
        let (before, after) = self.lock_hooks().clone();
        let mut memo = self.memo.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(m) = memo.as_ref() {
            if same_target(&m.underlying, underlying)
                && same_hook(m.before.as_ref(), before.as_ref())
                && same_hook(m.after.as_ref(), after.as_ref())
            {
                return m.wrapped.clone();
            }
        }

        let wrapped = intercept(underlying.clone(), before.clone(), after.clone());
        *memo = Some(Memo {
            underlying: underlying.clone(),
            before,
            after,
            wrapped: wrapped.clone(),
        });
        debug!("Created intercepting navigate wrapper");
        wrapped
    }

    /// Copy of `host` with the primary entry point and every alias bound to
    /// the same wrapper. Without a primary entry point the host is returned
    /// unchanged.
    pub fn bridge(&self, host: &HostContext) -> HostContext {
        let Some(underlying) = host.navigate() else {
            return host.clone();
        };

        let wrapped = self.wrap(underlying);
        let mut bridged = host.clone();
        bridged
            .entry_points
            .insert(PRIMARY_ENTRY_POINT.to_string(), wrapped.clone());
        for alias in &self.aliases {
            bridged.entry_points.insert(alias.clone(), wrapped.clone());
        }
        bridged
    }

    /// Tell the host which step is showing; only calls the host when the
    /// binding changed. Returns whether it did.
    pub fn bind_flow_context(&self, host: &HostContext, binding: FlowContextBinding) -> bool {
        let Some(sink) = host.flow_context_sink.as_ref() else {
            warn!("Host has no flow context sink, skipping binding");
            return false;
        };

        let mut current = self.binding.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref() == Some(&binding) {
            return false;
        }
        sink(Some(binding.clone()));
        *current = Some(binding);
        true
    }

    /// Clear the host's binding on unmount
    pub fn release_flow_context(&self, host: &HostContext) {
        let previous = self
            .binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(_), Some(sink)) = (previous, host.flow_context_sink.as_ref()) {
            sink(None);
        }
    }

    pub fn current_binding(&self) -> Option<FlowContextBinding> {
        self.binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn intercept(
    underlying: NavigateFn,
    before: Option<BeforeNavigate>,
    after: Option<AfterNavigate>,
) -> NavigateFn {
    Arc::new(move |page: String, options: NavigateOptions| {
        let underlying = underlying.clone();
        let before = before.clone();
        let after = after.clone();
        async move {
            if let Some(before) = before {
                if !before(page.clone(), options.clone()).await {
                    debug!(page = %page, "Navigation vetoed");
                    return false;
                }
            }

            let result = underlying(page.clone(), options.clone()).await;

            if let Some(after) = after {
                after(page, options).await;
            }
            result
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_navigate(counter: Arc<AtomicUsize>) -> NavigateFn {
        navigate_fn(move |_page, _options| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        })
    }

    #[tokio::test]
    async fn test_veto_skips_underlying() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bridge = NavigationBridge::new().with_before(before_navigate(|_, _| async { false }));
        let host = bridge.bridge(&HostContext::with_navigate(counting_navigate(calls.clone())));

        let navigate = host.navigate().unwrap();
        assert!(!navigate("page-2".into(), NavigateOptions::default()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_allowed_navigation_runs_once_then_after() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_after = seen.clone();
        let calls_after = calls.clone();
        let bridge = NavigationBridge::new()
            .with_before(before_navigate(|_, _| async { true }))
            .with_after(after_navigate(move |page, _| {
                let seen = seen_after.clone();
                let calls = calls_after.clone();
                async move {
                    seen.lock()
                        .unwrap()
                        .push((page, calls.load(Ordering::SeqCst)));
                }
            }));
        let host = bridge.bridge(&HostContext::with_navigate(counting_navigate(calls.clone())));

        let navigate = host.navigate().unwrap();
        assert!(navigate("page-3".into(), NavigateOptions::default()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // after ran once the host had navigated
        assert_eq!(*seen.lock().unwrap(), vec![("page-3".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_no_hooks_is_plain_navigation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bridge = NavigationBridge::new();
        let host = bridge.bridge(&HostContext::with_navigate(counting_navigate(calls.clone())));

        assert!(host.navigate().unwrap()("p".into(), NavigateOptions::default()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrapper_identity_is_stable() {
        let underlying = counting_navigate(Arc::new(AtomicUsize::new(0)));
        let before = before_navigate(|_, _| async { true });
        let bridge = NavigationBridge::new().with_before(before.clone());

        let first = bridge.wrap(&underlying);
        let second = bridge.wrap(&underlying);
        assert!(same_target(&first, &second));

        // same hook re-provided keeps identity
        bridge.set_hooks(Some(before), None);
        assert!(same_target(&first, &bridge.wrap(&underlying)));

        // new hook or new underlying changes it
        bridge.set_hooks(Some(before_navigate(|_, _| async { true })), None);
        let third = bridge.wrap(&underlying);
        assert!(!same_target(&first, &third));

        let other = counting_navigate(Arc::new(AtomicUsize::new(0)));
        assert!(!same_target(&third, &bridge.wrap(&other)));
    }

    #[test]
    fn test_all_aliases_share_wrapper() {
        let underlying = counting_navigate(Arc::new(AtomicUsize::new(0)));
        let host = HostContext::with_navigate(underlying.clone())
            .with_entry_point("set_current_page_id", underlying.clone())
            .with_entry_point("go_to", underlying.clone())
            .with_extra("theme", Value::from("dark"));
        let bridge = NavigationBridge::new().with_aliases(["set_current_page_id", "go_to"]);

        let bridged = bridge.bridge(&host);
        let primary = bridged.navigate().unwrap();
        for alias in ["set_current_page_id", "go_to"] {
            assert!(same_target(primary, bridged.entry_point(alias).unwrap()));
        }
        assert!(!same_target(primary, &underlying));
        assert_eq!(bridged.extras.get("theme"), Some(&Value::from("dark")));
    }

    #[test]
    fn test_missing_navigate_is_passthrough() {
        let side = counting_navigate(Arc::new(AtomicUsize::new(0)));
        let host = HostContext::new()
            .with_entry_point("open_help", side.clone())
            .with_extra("k", Value::from(1));

        let bridged = NavigationBridge::new().bridge(&host);
        assert!(bridged.navigate().is_none());
        assert!(bridged.entry_point("set_current_page_id").is_none());
        assert!(same_target(bridged.entry_point("open_help").unwrap(), &side));
        assert_eq!(bridged.extras, host.extras);
    }

    #[test]
    fn test_flow_context_set_only_on_change_and_cleared_on_release() {
        let updates: Arc<Mutex<Vec<Option<FlowContextBinding>>>> = Arc::default();
        let sink_updates = updates.clone();
        let host = HostContext::new().with_flow_context_sink(Arc::new(move |binding| {
            sink_updates.lock().unwrap().push(binding);
        }));
        let bridge = NavigationBridge::new();
        let binding = FlowContextBinding {
            flow_id: "g7".into(),
            submodule_id: "a".into(),
            step_index: 0,
        };

        assert!(bridge.bind_flow_context(&host, binding.clone()));
        assert!(!bridge.bind_flow_context(&host, binding.clone()));
        assert!(bridge.bind_flow_context(
            &host,
            FlowContextBinding {
                step_index: 1,
                ..binding
            }
        ));
        bridge.release_flow_context(&host);
        bridge.release_flow_context(&host);

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 3);
        assert!(updates[2].is_none());
        assert!(bridge.current_binding().is_none());
    }
}
