use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::{Capability, CapabilityError, InvocationContext, RateLimiter, RetryPolicy, ToolOutput};
use crate::metrics::record_invocation;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("capability '{0}' is already registered")]
    Duplicate(String),
}

/// Structured failure returned by [`CapabilityRegistry::invoke`].
///
/// Rendered into an observation by the runtime; never propagated as a panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchFailure {
    #[error("unknown capability '{name}'. Available: {available}")]
    UnknownCapability { name: String, available: String },
    #[error("invalid arguments for '{capability}': {}", .problems.join("; "))]
    Validation {
        capability: String,
        problems: Vec<String>,
    },
    #[error("capability '{capability}' failed after {attempts} attempt(s): {message}")]
    Failed {
        capability: String,
        attempts: u32,
        message: String,
    },
    #[error("capability '{capability}' panicked during invocation")]
    Panicked { capability: String },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PluginReport {
    pub registered: Vec<String>,
    pub rejected: Vec<RegistryError>,
}

/// Catalog of capabilities, built once at startup and shared read-only.
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl CapabilityRegistry {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            capabilities: BTreeMap::new(),
            limiter: Arc::new(RateLimiter::new()),
            retry,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<(), RegistryError> {
        let name = capability.name().to_string();
        if self.capabilities.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        debug!(capability = %name, category = capability.category(), "registered capability");
        self.capabilities.insert(name, capability);
        Ok(())
    }

    /// Register an additional capability set after the core set.
    ///
    /// Conflicting names are rejected and reported; the rest of the set is kept.
    pub fn register_plugins(
        &mut self,
        plugin: &str,
        capabilities: impl IntoIterator<Item = Arc<dyn Capability>>,
    ) -> PluginReport {
        let mut report = PluginReport::default();
        for capability in capabilities {
            let name = capability.name().to_string();
            match self.register(capability) {
                Ok(()) => report.registered.push(name),
                Err(err) => {
                    warn!(plugin, error = %err, "rejected plugin capability");
                    report.rejected.push(err);
                }
            }
        }
        report
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn categories(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, capability) in &self.capabilities {
            grouped
                .entry(capability.category().to_string())
                .or_default()
                .push(name.clone());
        }
        grouped
    }

    /// Prompt-ready description of every capability accepted by `filter`.
    pub fn describe(&self, filter: impl Fn(&str) -> bool) -> String {
        let mut lines = Vec::new();
        for (name, capability) in self.capabilities.iter().filter(|(name, _)| filter(name)) {
            lines.push(format!("- {name}: {}", capability.description()));
            for param in capability.parameters() {
                let flag = if param.required { "required" } else { "optional" };
                let mut line = format!("    {}: {} ({flag})", param.name, param.kind.as_str());
                if !param.description.is_empty() {
                    line.push_str(&format!(" {}", param.description));
                }
                lines.push(line);
            }
        }
        lines.join("\n")
    }

    pub fn describe_all(&self) -> String {
        self.describe(|_| true)
    }

    /// Check `args` against the declared schema of `capability`.
    pub fn validate(
        capability: &dyn Capability,
        args: &Map<String, Value>,
    ) -> Result<(), Vec<String>> {
        let params = capability.parameters();
        let mut problems = Vec::new();

        for param in &params {
            match args.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    problems.push(format!("missing required argument '{}'", param.name));
                }
                Some(value) if !value.is_null() && !param.kind.accepts(value) => {
                    problems.push(format!(
                        "argument '{}' must be {}, got {}",
                        param.name,
                        param.kind.as_str(),
                        json_type(value)
                    ));
                }
                _ => {}
            }
        }

        for key in args.keys() {
            if !params.iter().any(|param| &param.name == key) {
                problems.push(format!("unexpected argument '{key}'"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Validate and invoke a capability.
    ///
    /// Transient failures are retried with backoff. Every other outcome,
    /// including a panic inside the capability, comes back as a value.
    #[instrument(skip(self, args, ctx), fields(run_id = %ctx.run_id))]
    pub async fn invoke(
        &self,
        name: &str,
        args: &Map<String, Value>,
        ctx: &InvocationContext<'_>,
    ) -> Result<Vec<ToolOutput>, DispatchFailure> {
        let Some(capability) = self.resolve(name) else {
            record_invocation(name, "unknown", 0);
            return Err(DispatchFailure::UnknownCapability {
                name: name.to_string(),
                available: self.names().join(", "),
            });
        };

        if let Err(problems) = Self::validate(capability.as_ref(), args) {
            record_invocation(name, "invalid", 0);
            return Err(DispatchFailure::Validation {
                capability: name.to_string(),
                problems,
            });
        }

        let started = Instant::now();
        let mut attempt = 0;
        loop {
            if let Some(service) = capability.service() {
                self.limiter.acquire(service).await;
            }
            attempt += 1;

            let call = AssertUnwindSafe(capability.invoke(args, ctx)).catch_unwind();
            let elapsed = || started.elapsed().as_millis() as u64;
            match call.await {
                Ok(Ok(outputs)) => {
                    record_invocation(name, "success", elapsed());
                    debug!(capability = name, outputs = outputs.len(), attempt, "capability succeeded");
                    return Ok(outputs);
                }
                Ok(Err(CapabilityError::Transient(message)))
                    if attempt < self.retry.max_attempts() =>
                {
                    let delay = self.retry.delay_for(attempt - 1);
                    warn!(
                        capability = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient capability failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(err)) => {
                    record_invocation(name, "failure", elapsed());
                    warn!(capability = name, attempt, error = %err, "capability failed");
                    return Err(DispatchFailure::Failed {
                        capability: name.to_string(),
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
                Err(_) => {
                    record_invocation(name, "panic", elapsed());
                    warn!(capability = name, "capability panicked");
                    return Err(DispatchFailure::Panicked {
                        capability: name.to_string(),
                    });
                }
            }
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ParamSpec, ParamType};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Quote {
        calls: AtomicUsize,
        transient_failures: usize,
    }

    impl Quote {
        fn new(transient_failures: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                transient_failures,
            }
        }
    }

    #[async_trait]
    impl Capability for Quote {
        fn name(&self) -> &str {
            "stock_quote"
        }

        fn description(&self) -> &str {
            "Latest quote for a ticker"
        }

        fn parameters(&self) -> Vec<ParamSpec> {
            vec![
                ParamSpec::required("ticker", ParamType::String),
                ParamSpec::optional("days", ParamType::Integer),
            ]
        }

        fn category(&self) -> &str {
            "market"
        }

        async fn invoke(
            &self,
            args: &Map<String, Value>,
            _ctx: &InvocationContext<'_>,
        ) -> Result<Vec<ToolOutput>, CapabilityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.transient_failures {
                return Err(CapabilityError::Transient("429 too many requests".into()));
            }
            Ok(vec![ToolOutput::new(
                "quote",
                "Latest quote",
                json!({"ticker": args["ticker"], "price": 10.5}),
                "test-feed",
            )])
        }
    }

    struct Panicky;

    #[async_trait]
    impl Capability for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn description(&self) -> &str {
            "Always panics"
        }

        fn parameters(&self) -> Vec<ParamSpec> {
            Vec::new()
        }

        async fn invoke(
            &self,
            _args: &Map<String, Value>,
            _ctx: &InvocationContext<'_>,
        ) -> Result<Vec<ToolOutput>, CapabilityError> {
            panic!("capability bug");
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn ctx() -> InvocationContext<'static> {
        InvocationContext::new("collector-test", "task-1")
    }

    #[test]
    fn duplicate_names_fail_registration() {
        let mut registry = CapabilityRegistry::default();
        registry.register(Arc::new(Quote::new(0))).unwrap();
        let err = registry.register(Arc::new(Quote::new(0))).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("stock_quote".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn plugin_conflicts_are_reported_not_fatal() {
        let mut registry = CapabilityRegistry::default();
        registry.register(Arc::new(Quote::new(0))).unwrap();
        let plugins: Vec<Arc<dyn Capability>> = vec![Arc::new(Quote::new(0)), Arc::new(Panicky)];
        let report = registry.register_plugins("extra", plugins);
        assert_eq!(report.registered, vec!["panicky".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        assert!(registry.resolve("panicky").is_some());
    }

    #[tokio::test]
    async fn missing_required_argument_is_a_validation_failure() {
        let mut registry = CapabilityRegistry::default();
        let quote = Arc::new(Quote::new(0));
        registry.register(quote.clone()).unwrap();

        let err = registry
            .invoke("stock_quote", &args(json!({"days": 5})), &ctx())
            .await
            .unwrap_err();
        match err {
            DispatchFailure::Validation { problems, .. } => {
                assert!(problems[0].contains("ticker"));
            }
            other => panic!("unexpected failure {other:?}"),
        }
        assert_eq!(quote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_type_is_rejected() {
        let mut registry = CapabilityRegistry::default();
        registry.register(Arc::new(Quote::new(0))).unwrap();
        let err = registry
            .invoke("stock_quote", &args(json!({"ticker": 600519})), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must be string"));
    }

    #[tokio::test]
    async fn unknown_capability_lists_available_names() {
        let mut registry = CapabilityRegistry::default();
        registry.register(Arc::new(Quote::new(0))).unwrap();
        let err = registry
            .invoke("news_search", &Map::new(), &ctx())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchFailure::UnknownCapability {
                name: "news_search".into(),
                available: "stock_quote".into(),
            }
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let mut registry = CapabilityRegistry::new(RetryPolicy::immediate(3));
        let quote = Arc::new(Quote::new(2));
        registry.register(quote.clone()).unwrap();

        let outputs = registry
            .invoke("stock_quote", &args(json!({"ticker": "600519"})), &ctx())
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(quote.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let mut registry = CapabilityRegistry::new(RetryPolicy::immediate(2));
        let quote = Arc::new(Quote::new(10));
        registry.register(quote.clone()).unwrap();

        let err = registry
            .invoke("stock_quote", &args(json!({"ticker": "600519"})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchFailure::Failed { attempts: 2, .. }));
        assert_eq!(quote.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panics_become_structured_failures() {
        let mut registry = CapabilityRegistry::default();
        registry.register(Arc::new(Panicky)).unwrap();
        let err = registry
            .invoke("panicky", &Map::new(), &ctx())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchFailure::Panicked {
                capability: "panicky".into()
            }
        );
    }

    #[test]
    fn description_lists_parameters() {
        let mut registry = CapabilityRegistry::default();
        registry.register(Arc::new(Quote::new(0))).unwrap();
        let text = registry.describe_all();
        assert!(text.contains("- stock_quote: Latest quote for a ticker"));
        assert!(text.contains("ticker: string (required)"));
        assert!(text.contains("days: integer (optional)"));
        assert_eq!(
            registry.categories().get("market"),
            Some(&vec!["stock_quote".to_string()])
        );
    }
}
