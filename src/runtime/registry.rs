//! Name-keyed registries for orchestrations and activities.
//!
//! Registries are immutable once built and cheap to clone. `build()` validates
//! every registration and reports all problems at once, so a misconfigured
//! runtime fails at startup instead of at the first lookup.

use super::retry::RetryPolicy;
use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::{ActivityContext, OrchestrationContext, SYSTEM_ACTIVITY_PREFIX, codec};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry validation failure listing every rejected registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid registry: {}", .problems.join("; "))]
pub struct RegistryError {
    pub problems: Vec<String>,
}

/// Activity handler plus its optional retry override.
pub struct RegisteredActivity {
    pub(crate) handler: Arc<dyn ActivityHandler>,
    pub(crate) retry: Option<RetryPolicy>,
}

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<RegisteredActivity>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<RegisteredActivity>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            self.log_registry_miss(name);
        }
        found
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str) {
        tracing::debug!(
            target: "duraflow::runtime::registry",
            requested_name = %name,
            registered_count = self.inner.len(),
            registered_names = ?self.list_names(),
            "Registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    /// # Errors
    ///
    /// Returns every duplicate or reserved name that was registered.
    pub fn build(self) -> Result<Registry<H>, RegistryError> {
        if self.errors.is_empty() {
            Ok(Registry {
                inner: Arc::new(self.map),
            })
        } else {
            Err(RegistryError { problems: self.errors })
        }
    }

    fn insert(&mut self, kind: &str, name: String, handler: Arc<H>) {
        if name.starts_with(SYSTEM_ACTIVITY_PREFIX) {
            self.errors
                .push(format!("reserved {kind} name: {name} ('{SYSTEM_ACTIVITY_PREFIX}' prefix)"));
            return;
        }
        if name.is_empty() {
            self.errors.push(format!("empty {kind} name"));
            return;
        }
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {kind} registration: {name}"));
            return;
        }
        self.map.insert(name, handler);
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert("orchestration", name.into(), Arc::new(FnOrchestration(f)));
        self
    }

    /// Register an orchestration with serde-decoded input and serde-encoded output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = codec::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                codec::encode(&out)
            }
        };
        self.register(name, wrapper)
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_entry(name.into(), Arc::new(FnActivity(f)), None)
    }

    /// Register an activity whose attempts follow `policy` instead of the
    /// runtime's default activity retry policy.
    pub fn register_with_retry<F, Fut>(self, name: impl Into<String>, policy: RetryPolicy, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_entry(name.into(), Arc::new(FnActivity(f)), Some(policy))
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = codec::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                codec::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    /// Register a custom [`ActivityHandler`] implementation.
    pub fn register_handler(self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) -> Self {
        self.register_entry(name.into(), handler, None)
    }

    fn register_entry(mut self, name: String, handler: Arc<dyn ActivityHandler>, retry: Option<RetryPolicy>) -> Self {
        self.insert("activity", name, Arc::new(RegisteredActivity { handler, retry }));
        self
    }
}
