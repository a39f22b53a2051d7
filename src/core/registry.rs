//! Task registry: maps a task type to its handler and per-type options.
//!
//! The registry is assembled once with [`RegistryBuilder`] and is immutable
//! afterwards; the engine shares it behind an `Arc`.
//!
//! # Examples
//!
//! ```rust
//! use anvilq::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl AnvilTask for SendEmail {
//!     const TASK_TYPE: &'static str = "email:send";
//!
//!     async fn forge(self, _ctx: &TaskContext) -> Result<(), HandlerError> {
//!         Ok(())
//!     }
//! }
//!
//! let registry = RegistryBuilder::new()
//!     .register_task::<SendEmail>()
//!     .build()
//!     .unwrap();
//! assert!(registry.contains("email:send"));
//! ```

use crate::core::handler::{FnHandler, TaskContext, TaskHandler, TypedHandler, handler_fn};
use crate::error::{AnvilError, AnvilResult, HandlerError};
use crate::idempotency::IdempotencyMode;
use crate::task::{AnvilTask, QueuedTask};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Derives the idempotency key of a task.
pub type KeyExtractor = Arc<dyn Fn(&QueuedTask) -> String + Send + Sync>;

/// Per-type options attached at registration.
#[derive(Clone)]
pub struct HandlerOptions {
    key_extractor: Option<KeyExtractor>,
    idempotency_mode: Option<IdempotencyMode>,
    idempotency_ttl: Option<Duration>,
    idempotent: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            key_extractor: None,
            idempotency_mode: None,
            idempotency_ttl: None,
            idempotent: true,
        }
    }
}

impl std::fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("custom_key", &self.key_extractor.is_some())
            .field("idempotency_mode", &self.idempotency_mode)
            .field("idempotency_ttl", &self.idempotency_ttl)
            .field("idempotent", &self.idempotent)
            .finish()
    }
}

impl HandlerOptions {
    /// Default options: guarded, keyed by task id, configured mode and TTL.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the idempotency key from the whole task.
    pub fn with_key<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&QueuedTask) -> String + Send + Sync + 'static,
    {
        self.key_extractor = Some(Arc::new(extractor));
        self
    }

    /// Derive the idempotency key from the decoded payload, for domain-level
    /// dedup such as composite business keys. An undecodable payload falls
    /// back to the task id.
    pub fn with_payload_key<T, F>(self, extractor: F) -> Self
    where
        T: DeserializeOwned + 'static,
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.with_key(move |task: &QueuedTask| {
            match serde_json::from_slice::<T>(&task.payload) {
                Ok(payload) => format!("{}:{}", task.task_type, extractor(&payload)),
                Err(_) => task.id.clone(),
            }
        })
    }

    /// Override the store-unreachable behaviour for this type.
    pub fn mode(mut self, mode: IdempotencyMode) -> Self {
        self.idempotency_mode = Some(mode);
        self
    }

    /// Override the record TTL for this type.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = Some(ttl);
        self
    }

    /// Run this type without the idempotency guard.
    pub fn without_idempotency(mut self) -> Self {
        self.idempotent = false;
        self
    }
}

/// A registered handler and its options.
#[derive(Clone)]
pub struct Registration {
    handler: Arc<dyn TaskHandler>,
    options: HandlerOptions,
}

impl Registration {
    /// The handler.
    pub fn handler(&self) -> &Arc<dyn TaskHandler> {
        &self.handler
    }

    /// Whether the idempotency guard applies.
    pub fn is_idempotent(&self) -> bool {
        self.options.idempotent
    }

    /// Idempotency key of `task`, the task id unless an extractor was set.
    pub fn idempotency_key(&self, task: &QueuedTask) -> String {
        match &self.options.key_extractor {
            Some(extract) => extract(task),
            None => task.id.clone(),
        }
    }

    /// Mode for this type, falling back to `default`.
    pub fn mode_or(&self, default: IdempotencyMode) -> IdempotencyMode {
        self.options.idempotency_mode.unwrap_or(default)
    }

    /// TTL for this type, falling back to `default`.
    pub fn ttl_or(&self, default: Duration) -> Duration {
        self.options.idempotency_ttl.unwrap_or(default)
    }
}

/// Builder for an immutable [`TaskRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<String, Registration>,
    errors: Vec<AnvilError>,
}

impl RegistryBuilder {
    /// Start an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler with default options.
    pub fn register<H>(self, task_type: impl Into<String>, handler: H) -> Self
    where
        H: TaskHandler + 'static,
    {
        self.register_with(task_type, handler, HandlerOptions::default())
    }

    /// Register a handler with explicit options.
    pub fn register_with<H>(
        mut self,
        task_type: impl Into<String>,
        handler: H,
        options: HandlerOptions,
    ) -> Self
    where
        H: TaskHandler + 'static,
    {
        let task_type = task_type.into();
        if task_type.trim().is_empty() {
            self.errors
                .push(AnvilError::config("Task type must not be empty"));
            return self;
        }
        if self.entries.contains_key(&task_type) {
            self.errors
                .push(AnvilError::DuplicateHandler { task_type });
            return self;
        }

        self.entries.insert(
            task_type,
            Registration {
                handler: Arc::new(handler),
                options,
            },
        );
        self
    }

    /// Register a typed task under [`AnvilTask::TASK_TYPE`].
    pub fn register_task<T: AnvilTask>(self) -> Self {
        self.register(T::TASK_TYPE, TypedHandler::<T>::new())
    }

    /// Register a typed task with explicit options.
    pub fn register_task_with<T: AnvilTask>(self, options: HandlerOptions) -> Self {
        self.register_with(T::TASK_TYPE, TypedHandler::<T>::new(), options)
    }

    /// Register an async closure.
    pub fn handle_fn<F, Fut>(self, task_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: FnHandler<F> = handler_fn(f);
        self.register(task_type, handler)
    }

    /// Freeze the registry. Fails on the first registration error.
    pub fn build(self) -> AnvilResult<TaskRegistry> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        tracing::debug!(task_types = self.entries.len(), "Task registry built");
        Ok(TaskRegistry {
            entries: self.entries,
        })
    }
}

/// Immutable map from task type to [`Registration`].
#[derive(Clone, Default)]
pub struct TaskRegistry {
    entries: HashMap<String, Registration>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl TaskRegistry {
    /// Look up the registration of a task type.
    pub fn get(&self, task_type: &str) -> Option<&Registration> {
        self.entries.get(task_type)
    }

    /// Whether a task type is registered.
    pub fn contains(&self, task_type: &str) -> bool {
        self.entries.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered task types
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Terminal handler of the middleware chain: resolves the task type in the
/// registry and invokes the registered handler.
pub(crate) struct RegistryDispatch {
    registry: Arc<TaskRegistry>,
}

impl RegistryDispatch {
    pub(crate) fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl TaskHandler for RegistryDispatch {
    async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
        match self.registry.get(ctx.task_type()) {
            Some(registration) => registration.handler().handle(ctx, payload).await,
            None => Err(HandlerError::unregistered(ctx.task_type())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Serialize, Deserialize)]
    struct ChargeCard {
        customer_id: u64,
        invoice_id: u64,
    }

    #[async_trait::async_trait]
    impl AnvilTask for ChargeCard {
        const TASK_TYPE: &'static str = "billing:charge";

        async fn forge(self, _ctx: &TaskContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_registration_is_error() {
        let err = RegistryBuilder::new()
            .register_task::<ChargeCard>()
            .handle_fn("billing:charge", |_ctx, _payload| async { Ok(()) })
            .build()
            .unwrap_err();
        assert!(matches!(err, AnvilError::DuplicateHandler { task_type } if task_type == "billing:charge"));
    }

    #[test]
    fn test_empty_task_type_is_error() {
        let err = RegistryBuilder::new()
            .handle_fn("  ", |_ctx, _payload| async { Ok(()) })
            .build()
            .unwrap_err();
        assert!(matches!(err, AnvilError::ConfigError { .. }));
    }

    #[test]
    fn test_default_key_is_task_id() {
        let registry = RegistryBuilder::new()
            .register_task::<ChargeCard>()
            .build()
            .unwrap();
        let task = QueuedTask::new(ChargeCard::TASK_TYPE, b"{}".to_vec(), "default", 3);
        let registration = registry.get(ChargeCard::TASK_TYPE).unwrap();
        assert_eq!(registration.idempotency_key(&task), task.id);
        assert!(registration.is_idempotent());
        assert_eq!(
            registration.mode_or(IdempotencyMode::FailOpen),
            IdempotencyMode::FailOpen
        );
    }

    #[test]
    fn test_payload_key_extractor() {
        let options = HandlerOptions::new()
            .with_payload_key(|charge: &ChargeCard| {
                format!("{}-{}", charge.customer_id, charge.invoice_id)
            })
            .mode(IdempotencyMode::FailClosed)
            .ttl(Duration::from_secs(600));
        let registry = RegistryBuilder::new()
            .register_task_with::<ChargeCard>(options)
            .build()
            .unwrap();
        let registration = registry.get(ChargeCard::TASK_TYPE).unwrap();

        let payload = serde_json::to_vec(&ChargeCard {
            customer_id: 7,
            invoice_id: 99,
        })
        .unwrap();
        let first = QueuedTask::new(ChargeCard::TASK_TYPE, payload.clone(), "default", 3);
        let second = QueuedTask::new(ChargeCard::TASK_TYPE, payload, "default", 3);
        assert_eq!(registration.idempotency_key(&first), "billing:charge:7-99");
        assert_eq!(
            registration.idempotency_key(&first),
            registration.idempotency_key(&second)
        );
        assert_eq!(
            registration.mode_or(IdempotencyMode::FailOpen),
            IdempotencyMode::FailClosed
        );
        assert_eq!(
            registration.ttl_or(Duration::from_secs(1)),
            Duration::from_secs(600)
        );

        let garbage = QueuedTask::new(ChargeCard::TASK_TYPE, b"nope".to_vec(), "default", 3);
        assert_eq!(registration.idempotency_key(&garbage), garbage.id);
    }

    #[tokio::test]
    async fn test_dispatch_unregistered() {
        let registry = Arc::new(RegistryBuilder::new().build().unwrap());
        assert!(registry.is_empty());

        let dispatch = RegistryDispatch::new(registry);
        let task = QueuedTask::new("ghost:task", vec![], "default", 3);
        let ctx = TaskContext::new(&task, None, CancellationToken::new());
        let err = dispatch.handle(&ctx, &task.payload).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Unregistered);
    }
}
