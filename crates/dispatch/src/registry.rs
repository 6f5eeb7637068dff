//! Handler registry: the process-wide mapping from job names to handlers.
//!
//! The registry is populated once at startup and then shared immutably
//! via `Arc` — an explicit data structure passed to the dispatcher, never
//! ambient global state. Each registration carries its feature category
//! (an observability tag classifying the owning product area) and an
//! explicit `idempotent` flag that the consume path checks to decide
//! whether the idempotency guard is mandatory before invocation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use relay_core::descriptor::validate_job_name;
use relay_core::CoreError;

use crate::error::HandlerError;

// ---------------------------------------------------------------------------
// JobContext
// ---------------------------------------------------------------------------

/// Scoped execution context handed to a handler for one delivery.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Name the job was enqueued under.
    pub job_name: String,
    /// Delivery token of the job being executed.
    pub token: Uuid,
    /// 1-indexed delivery attempt.
    pub attempt: u32,
    /// Feature category from the handler registration.
    pub feature_category: String,
}

// ---------------------------------------------------------------------------
// JobHandler
// ---------------------------------------------------------------------------

/// A unit of deferred work. Implementations must tolerate re-execution:
/// the queue is at-least-once and only registrations marked `idempotent`
/// get the duplicate-execution guard.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job with the descriptor's ordered arguments.
    async fn perform(
        &self,
        ctx: &JobContext,
        arguments: &[serde_json::Value],
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Boxed future returned by [`FnHandler`] closures.
pub type HandlerFuture =
    Pin<Box<dyn Future<Output = Result<serde_json::Value, HandlerError>> + Send>>;

/// Adapter turning a plain async closure into a [`JobHandler`].
///
/// Mostly used in tests and small wiring code where a full struct per
/// handler would be noise.
pub struct FnHandler {
    f: Box<dyn Fn(JobContext, Vec<serde_json::Value>) -> HandlerFuture + Send + Sync>,
}

impl FnHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(JobContext, Vec<serde_json::Value>) -> HandlerFuture + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl JobHandler for FnHandler {
    async fn perform(
        &self,
        ctx: &JobContext,
        arguments: &[serde_json::Value],
    ) -> Result<serde_json::Value, HandlerError> {
        (self.f)(ctx.clone(), arguments.to_vec()).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// One registered handler with its dispatch metadata.
pub struct HandlerRegistration {
    pub name: String,
    /// Observability tag, e.g. `"devops_reports"`.
    pub feature_category: String,
    /// When set, the consume path must pass the idempotency guard before
    /// invoking the handler.
    pub idempotent: bool,
    handler: Arc<dyn JobHandler>,
}

impl HandlerRegistration {
    pub fn handler(&self) -> Arc<dyn JobHandler> {
        Arc::clone(&self.handler)
    }
}

/// Registry of all handlers known to this process.
///
/// Immutable for the process lifetime once wiring is done; the worker
/// binary builds it, wraps it in `Arc`, and hands it to the dispatcher.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerRegistration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`.
    ///
    /// Fails on an invalid name or when the name is already taken —
    /// silently replacing a handler at startup is always a wiring bug.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        feature_category: impl Into<String>,
        idempotent: bool,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), CoreError> {
        let name = name.into();
        validate_job_name(&name)?;
        if self.handlers.contains_key(&name) {
            return Err(CoreError::Conflict(format!(
                "Handler already registered for job kind \"{name}\""
            )));
        }
        self.handlers.insert(
            name.clone(),
            HandlerRegistration {
                name,
                feature_category: feature_category.into(),
                idempotent,
                handler,
            },
        );
        Ok(())
    }

    /// Look up the registration for a job name.
    pub fn get(&self, name: &str) -> Option<&HandlerRegistration> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn noop_handler() -> Arc<dyn JobHandler> {
        Arc::new(FnHandler::new(|_ctx, _args| {
            Box::pin(async { Ok(serde_json::Value::Null) })
        }))
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("create_snapshot", "devops_reports", true, noop_handler())
            .unwrap();

        let reg = registry.get("create_snapshot").unwrap();
        assert_eq!(reg.feature_category, "devops_reports");
        assert!(reg.idempotent);
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("export_csv", "importers", false, noop_handler())
            .unwrap();
        let err = registry.register("export_csv", "importers", false, noop_handler());
        assert_matches!(err, Err(CoreError::Conflict(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn invalid_name_rejected() {
        let mut registry = HandlerRegistry::new();
        assert_matches!(
            registry.register("bad name", "misc", false, noop_handler()),
            Err(CoreError::Validation(_))
        );
        assert!(registry.is_empty());
    }
}
