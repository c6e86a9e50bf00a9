//! Handler contracts shared by all pipeline object families.
//!
//! Every pipeline object is built twice: a **prototype** from the global
//! configuration and, where a rule overrides settings, a per-rule
//! specialization derived via [`with_config`]. Prototypes are immutable and
//! shared across rules; `with_config` never mutates its receiver and
//! returns the receiver itself when the override is empty.
//!
//! [`with_config`]: Authenticator::with_config

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{PipelineError, Result};
use crate::subject::Subject;

/// Raw, not yet validated handler configuration.
pub type RawConfig = serde_json::Map<String, serde_json::Value>;

/// Returns `true` if the given override carries no settings.
pub fn is_empty_config(config: Option<&RawConfig>) -> bool {
    config.map(|map| map.is_empty()).unwrap_or(true)
}

/// Produces a [`Subject`] from the inbound request, or fails with a
/// classified error.
#[async_trait]
pub trait Authenticator: Send + Sync + std::fmt::Debug {
    async fn execute(&self, ctx: &dyn Context) -> Result<Subject>;

    /// Derives a per-rule specialization. Returns the receiver unchanged
    /// for an empty override.
    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Authenticator>>;

    /// Whether the authenticator chain may continue with the next step
    /// after this one failed with an arbitrary error.
    fn is_fallback_on_error_allowed(&self) -> bool {
        false
    }

    fn handler_id(&self) -> &str;
}

/// Permits or denies the request for the given subject, optionally
/// decorating it.
#[async_trait]
pub trait Authorizer: Send + Sync + std::fmt::Debug {
    async fn execute(&self, ctx: &dyn Context, subject: Option<&mut Subject>) -> Result<()>;

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Authorizer>>;

    fn handler_id(&self) -> &str;
}

/// Enriches the subject with data from a remote system.
#[async_trait]
pub trait Hydrator: Send + Sync + std::fmt::Debug {
    async fn execute(&self, ctx: &dyn Context, subject: Option<&mut Subject>) -> Result<()>;

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Hydrator>>;

    fn handler_id(&self) -> &str;
}

/// Attaches headers or cookies for the upstream request.
#[async_trait]
pub trait Mutator: Send + Sync + std::fmt::Debug {
    async fn execute(&self, ctx: &dyn Context, subject: Option<&Subject>) -> Result<()>;

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Mutator>>;

    fn handler_id(&self) -> &str;
}

/// Converts a classified pipeline error into a client visible outcome.
#[async_trait]
pub trait ErrorHandler: Send + Sync + std::fmt::Debug {
    /// Returns `Ok(true)` if this handler was responsible for the error and
    /// handled it, `Ok(false)` if the dispatcher should try the next one.
    async fn execute(&self, ctx: &dyn Context, error: &PipelineError) -> Result<bool>;

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn ErrorHandler>>;

    fn handler_id(&self) -> &str;
}
