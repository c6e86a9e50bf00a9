//! The executable rule and the composite pipeline semantics.

use std::sync::Arc;

use globset::GlobMatcher;
use tracing::{debug, warn};
use url::Url;

use warden_pipeline::error::{ErrorKind, PipelineError, Result};
use warden_pipeline::handler::{Authenticator, Authorizer, ErrorHandler, Hydrator, Mutator};
use warden_pipeline::{Context, Subject};

/// A non-authenticating pipeline step, kept in declared order.
#[derive(Debug)]
pub(crate) enum PipelineStep {
    Authorizer(Arc<dyn Authorizer>),
    Hydrator(Arc<dyn Hydrator>),
    Mutator(Arc<dyn Mutator>),
}

impl PipelineStep {
    async fn execute(&self, ctx: &dyn Context, subject: &mut Subject) -> Result<()> {
        match self {
            PipelineStep::Authorizer(handler) => handler.execute(ctx, Some(subject)).await,
            PipelineStep::Hydrator(handler) => handler.execute(ctx, Some(subject)).await,
            PipelineStep::Mutator(handler) => handler.execute(ctx, Some(subject)).await,
        }
    }
}

/// A matched rule executes its pipeline against a request context.
#[derive(Debug)]
pub struct Rule {
    pub(crate) id: String,
    pub(crate) src_id: String,
    pub(crate) matcher: GlobMatcher,
    pub(crate) methods: Vec<String>,
    pub(crate) upstream: Option<Url>,
    pub(crate) authenticators: Vec<Arc<dyn Authenticator>>,
    pub(crate) steps: Vec<PipelineStep>,
    pub(crate) error_handlers: Vec<Arc<dyn ErrorHandler>>,
}

impl Rule {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn src_id(&self) -> &str {
        &self.src_id
    }

    pub fn matches_url(&self, url: &Url) -> bool {
        self.matcher.is_match(url.as_str())
    }

    pub fn matches_method(&self, method: &str) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(method))
    }

    /// Runs the pipeline. On success the upstream target (if any) is
    /// returned; on failure the error handlers run first and the error is
    /// returned afterwards, so the transport boundary always sees it.
    pub async fn execute(&self, ctx: &dyn Context) -> Result<Option<Url>> {
        debug!(rule = %self.id, "executing rule");

        match self.run_pipeline(ctx).await {
            Ok(()) => Ok(self.upstream.clone()),
            Err(err) => {
                self.dispatch_error(ctx, &err).await?;
                Err(err)
            }
        }
    }

    async fn run_pipeline(&self, ctx: &dyn Context) -> Result<()> {
        let mut subject = authenticate(&self.authenticators, ctx).await?;

        for step in &self.steps {
            step.execute(ctx, &mut subject).await?;
        }

        Ok(())
    }

    async fn dispatch_error(&self, ctx: &dyn Context, error: &PipelineError) -> Result<()> {
        for handler in &self.error_handlers {
            if handler.execute(ctx, error).await? {
                debug!(rule = %self.id, handler = %handler.handler_id(), "error handled");
                return Ok(());
            }
        }

        warn!(rule = %self.id, error = %error, "no error handler was responsible");
        Ok(())
    }
}

/// The composite subject creator: runs the authenticator chain with
/// fallback semantics.
///
/// A failing step hands over to the next one iff its error chain contains
/// an argument error (no credential of the expected shape) or the step
/// explicitly allows fallback on any error. If every step failed, the last
/// error wins.
pub(crate) async fn authenticate(
    authenticators: &[Arc<dyn Authenticator>],
    ctx: &dyn Context,
) -> Result<Subject> {
    let mut last_error: Option<PipelineError> = None;

    for authenticator in authenticators {
        match authenticator.execute(ctx).await {
            Ok(subject) => return Ok(subject),
            Err(err) => {
                if err.is(ErrorKind::Argument) || authenticator.is_fallback_on_error_allowed() {
                    debug!(
                        handler = %authenticator.handler_id(),
                        "authenticator failed, continuing with the next one"
                    );
                    last_error = Some(err);
                    continue;
                }
                return Err(err);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| PipelineError::internal("no authenticators configured")))
}
