//! Catch-all error handler serializing a generic error body.
//!
//! Unless restricted by `when` conditions, this handler is responsible for
//! every error. Placed last in a rule's error handler chain it guarantees
//! that no classified error leaves the pipeline unhandled.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::context::{ClientResponse, Context};
use crate::error::{ErrorKind, PipelineError, Result};
use crate::error_handlers::matcher::ErrorConditionMatcher;
use crate::handler::{is_empty_config, ErrorHandler, RawConfig};
use crate::registry::decode_config;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    when: Vec<ErrorConditionMatcher>,
}

#[derive(Debug)]
pub struct DefaultErrorHandler {
    id: String,
    when: Vec<ErrorConditionMatcher>,
}

impl DefaultErrorHandler {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let config: Config = decode_config("default error handler", config)?;

        Ok(Self {
            id: id.to_string(),
            when: config.when,
        })
    }
}

fn status_code(error: &PipelineError) -> u16 {
    match error.kind() {
        ErrorKind::Argument => 400,
        ErrorKind::Authentication => 401,
        ErrorKind::Authorization => 403,
        ErrorKind::CommunicationTimeout => 504,
        ErrorKind::Communication => 502,
        ErrorKind::Configuration | ErrorKind::Internal => 500,
    }
}

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    async fn execute(&self, ctx: &dyn Context, error: &PipelineError) -> Result<bool> {
        if !self.when.is_empty() && !self.when.iter().any(|matcher| matcher.matches(ctx, error)) {
            return Ok(false);
        }

        debug!(handler = %self.id, "handling error using default error handler");

        let code = status_code(error);
        ctx.set_pipeline_error(error.clone());
        ctx.set_client_response(ClientResponse {
            code,
            headers: Vec::new(),
            body: Some(json!({"code": code, "message": error.kind().to_string()})),
        });

        Ok(true)
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn ErrorHandler>> {
        if is_empty_config(config) {
            return Ok(self);
        }

        Ok(Arc::new(Self::new(&self.id, config)?))
    }

    fn handler_id(&self) -> &str {
        &self.id
    }
}

pub(crate) fn factory(
    id: &str,
    handler_type: &str,
    config: Option<&RawConfig>,
) -> Result<Option<Arc<dyn ErrorHandler>>> {
    if handler_type != "default" {
        return Ok(None);
    }
    Ok(Some(Arc::new(DefaultErrorHandler::new(id, config)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MockContext;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawConfig {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn handles_everything_without_conditions() {
        let handler = DefaultErrorHandler::new("eh", None).unwrap();

        let mut ctx = MockContext::new();
        ctx.expect_set_pipeline_error().times(1).return_const(());
        ctx.expect_set_client_response()
            .withf(|response| response.code == 403)
            .times(1)
            .return_const(());

        let handled = handler
            .execute(&ctx, &PipelineError::authorization("denied"))
            .await
            .unwrap();
        assert!(handled);
    }

    #[tokio::test]
    async fn conditions_restrict_responsibility() {
        let handler = DefaultErrorHandler::new(
            "eh",
            Some(&raw(json!({"when": [{"error": [{"type": "internal_error"}]}]}))),
        )
        .unwrap();

        let handled = handler
            .execute(&MockContext::new(), &PipelineError::authorization("denied"))
            .await
            .unwrap();
        assert!(!handled);
    }

    #[test]
    fn status_codes_follow_the_error_kind() {
        assert_eq!(status_code(&PipelineError::argument("x")), 400);
        assert_eq!(status_code(&PipelineError::authentication("x")), 401);
        assert_eq!(status_code(&PipelineError::authorization("x")), 403);
        assert_eq!(status_code(&PipelineError::communication("x")), 502);
        assert_eq!(status_code(&PipelineError::communication_timeout("x")), 504);
        assert_eq!(status_code(&PipelineError::internal("x")), 500);
        assert_eq!(status_code(&PipelineError::configuration("x")), 500);
    }
}
