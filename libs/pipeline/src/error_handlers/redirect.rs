//! Error handler redirecting the client, e.g. to a login page.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::context::{ClientResponse, Context};
use crate::error::{PipelineError, Result};
use crate::error_handlers::matcher::ErrorConditionMatcher;
use crate::handler::{is_empty_config, ErrorHandler, RawConfig};
use crate::registry::decode_config;
use crate::template::Template;

const DEFAULT_CODE: u16 = 302;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    to: Template,
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    when: Vec<ErrorConditionMatcher>,
}

#[derive(Debug)]
pub struct RedirectErrorHandler {
    id: String,
    to: Template,
    code: u16,
    when: Vec<ErrorConditionMatcher>,
}

impl RedirectErrorHandler {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let config: Config = decode_config("redirect error handler", config)?;

        if config.when.is_empty() {
            return Err(PipelineError::configuration(
                "no 'when' error handler conditions defined",
            ));
        }

        let code = config.code.unwrap_or(DEFAULT_CODE);
        if !(300..400).contains(&code) {
            return Err(PipelineError::configuration(format!(
                "'{code}' is not a redirect status code"
            )));
        }

        Ok(Self {
            id: id.to_string(),
            to: config.to,
            code,
            when: config.when,
        })
    }

    pub fn code(&self) -> u16 {
        self.code
    }
}

#[async_trait]
impl ErrorHandler for RedirectErrorHandler {
    async fn execute(&self, ctx: &dyn Context, error: &PipelineError) -> Result<bool> {
        if !self.when.iter().any(|matcher| matcher.matches(ctx, error)) {
            return Ok(false);
        }

        debug!(handler = %self.id, "handling error using redirect error handler");

        let values = json!({"request_url": ctx.request_url().to_string()});
        let location = self.to.render(None, Some(&values)).map_err(|err| {
            PipelineError::internal("failed to render the redirect target")
                .with_handler_id(&self.id)
                .caused_by(err)
        })?;

        ctx.set_pipeline_error(error.clone());
        ctx.set_client_response(ClientResponse {
            code: self.code,
            headers: vec![("Location".to_string(), location)],
            body: None,
        });

        Ok(true)
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn ErrorHandler>> {
        if is_empty_config(config) {
            return Ok(self);
        }

        #[derive(Debug, Deserialize)]
        #[serde(deny_unknown_fields)]
        struct OverrideConfig {
            #[serde(default)]
            when: Option<Vec<ErrorConditionMatcher>>,
        }

        let overrides: OverrideConfig = decode_config("redirect error handler", config)?;

        Ok(Arc::new(Self {
            id: self.id.clone(),
            to: self.to.clone(),
            code: self.code,
            when: overrides.when.unwrap_or_else(|| self.when.clone()),
        }))
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
    if handler_type != "redirect" {
        return Ok(None);
    }
    Ok(Some(Arc::new(RedirectErrorHandler::new(id, config)?)))
}
