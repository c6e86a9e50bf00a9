//! Error handler challenging the client with `WWW-Authenticate`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::context::Context;
use crate::error::{PipelineError, Result};
use crate::error_handlers::matcher::ErrorConditionMatcher;
use crate::handler::{is_empty_config, ErrorHandler, RawConfig};
use crate::registry::decode_config;

const DEFAULT_REALM: &str = "Please authenticate";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    realm: Option<String>,
    #[serde(default)]
    when: Vec<ErrorConditionMatcher>,
}

#[derive(Debug)]
pub struct WwwAuthenticateErrorHandler {
    id: String,
    realm: String,
    when: Vec<ErrorConditionMatcher>,
}

impl WwwAuthenticateErrorHandler {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let config: Config = decode_config("www authenticate error handler", config)?;

        if config.when.is_empty() {
            return Err(PipelineError::configuration(
                "no 'when' error handler conditions defined",
            ));
        }

        Ok(Self {
            id: id.to_string(),
            realm: config.realm.unwrap_or_else(|| DEFAULT_REALM.to_string()),
            when: config.when,
        })
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn conditions(&self) -> &[ErrorConditionMatcher] {
        &self.when
    }
}

#[async_trait]
impl ErrorHandler for WwwAuthenticateErrorHandler {
    async fn execute(&self, ctx: &dyn Context, error: &PipelineError) -> Result<bool> {
        if !self.when.iter().any(|matcher| matcher.matches(ctx, error)) {
            return Ok(false);
        }

        debug!(handler = %self.id, "handling error using www authenticate error handler");

        ctx.add_header_for_upstream("WWW-Authenticate", &format!("Basic realm={}", self.realm));
        ctx.set_pipeline_error(error.clone());

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
            realm: Option<String>,
            #[serde(default)]
            when: Option<Vec<ErrorConditionMatcher>>,
        }

        let overrides: OverrideConfig = decode_config("www authenticate error handler", config)?;

        Ok(Arc::new(Self {
            id: self.id.clone(),
            realm: overrides.realm.unwrap_or_else(|| self.realm.clone()),
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
    if handler_type != "www_authenticate" {
        return Ok(None);
    }
    Ok(Some(Arc::new(WwwAuthenticateErrorHandler::new(id, config)?)))
}
