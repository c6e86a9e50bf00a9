//! Script based in-process authorizer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::context::Context;
use crate::error::{PipelineError, Result};
use crate::handler::{is_empty_config, Authorizer, RawConfig};
use crate::registry::decode_config;
use crate::script::{Script, ScriptError};
use crate::subject::Subject;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    script: Option<String>,
}

#[derive(Debug)]
pub struct LocalAuthorizer {
    id: String,
    script: Script,
}

impl LocalAuthorizer {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let config: Config = decode_config("local authorizer", config)?;

        let source = match config.script {
            Some(source) if !source.is_empty() => source,
            _ => return Err(PipelineError::configuration("no script provided")),
        };

        let script = Script::new(source).map_err(|err| {
            PipelineError::configuration("failed to compile the authorization script")
                .caused_by(err)
        })?;

        Ok(Self {
            id: id.to_string(),
            script,
        })
    }

    pub fn script(&self) -> &Script {
        &self.script
    }
}

#[async_trait]
impl Authorizer for LocalAuthorizer {
    async fn execute(&self, ctx: &dyn Context, subject: Option<&mut Subject>) -> Result<()> {
        debug!(handler = %self.id, "authorizing using local authorizer");

        let Some(subject) = subject else {
            return Err(PipelineError::internal(
                "failed to execute local authorizer due to 'nil' subject",
            )
            .with_handler_id(&self.id));
        };

        match self.script.evaluate(ctx, subject) {
            Ok((result, decorated)) => {
                if result.as_bool() == Ok(false) {
                    return Err(PipelineError::authorization("script returned false")
                        .with_handler_id(&self.id));
                }
                *subject = decorated;
                Ok(())
            }
            Err(ScriptError::Thrown(reason)) => {
                Err(PipelineError::authorization(reason).with_handler_id(&self.id))
            }
            Err(err) => Err(PipelineError::authorization(err.to_string())
                .with_handler_id(&self.id)),
        }
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Authorizer>> {
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
) -> Result<Option<Arc<dyn Authorizer>>> {
    if handler_type != "local" {
        return Ok(None);
    }
    Ok(Some(Arc::new(LocalAuthorizer::new(id, config)?)))
}
