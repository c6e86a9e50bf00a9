//! Mutator rendering headers for the upstream request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::context::Context;
use crate::error::{PipelineError, Result};
use crate::handler::{is_empty_config, Mutator, RawConfig};
use crate::registry::decode_config;
use crate::subject::Subject;
use crate::template::Template;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    headers: HashMap<String, Template>,
}

#[derive(Debug)]
pub struct HeaderMutator {
    id: String,
    headers: HashMap<String, Template>,
}

impl HeaderMutator {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let config: Config = decode_config("header mutator", config)?;

        if config.headers.is_empty() {
            return Err(PipelineError::configuration("no header definitions provided"));
        }

        Ok(Self {
            id: id.to_string(),
            headers: config.headers,
        })
    }

    pub fn headers(&self) -> &HashMap<String, Template> {
        &self.headers
    }
}

#[async_trait]
impl Mutator for HeaderMutator {
    async fn execute(&self, ctx: &dyn Context, subject: Option<&Subject>) -> Result<()> {
        debug!(handler = %self.id, "mutating request using header mutator");

        let Some(subject) = subject else {
            return Err(PipelineError::internal(
                "failed to execute header mutator due to 'nil' subject",
            )
            .with_handler_id(&self.id));
        };

        for (name, template) in &self.headers {
            let value = template.render(Some(subject), None).map_err(|err| {
                PipelineError::internal(format!("failed to render value for the '{name}' header"))
                    .with_handler_id(&self.id)
                    .caused_by(err)
            })?;
            ctx.add_header_for_upstream(name, &value);
        }

        Ok(())
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Mutator>> {
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
) -> Result<Option<Arc<dyn Mutator>>> {
    if handler_type != "header" {
        return Ok(None);
    }
    Ok(Some(Arc::new(HeaderMutator::new(id, config)?)))
}
