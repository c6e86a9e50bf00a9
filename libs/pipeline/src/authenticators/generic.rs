//! Authenticator resolving the subject via a generic identity endpoint.
//!
//! The extracted credential is re-injected into the outbound request at
//! the location it was found in, so session cookies, opaque tokens and
//! custom headers all work without per-scheme code.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::authenticators::SubjectInfo;
use crate::cache::get_as;
use crate::context::Context;
use crate::endpoint::{Endpoint, EndpointError};
use crate::error::{PipelineError, Result};
use crate::extractors::CompositeExtractStrategy;
use crate::handler::{is_empty_config, Authenticator, RawConfig};
use crate::registry::decode_config;
use crate::subject::Subject;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    identity_endpoint: Endpoint,
    auth_data_source: CompositeExtractStrategy,
    #[serde(default)]
    subject: Option<SubjectInfo>,
    #[serde(default, with = "humantime_serde")]
    cache_ttl: Option<Duration>,
    #[serde(default)]
    allow_fallback_on_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OverrideConfig {
    #[serde(default, with = "humantime_serde")]
    cache_ttl: Option<Duration>,
    #[serde(default)]
    allow_fallback_on_error: Option<bool>,
}

#[derive(Debug)]
pub struct GenericAuthenticator {
    id: String,
    endpoint: Endpoint,
    auth_data_source: CompositeExtractStrategy,
    subject_info: SubjectInfo,
    ttl: Option<Duration>,
    allow_fallback_on_error: bool,
}

impl GenericAuthenticator {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let config: Config = decode_config("generic authenticator", config)?;

        config.identity_endpoint.validate().map_err(|err| {
            PipelineError::configuration("failed to validate endpoint configuration")
                .caused_by(err)
        })?;

        Ok(Self {
            id: id.to_string(),
            endpoint: config.identity_endpoint,
            auth_data_source: config.auth_data_source,
            subject_info: config.subject.unwrap_or_default(),
            ttl: config.cache_ttl,
            allow_fallback_on_error: config.allow_fallback_on_error,
        })
    }

    fn is_cache_enabled(&self) -> bool {
        self.ttl.map(|ttl| !ttl.is_zero()).unwrap_or(false)
    }

    fn cache_key(&self, credential: &str) -> String {
        let mut digest = Sha256::new();
        digest.update(self.endpoint.hash().as_bytes());
        digest.update(credential.as_bytes());
        hex::encode(digest.finalize())
    }
}

#[async_trait]
impl Authenticator for GenericAuthenticator {
    async fn execute(&self, ctx: &dyn Context) -> Result<Subject> {
        debug!(handler = %self.id, "authenticating using generic authenticator");

        let auth_data = self.auth_data_source.get_auth_data(ctx).map_err(|err| {
            PipelineError::authentication("failed to get authentication data from the request")
                .with_handler_id(&self.id)
                .caused_by(err)
        })?;

        let cache = ctx.app_context().cache();
        let cache_key = self.cache_key(auth_data.value());

        let identity = match self
            .is_cache_enabled()
            .then(|| get_as::<Value>(cache, &cache_key))
            .flatten()
        {
            Some(cached) => {
                debug!(handler = %self.id, "reusing identity response from cache");
                (*cached).clone()
            }
            None => {
                let mut request = self
                    .endpoint
                    .create_request(
                        ctx.app_context(),
                        &self.endpoint.method_or("GET"),
                        None,
                        None,
                        None,
                    )
                    .await
                    .map_err(|err| {
                        PipelineError::internal("failed creating identity request")
                            .with_handler_id(&self.id)
                            .caused_by(err)
                    })?;
                auth_data.apply_to(&mut request);

                let response = self.endpoint.send(request).await.map_err(|err| {
                    let base = match &err {
                        EndpointError::Timeout(_) => PipelineError::communication_timeout(
                            "request to the identity endpoint timed out",
                        ),
                        _ => PipelineError::communication(
                            "request to the identity endpoint failed",
                        ),
                    };
                    base.with_handler_id(&self.id).caused_by(err)
                })?;

                match response.status().as_u16() {
                    code if (200..300).contains(&code) => {}
                    401 | 403 => {
                        return Err(PipelineError::authentication("authentication failed")
                            .with_handler_id(&self.id))
                    }
                    code => {
                        return Err(PipelineError::communication(format!(
                            "unexpected response code: {code}"
                        ))
                        .with_handler_id(&self.id))
                    }
                }

                let identity = response.json::<Value>().await.map_err(|err| {
                    PipelineError::internal("failed to decode the identity response")
                        .with_handler_id(&self.id)
                        .caused_by(err)
                })?;

                if let Some(ttl) = self.ttl.filter(|ttl| !ttl.is_zero()) {
                    cache.set(&cache_key, Arc::new(identity.clone()), ttl);
                }

                identity
            }
        };

        self.subject_info.create_subject(&identity).map_err(|err| {
            PipelineError::internal(
                "failed to extract subject information from the identity response",
            )
            .with_handler_id(&self.id)
            .caused_by(err)
        })
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Authenticator>> {
        if is_empty_config(config) {
            return Ok(self);
        }

        let overrides: OverrideConfig = decode_config("generic authenticator", config)?;

        Ok(Arc::new(Self {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            auth_data_source: self.auth_data_source.clone(),
            subject_info: self.subject_info.clone(),
            ttl: overrides.cache_ttl.or(self.ttl),
            allow_fallback_on_error: overrides
                .allow_fallback_on_error
                .unwrap_or(self.allow_fallback_on_error),
        }))
    }

    fn is_fallback_on_error_allowed(&self) -> bool {
        self.allow_fallback_on_error
    }

    fn handler_id(&self) -> &str {
        &self.id
    }
}

pub(crate) fn factory(
    id: &str,
    handler_type: &str,
    config: Option<&RawConfig>,
) -> Result<Option<Arc<dyn Authenticator>>> {
    if handler_type != "generic" {
        return Ok(None);
    }
    Ok(Some(Arc::new(GenericAuthenticator::new(id, config)?)))
}
