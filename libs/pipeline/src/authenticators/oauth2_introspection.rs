//! OAuth2 token introspection authenticator (RFC 7662).
//!
//! Sends the extracted access token to the configured introspection
//! endpoint and builds the subject from the introspection response. The
//! response is cacheable; the effective TTL never outlives the token's
//! `exp`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::authenticators::SubjectInfo;
use crate::cache::get_as;
use crate::context::Context;
use crate::endpoint::{Endpoint, EndpointError};
use crate::error::{PipelineError, Result};
use crate::extractors::{default_auth_data_source, CompositeExtractStrategy};
use crate::handler::{is_empty_config, Authenticator, RawConfig};
use crate::oauth2::{Claims, Expectation};
use crate::registry::decode_config;
use crate::subject::Subject;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    introspection_endpoint: Endpoint,
    #[serde(default)]
    assertions: Expectation,
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
    #[serde(default)]
    assertions: Option<Expectation>,
    #[serde(default, with = "humantime_serde")]
    cache_ttl: Option<Duration>,
    #[serde(default)]
    allow_fallback_on_error: Option<bool>,
}

#[derive(Debug)]
pub struct OAuth2IntrospectionAuthenticator {
    id: String,
    endpoint: Endpoint,
    assertions: Expectation,
    ttl: Option<Duration>,
    subject_info: SubjectInfo,
    auth_data_source: CompositeExtractStrategy,
    allow_fallback_on_error: bool,
}

impl OAuth2IntrospectionAuthenticator {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let mut config: Config = decode_config("oauth2 introspection authenticator", config)?;

        config.introspection_endpoint.validate().map_err(|err| {
            PipelineError::configuration("failed to validate endpoint configuration")
                .caused_by(err)
        })?;

        if config.assertions.trusted_issuers.is_empty() {
            return Err(PipelineError::configuration("no trusted issuers configured"));
        }

        let headers = &mut config.introspection_endpoint.headers;
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "application/x-www-form-urlencoded".to_string());
        headers
            .entry("Accept-Type".to_string())
            .or_insert_with(|| "application/json".to_string());
        if config.introspection_endpoint.method.is_none() {
            config.introspection_endpoint.method = Some("POST".to_string());
        }

        Ok(Self {
            id: id.to_string(),
            endpoint: config.introspection_endpoint,
            assertions: config.assertions,
            ttl: config.cache_ttl,
            subject_info: config.subject.unwrap_or_default(),
            auth_data_source: default_auth_data_source(),
            allow_fallback_on_error: config.allow_fallback_on_error,
        })
    }

    fn is_cache_enabled(&self) -> bool {
        self.ttl.map(|ttl| !ttl.is_zero()).unwrap_or(false)
    }

    fn cache_key(&self, token: &str) -> String {
        let mut digest = Sha256::new();
        digest.update(self.endpoint.hash().as_bytes());
        digest.update(token.as_bytes());
        hex::encode(digest.finalize())
    }

    /// The configured TTL, shortened so a cached response never outlives
    /// the token itself.
    fn cache_ttl_for(&self, claims: &Claims) -> Option<Duration> {
        let configured = self.ttl.filter(|ttl| !ttl.is_zero())?;
        match claims.exp {
            None => Some(configured),
            Some(exp) => {
                let remaining = exp - Utc::now().timestamp() - self.assertions.leeway_secs();
                if remaining <= 0 {
                    None
                } else {
                    Some(configured.min(Duration::from_secs(remaining as u64)))
                }
            }
        }
    }

    async fn introspect(&self, ctx: &dyn Context, token: &str) -> Result<Value> {
        debug!(handler = %self.id, "introspecting access token");

        let body = format!(
            "token={}&token_type_hint=access_token",
            urlencoding::encode(token)
        );
        let request = self
            .endpoint
            .create_request(
                ctx.app_context(),
                &self.endpoint.method_or("POST"),
                Some(body),
                None,
                None,
            )
            .await
            .map_err(|err| {
                PipelineError::internal("failed creating introspection request")
                    .with_handler_id(&self.id)
                    .caused_by(err)
            })?;

        let response = self.endpoint.send(request).await.map_err(|err| {
            let base = match &err {
                EndpointError::Timeout(_) => PipelineError::communication_timeout(
                    "request to the introspection endpoint timed out",
                ),
                _ => PipelineError::communication(
                    "request to the introspection endpoint failed",
                ),
            };
            base.with_handler_id(&self.id).caused_by(err)
        })?;

        if !response.status().is_success() {
            return Err(PipelineError::communication(format!(
                "unexpected response code: {}",
                response.status().as_u16()
            ))
            .with_handler_id(&self.id));
        }

        response.json::<Value>().await.map_err(|err| {
            PipelineError::internal("failed to decode the introspection response")
                .with_handler_id(&self.id)
                .caused_by(err)
        })
    }
}

#[async_trait]
impl Authenticator for OAuth2IntrospectionAuthenticator {
    async fn execute(&self, ctx: &dyn Context) -> Result<Subject> {
        debug!(handler = %self.id, "authenticating using OAuth2 introspection authenticator");

        let auth_data = self.auth_data_source.get_auth_data(ctx).map_err(|err| {
            PipelineError::authentication("no access token present")
                .with_handler_id(&self.id)
                .caused_by(err)
        })?;
        let token = auth_data.value().to_string();

        let cache = ctx.app_context().cache();
        let cache_key = self.cache_key(&token);

        let introspection = match self
            .is_cache_enabled()
            .then(|| get_as::<Value>(cache, &cache_key))
            .flatten()
        {
            Some(cached) => {
                debug!(handler = %self.id, "reusing introspection response from cache");
                (*cached).clone()
            }
            None => {
                let response = self.introspect(ctx, &token).await?;

                if response.get("active").and_then(Value::as_bool) != Some(true) {
                    return Err(PipelineError::authentication("access token is not active")
                        .with_handler_id(&self.id));
                }

                let claims: Claims =
                    serde_json::from_value(response.clone()).map_err(|err| {
                        PipelineError::internal("failed to parse introspection claims")
                            .with_handler_id(&self.id)
                            .caused_by(err)
                    })?;

                self.assertions.assert_claims(&claims).map_err(|err| {
                    PipelineError::authentication(
                        "access token does not satisfy assertion conditions",
                    )
                    .with_handler_id(&self.id)
                    .caused_by(err)
                })?;

                if let Some(ttl) = self.cache_ttl_for(&claims) {
                    cache.set(&cache_key, Arc::new(response.clone()), ttl);
                }

                response
            }
        };

        self.subject_info.create_subject(&introspection).map_err(|err| {
            PipelineError::internal(
                "failed to extract subject information from the introspection response",
            )
            .with_handler_id(&self.id)
            .caused_by(err)
        })
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Authenticator>> {
        if is_empty_config(config) {
            return Ok(self);
        }

        let overrides: OverrideConfig =
            decode_config("oauth2 introspection authenticator", config)?;

        Ok(Arc::new(Self {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            assertions: match &overrides.assertions {
                Some(assertions) => self.assertions.merged_with(assertions),
                None => self.assertions.clone(),
            },
            ttl: overrides.cache_ttl.or(self.ttl),
            subject_info: self.subject_info.clone(),
            auth_data_source: self.auth_data_source.clone(),
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
    if handler_type != "oauth2_introspection" {
        return Ok(None);
    }
    Ok(Some(Arc::new(OAuth2IntrospectionAuthenticator::new(
        id, config,
    )?)))
}
