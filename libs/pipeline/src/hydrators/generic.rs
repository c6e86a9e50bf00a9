//! Hydrator fetching additional subject data from an HTTP endpoint.
//!
//! The response payload is attached to the subject's attributes under the
//! hydrator's id, making it visible to downstream authorizers and
//! mutators. Lookups are cacheable like remote authorization decisions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::get_as;
use crate::context::Context;
use crate::endpoint::{Endpoint, EndpointError};
use crate::error::{PipelineError, Result};
use crate::handler::{is_empty_config, Hydrator, RawConfig};
use crate::registry::decode_config;
use crate::subject::Subject;
use crate::template::Template;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    endpoint: Endpoint,
    #[serde(default)]
    payload: Option<Template>,
    #[serde(default, with = "humantime_serde")]
    cache_ttl: Option<Duration>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OverrideConfig {
    #[serde(default)]
    payload: Option<Template>,
    #[serde(default, with = "humantime_serde")]
    cache_ttl: Option<Duration>,
}

#[derive(Debug)]
pub struct GenericHydrator {
    id: String,
    endpoint: Endpoint,
    payload: Option<Template>,
    ttl: Option<Duration>,
}

impl GenericHydrator {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let config: Config = decode_config("generic hydrator", config)?;

        config.endpoint.validate().map_err(|err| {
            PipelineError::configuration("failed to validate endpoint configuration")
                .caused_by(err)
        })?;

        Ok(Self {
            id: id.to_string(),
            endpoint: config.endpoint,
            payload: config.payload,
            ttl: config.cache_ttl,
        })
    }

    fn is_cache_enabled(&self) -> bool {
        self.ttl.map(|ttl| !ttl.is_zero()).unwrap_or(false)
    }

    fn cache_key(&self, rendered_payload: Option<&str>, subject: &Subject) -> String {
        let mut digest = Sha256::new();
        digest.update(self.endpoint.hash().as_bytes());
        digest.update(subject.id.as_bytes());
        digest.update(rendered_payload.unwrap_or_default().as_bytes());
        hex::encode(digest.finalize())
    }

    async fn fetch(
        &self,
        ctx: &dyn Context,
        subject: &Subject,
        rendered_payload: Option<String>,
    ) -> Result<Value> {
        let method = if rendered_payload.is_some() {
            "POST".to_string()
        } else {
            self.endpoint.method_or("GET")
        };

        let request = self
            .endpoint
            .create_request(
                ctx.app_context(),
                &method,
                rendered_payload,
                Some(subject),
                None,
            )
            .await
            .map_err(|err| {
                PipelineError::internal("failed creating hydration request")
                    .with_handler_id(&self.id)
                    .caused_by(err)
            })?;

        let response = self.endpoint.send(request).await.map_err(|err| {
            let base = match &err {
                EndpointError::Timeout(_) => PipelineError::communication_timeout(
                    "request to the hydration endpoint timed out",
                ),
                _ => {
                    PipelineError::communication("request to the hydration endpoint failed")
                }
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
            PipelineError::internal("failed to decode the hydration response")
                .with_handler_id(&self.id)
                .caused_by(err)
        })
    }
}

#[async_trait]
impl Hydrator for GenericHydrator {
    async fn execute(&self, ctx: &dyn Context, subject: Option<&mut Subject>) -> Result<()> {
        debug!(handler = %self.id, "hydrating subject using generic hydrator");

        let Some(subject) = subject else {
            return Err(PipelineError::internal(
                "failed to execute generic hydrator due to 'nil' subject",
            )
            .with_handler_id(&self.id));
        };

        let rendered_payload = self
            .payload
            .as_ref()
            .map(|template| template.render(Some(subject), None))
            .transpose()
            .map_err(|err| {
                PipelineError::internal("failed to render the payload")
                    .with_handler_id(&self.id)
                    .caused_by(err)
            })?;

        let cache = ctx.app_context().cache();
        let cache_key = self.cache_key(rendered_payload.as_deref(), subject);

        let cached = self
            .is_cache_enabled()
            .then(|| get_as::<Value>(cache, &cache_key))
            .flatten();
        let from_cache = cached.is_some();

        let payload = match cached {
            Some(payload) => {
                debug!(handler = %self.id, "reusing hydration response from cache");
                (*payload).clone()
            }
            None => self.fetch(ctx, subject, rendered_payload).await?,
        };

        if !payload.is_null() {
            subject.attributes.insert(self.id.clone(), payload.clone());
        }

        if self.is_cache_enabled() && !from_cache {
            cache.set(
                &cache_key,
                Arc::new(payload),
                self.ttl.expect("cache enabled implies a ttl"),
            );
        }

        Ok(())
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Hydrator>> {
        if is_empty_config(config) {
            return Ok(self);
        }

        let overrides: OverrideConfig = decode_config("generic hydrator", config)?;

        Ok(Arc::new(Self {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            payload: overrides.payload.or_else(|| self.payload.clone()),
            ttl: overrides.cache_ttl.or(self.ttl),
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
) -> Result<Option<Arc<dyn Hydrator>>> {
    if handler_type != "generic" {
        return Ok(None);
    }
    Ok(Some(Arc::new(GenericHydrator::new(id, config)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::context::{AppContext, MockContext};
    use crate::error::ErrorKind;
    use serde_json::json;
    use wiremock::matchers::{body_string, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn raw(value: serde_json::Value) -> RawConfig {
        value.as_object().unwrap().clone()
    }

    fn context(cache: Arc<InMemoryCache>) -> MockContext {
        let mut ctx = MockContext::new();
        ctx.expect_app_context().return_const(AppContext::new(cache));
        ctx
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let err = GenericHydrator::new(
            "hydr",
            Some(&raw(json!({"endpoint": {"url": "http://foo.bar"}, "foo": "bar"}))),
        )
        .unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
        assert!(err.to_string().contains("failed to decode"));
    }

    #[tokio::test]
    async fn response_decorates_the_subject_under_the_hydrator_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string("user=my-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "groups": ["admin"],
            })))
            .mount(&server)
            .await;

        let hydrator = GenericHydrator::new(
            "profile",
            Some(&raw(json!({
                "endpoint": {"url": server.uri()},
                "payload": "user={{ Subject.ID }}",
            }))),
        )
        .unwrap();

        let mut subject = Subject::new("my-id");
        hydrator
            .execute(&context(Arc::new(InMemoryCache::new())), Some(&mut subject))
            .await
            .unwrap();

        assert_eq!(subject.attributes["profile"], json!({"groups": ["admin"]}));
    }

    #[tokio::test]
    async fn lookups_are_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"groups": []})))
            .expect(1)
            .mount(&server)
            .await;

        let hydrator = GenericHydrator::new(
            "profile",
            Some(&raw(json!({
                "endpoint": {"url": server.uri()},
                "cache_ttl": "1m",
            }))),
        )
        .unwrap();

        let cache = Arc::new(InMemoryCache::new());
        let mut subject = Subject::new("my-id");
        hydrator
            .execute(&context(cache.clone()), Some(&mut subject))
            .await
            .unwrap();
        hydrator
            .execute(&context(cache), Some(&mut subject))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upstream_failure_is_a_communication_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let hydrator = GenericHydrator::new(
            "profile",
            Some(&raw(json!({"endpoint": {"url": server.uri()}}))),
        )
        .unwrap();

        let mut subject = Subject::new("my-id");
        let err = hydrator
            .execute(&context(Arc::new(InMemoryCache::new())), Some(&mut subject))
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::Communication));
        assert_eq!(err.handler_id(), Some("profile"));
    }

    #[tokio::test]
    async fn missing_subject_is_an_internal_error() {
        let hydrator = GenericHydrator::new(
            "profile",
            Some(&raw(json!({"endpoint": {"url": "http://foo.bar"}}))),
        )
        .unwrap();

        let err = hydrator
            .execute(&context(Arc::new(InMemoryCache::new())), None)
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::Internal));
    }
}
