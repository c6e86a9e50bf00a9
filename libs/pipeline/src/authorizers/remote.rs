//! Authorizer delegating the decision to a remote HTTP endpoint.
//!
//! The decision point receives request context via a rendered body payload
//! and/or rendered endpoint headers. Its verdict is encoded in the response
//! status: 2xx allows, 401/403 denies, anything else is a communication
//! failure. Response headers can be forwarded to the upstream request and a
//! non-empty response payload decorates the subject under the authorizer's
//! id. Decisions are cacheable, keyed by a fingerprint of the rendered
//! request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::get_as;
use crate::context::Context;
use crate::endpoint::{Endpoint, EndpointError};
use crate::error::{PipelineError, Result};
use crate::handler::{is_empty_config, Authorizer, RawConfig};
use crate::registry::decode_config;
use crate::script::{Script, ScriptError};
use crate::subject::Subject;
use crate::template::Template;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    endpoint: Endpoint,
    #[serde(default)]
    payload: Option<Template>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    forward_response_headers_to_upstream: Vec<String>,
    #[serde(default, with = "humantime_serde")]
    cache_ttl: Option<Duration>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OverrideConfig {
    #[serde(default)]
    payload: Option<Template>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    forward_response_headers_to_upstream: Option<Vec<String>>,
    #[serde(default, with = "humantime_serde")]
    cache_ttl: Option<Duration>,
}

/// The cached outcome of a remote authorization call.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationRecord {
    pub headers: HashMap<String, Vec<String>>,
    pub payload: Option<Value>,
}

#[derive(Debug)]
pub struct RemoteAuthorizer {
    id: String,
    endpoint: Endpoint,
    payload: Option<Template>,
    script: Option<Script>,
    headers_for_upstream: Vec<String>,
    ttl: Option<Duration>,
}

impl RemoteAuthorizer {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let config: Config = decode_config("remote authorizer", config)?;

        config.endpoint.validate().map_err(|err| {
            PipelineError::configuration("failed to validate endpoint configuration")
                .caused_by(err)
        })?;

        if config.payload.is_none() && config.endpoint.headers.is_empty() {
            return Err(PipelineError::configuration(
                "either a payload or at least one endpoint header must be configured",
            ));
        }

        let script = compile_script(config.script.as_deref())?;

        Ok(Self {
            id: id.to_string(),
            endpoint: config.endpoint,
            payload: config.payload,
            script,
            headers_for_upstream: config.forward_response_headers_to_upstream,
            ttl: config.cache_ttl,
        })
    }

    pub fn payload(&self) -> Option<&Template> {
        self.payload.as_ref()
    }

    pub fn script(&self) -> Option<&Script> {
        self.script.as_ref()
    }

    pub fn headers_for_upstream(&self) -> &[String] {
        &self.headers_for_upstream
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.ttl
    }

    fn is_cache_enabled(&self) -> bool {
        self.ttl.map(|ttl| !ttl.is_zero()).unwrap_or(false)
    }

    /// Fingerprint of the rendered request: endpoint identity plus the
    /// rendered headers and payload.
    fn cache_key(
        &self,
        rendered_headers: &[(String, String)],
        rendered_payload: Option<&str>,
    ) -> String {
        let mut digest = Sha256::new();
        digest.update(self.endpoint.hash().as_bytes());
        for (name, value) in rendered_headers {
            digest.update(name.as_bytes());
            digest.update(b"=");
            digest.update(value.as_bytes());
        }
        digest.update(rendered_payload.unwrap_or_default().as_bytes());
        hex::encode(digest.finalize())
    }

    async fn call_endpoint(
        &self,
        ctx: &dyn Context,
        subject: &Subject,
        rendered_payload: Option<String>,
    ) -> Result<AuthorizationRecord> {
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
                PipelineError::internal("failed creating authorization request")
                    .with_handler_id(&self.id)
                    .caused_by(err)
            })?;

        let response = self.endpoint.send(request).await.map_err(|err| {
            let base = match &err {
                EndpointError::Timeout(_) => PipelineError::communication_timeout(
                    "request to the authorization endpoint timed out",
                ),
                _ => PipelineError::communication(
                    "request to the authorization endpoint failed",
                ),
            };
            base.with_handler_id(&self.id).caused_by(err)
        })?;

        match response.status().as_u16() {
            code if (200..300).contains(&code) => {}
            401 | 403 => {
                return Err(PipelineError::authorization("authorization failed")
                    .with_handler_id(&self.id))
            }
            code => {
                return Err(PipelineError::communication(format!(
                    "unexpected response code: {code}"
                ))
                .with_handler_id(&self.id))
            }
        }

        let headers: HashMap<String, Vec<String>> = response
            .headers()
            .keys()
            .map(|name| {
                let values = response
                    .headers()
                    .get_all(name)
                    .iter()
                    .filter_map(|value| value.to_str().ok().map(|v| v.to_string()))
                    .collect();
                (name.as_str().to_string(), values)
            })
            .collect();

        let content_type = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .and_then(|(_, values)| values.first().cloned())
            .unwrap_or_default();

        let body = response.bytes().await.map_err(|err| {
            PipelineError::internal("failed to read the authorization response")
                .with_handler_id(&self.id)
                .caused_by(err)
        })?;

        let payload = decode_payload(&content_type, &body).map_err(|err| {
            err.with_handler_id(&self.id)
        })?;

        Ok(AuthorizationRecord { headers, payload })
    }

    fn run_post_script(&self, ctx: &dyn Context, payload: Option<&Value>) -> Result<()> {
        let Some(script) = &self.script else {
            return Ok(());
        };

        match script.evaluate_on_payload(ctx, payload.unwrap_or(&Value::Null)) {
            Ok(result) if result.as_bool() == Ok(false) => Err(PipelineError::authorization(
                "script returned false",
            )
            .with_handler_id(&self.id)),
            Ok(_) => Ok(()),
            Err(ScriptError::Thrown(reason)) => {
                Err(PipelineError::authorization(reason).with_handler_id(&self.id))
            }
            Err(err) => Err(PipelineError::authorization(err.to_string())
                .with_handler_id(&self.id)),
        }
    }
}

#[async_trait]
impl Authorizer for RemoteAuthorizer {
    async fn execute(&self, ctx: &dyn Context, subject: Option<&mut Subject>) -> Result<()> {
        debug!(handler = %self.id, "authorizing using remote authorizer");

        let Some(subject) = subject else {
            return Err(PipelineError::internal(
                "failed to execute remote authorizer due to 'nil' subject",
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
        let rendered_headers = self
            .endpoint
            .render_headers(Some(subject), None)
            .map_err(|err| {
                PipelineError::internal("failed to render the endpoint headers")
                    .with_handler_id(&self.id)
                    .caused_by(err)
            })?;

        let cache = ctx.app_context().cache();
        let cache_key = self.cache_key(&rendered_headers, rendered_payload.as_deref());

        let cached = self
            .is_cache_enabled()
            .then(|| get_as::<AuthorizationRecord>(cache, &cache_key))
            .flatten();
        let from_cache = cached.is_some();

        let record = match cached {
            Some(record) => {
                debug!(handler = %self.id, "reusing authorization decision from cache");
                (*record).clone()
            }
            None => self.call_endpoint(ctx, subject, rendered_payload).await?,
        };

        for name in &self.headers_for_upstream {
            let values = record
                .headers
                .iter()
                .find(|(header, _)| header.eq_ignore_ascii_case(name))
                .map(|(_, values)| values.as_slice())
                .unwrap_or_default();
            for value in values {
                ctx.add_header_for_upstream(name, value);
            }
        }

        if let Some(payload) = record.payload.as_ref().filter(|value| !is_empty(value)) {
            subject.attributes.insert(self.id.clone(), payload.clone());
        }

        self.run_post_script(ctx, record.payload.as_ref())?;

        if self.is_cache_enabled() && !from_cache {
            cache.set(
                &cache_key,
                Arc::new(record),
                self.ttl.expect("cache enabled implies a ttl"),
            );
        }

        Ok(())
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Authorizer>> {
        if is_empty_config(config) {
            return Ok(self);
        }

        let overrides: OverrideConfig = decode_config("remote authorizer", config)?;

        let payload = match overrides.payload {
            Some(template) if !template.source().is_empty() => Some(template),
            _ => self.payload.clone(),
        };
        let script = match overrides.script.as_deref() {
            Some(source) if !source.is_empty() => compile_script(Some(source))?,
            _ => self.script.clone(),
        };

        Ok(Arc::new(Self {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            payload,
            script,
            headers_for_upstream: overrides
                .forward_response_headers_to_upstream
                .unwrap_or_else(|| self.headers_for_upstream.clone()),
            ttl: overrides.cache_ttl.or(self.ttl),
        }))
    }

    fn handler_id(&self) -> &str {
        &self.id
    }
}

fn compile_script(source: Option<&str>) -> Result<Option<Script>> {
    match source {
        Some(source) if !source.is_empty() => Script::new(source)
            .map(Some)
            .map_err(|err| {
                PipelineError::configuration("failed to compile the authorization script")
                    .caused_by(err)
            }),
        _ => Ok(None),
    }
}

fn decode_payload(content_type: &str, body: &[u8]) -> Result<Option<Value>> {
    if body.is_empty() {
        return Ok(None);
    }

    let payload = if content_type.starts_with("application/json") {
        serde_json::from_slice(body).map_err(|err| {
            PipelineError::internal("failed to decode the authorization response")
                .caused_by(err)
        })?
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let mut decoded = Map::new();
        for (key, value) in url::form_urlencoded::parse(body) {
            decoded.insert(key.into_owned(), Value::String(value.into_owned()));
        }
        Value::Object(decoded)
    } else {
        Value::String(String::from_utf8_lossy(body).into_owned())
    };

    Ok(Some(payload))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

pub(crate) fn factory(
    id: &str,
    handler_type: &str,
    config: Option<&RawConfig>,
) -> Result<Option<Arc<dyn Authorizer>>> {
    if handler_type != "remote" {
        return Ok(None);
    }
    Ok(Some(Arc::new(RemoteAuthorizer::new(id, config)?)))
}
