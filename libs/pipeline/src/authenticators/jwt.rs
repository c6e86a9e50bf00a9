//! JWKS-backed JWT authenticator.
//!
//! Verifies a signed JWT against the keys published at a JWKS endpoint.
//! Keys referenced by `kid` are cached with a TTL derived from both the
//! configured `cache_ttl` and the lifetime of the certificate attached to
//! the key, whichever ends first.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::authenticators::SubjectInfo;
use crate::cache::get_as;
use crate::context::Context;
use crate::endpoint::{Endpoint, EndpointError};
use crate::error::{ErrorKind, PipelineError, Result};
use crate::extractors::{default_auth_data_source, CompositeExtractStrategy};
use crate::handler::{is_empty_config, Authenticator, RawConfig};
use crate::oauth2::{Claims, Expectation};
use crate::registry::decode_config;
use crate::subject::Subject;
use crate::truststore::{self, TrustStore};

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Lifetime margin ensuring a certificate backed key is still valid when
/// served from cache, in seconds.
const CERT_TTL_LEEWAY_SECS: i64 = 10;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    jwks_endpoint: Endpoint,
    #[serde(default)]
    jwt_source: Option<CompositeExtractStrategy>,
    #[serde(default)]
    assertions: Expectation,
    #[serde(default)]
    subject: Option<SubjectInfo>,
    #[serde(default, with = "humantime_serde")]
    cache_ttl: Option<Duration>,
    #[serde(default)]
    allow_fallback_on_error: bool,
    #[serde(default)]
    validate_jwk: Option<bool>,
    #[serde(default)]
    trust_store: Option<std::path::PathBuf>,
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
pub struct JwtAuthenticator {
    id: String,
    endpoint: Endpoint,
    assertions: Expectation,
    ttl: Option<Duration>,
    subject_info: SubjectInfo,
    auth_data_source: CompositeExtractStrategy,
    allow_fallback_on_error: bool,
    validate_jwk: bool,
    trust_store: TrustStore,
}

impl JwtAuthenticator {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let mut config: Config = decode_config("jwt authenticator", config)?;

        config.jwks_endpoint.validate().map_err(|err| {
            PipelineError::configuration("failed to validate endpoint configuration")
                .caused_by(err)
        })?;

        if config.assertions.trusted_issuers.is_empty() {
            return Err(PipelineError::configuration("no trusted issuers configured"));
        }

        config
            .jwks_endpoint
            .headers
            .entry("Accept-Type".to_string())
            .or_insert_with(|| "application/json".to_string());
        if config.jwks_endpoint.method.is_none() {
            config.jwks_endpoint.method = Some("GET".to_string());
        }

        let trust_store = match &config.trust_store {
            Some(path) => TrustStore::from_pem_file(path).map_err(|err| {
                PipelineError::configuration("failed to load trust store").caused_by(err)
            })?,
            None => TrustStore::default(),
        };

        Ok(Self {
            id: id.to_string(),
            endpoint: config.jwks_endpoint,
            assertions: config.assertions,
            ttl: config.cache_ttl,
            subject_info: config.subject.unwrap_or_default(),
            auth_data_source: config.jwt_source.unwrap_or_else(default_auth_data_source),
            allow_fallback_on_error: config.allow_fallback_on_error,
            validate_jwk: config.validate_jwk.unwrap_or(true),
            trust_store,
        })
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn assertions(&self) -> &Expectation {
        &self.assertions
    }

    fn is_cache_enabled(&self) -> bool {
        match self.ttl {
            None => true,
            Some(ttl) => !ttl.is_zero(),
        }
    }

    fn cache_key(&self, kid: &str) -> String {
        let mut digest = Sha256::new();
        digest.update(self.endpoint.hash().as_bytes());
        digest.update(kid.as_bytes());
        hex::encode(digest.finalize())
    }

    async fn get_key(&self, ctx: &dyn Context, kid: &str) -> Result<Jwk> {
        let cache = ctx.app_context().cache();
        let cache_key = self.cache_key(kid);

        if self.is_cache_enabled() {
            if let Some(jwk) = get_as::<Jwk>(cache, &cache_key) {
                debug!(handler = %self.id, kid, "reusing JWK from cache");
                return Ok((*jwk).clone());
            }
        }

        let jwks = self.fetch_jwks(ctx).await?;

        let matching: Vec<&Jwk> = jwks
            .keys
            .iter()
            .filter(|key| key.common.key_id.as_deref() == Some(kid))
            .collect();
        if matching.len() != 1 {
            return Err(PipelineError::authentication(format!(
                "no (unique) key found for the key id '{kid}' referenced in the JWT"
            ))
            .with_handler_id(&self.id));
        }

        let jwk = matching[0].clone();
        self.validate_key(&jwk).map_err(|err| {
            PipelineError::authentication(format!("JWK for key id '{kid}' is invalid"))
                .with_handler_id(&self.id)
                .caused_by(err)
        })?;

        if self.is_cache_enabled() {
            let not_after = jwk
                .common
                .x509_chain
                .as_deref()
                .and_then(truststore::leaf_not_after);
            if let Some(ttl) = effective_cache_ttl(self.ttl, not_after, Utc::now().timestamp()) {
                cache.set(&cache_key, Arc::new(jwk.clone()), ttl);
            }
        }

        Ok(jwk)
    }

    async fn fetch_jwks(&self, ctx: &dyn Context) -> Result<JwkSet> {
        debug!(handler = %self.id, "retrieving JWKS from the configured endpoint");

        let request = self
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
                PipelineError::internal("failed creating JWKS request")
                    .with_handler_id(&self.id)
                    .caused_by(err)
            })?;

        let response = self.endpoint.send(request).await.map_err(|err| {
            let base = match &err {
                EndpointError::Timeout(_) => PipelineError::communication_timeout(
                    "request to the JWKS endpoint timed out",
                ),
                _ => PipelineError::communication("request to the JWKS endpoint failed"),
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

        response.json::<JwkSet>().await.map_err(|err| {
            PipelineError::internal("failed to decode the received JWKS")
                .with_handler_id(&self.id)
                .caused_by(err)
        })
    }

    fn validate_key(&self, jwk: &Jwk) -> std::result::Result<(), truststore::TrustStoreError> {
        let chain = jwk.common.x509_chain.as_deref().unwrap_or(&[]);
        if !self.validate_jwk || chain.is_empty() {
            return Ok(());
        }
        truststore::validate_certificate_chain(chain, &self.trust_store)
    }

    fn verify_token(&self, token: &str, header: &Header, jwk: &Jwk) -> Result<Value> {
        // the key, never the token, decides the verification algorithm; a
        // key without one is unusable
        let header_alg = format!("{:?}", header.alg);
        let algorithm_name = match jwk.common.key_algorithm {
            Some(algorithm) => format!("{algorithm:?}"),
            None => {
                return Err(PipelineError::authentication(
                    "algorithm in the JWT header does not match the algorithm referenced in the key",
                )
                .with_handler_id(&self.id))
            }
        };

        if algorithm_name != header_alg {
            return Err(PipelineError::authentication(
                "algorithm in the JWT header does not match the algorithm referenced in the key",
            )
            .with_handler_id(&self.id));
        }
        self.assertions
            .assert_algorithm(&algorithm_name)
            .map_err(|err| {
                PipelineError::authentication(format!(
                    "{algorithm_name} algorithm is not allowed"
                ))
                .with_handler_id(&self.id)
                .caused_by(err)
            })?;

        let algorithm = Algorithm::from_str(&algorithm_name).map_err(|err| {
            PipelineError::authentication(format!("unsupported algorithm '{algorithm_name}'"))
                .with_handler_id(&self.id)
                .caused_by(err)
        })?;

        let decoding_key = DecodingKey::from_jwk(jwk).map_err(|err| {
            PipelineError::internal("failed to build a verification key from the JWK")
                .with_handler_id(&self.id)
                .caused_by(err)
        })?;

        // assertions are checked separately below with the configured leeway
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let verified = decode::<Value>(token, &decoding_key, &validation).map_err(|err| {
            PipelineError::authentication("failed to verify JWT signature")
                .with_handler_id(&self.id)
                .caused_by(err)
        })?;

        let claims: Claims = serde_json::from_value(verified.claims.clone()).map_err(|err| {
            PipelineError::internal("failed to parse JWT claims")
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

        Ok(verified.claims)
    }

    async fn verify_token_without_kid(
        &self,
        ctx: &dyn Context,
        token: &str,
        header: &Header,
    ) -> Result<Value> {
        info!(handler = %self.id, "no kid present in the JWT");

        let jwks = self.fetch_jwks(ctx).await?;

        for jwk in &jwks.keys {
            if let Err(err) = self.validate_key(jwk) {
                info!(handler = %self.id, error = %err, "skipping invalid JWK");
                continue;
            }

            match self.verify_token(token, header, jwk) {
                Ok(claims) => return Ok(claims),
                Err(err) => {
                    info!(handler = %self.id, error = %err, "failed to verify JWT with key");
                }
            }
        }

        Err(PipelineError::authentication(
            "none of the keys received from the JWKS endpoint could be used to verify the JWT",
        )
        .with_handler_id(&self.id))
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn execute(&self, ctx: &dyn Context) -> Result<Subject> {
        debug!(handler = %self.id, "authenticating using JWT authenticator");

        let auth_data = self.auth_data_source.get_auth_data(ctx).map_err(|err| {
            PipelineError::authentication("no JWT present")
                .with_handler_id(&self.id)
                .caused_by(err)
        })?;
        let token = auth_data.value().to_string();

        let header = decode_header(&token).map_err(|err| {
            PipelineError::authentication("failed to parse JWT")
                .with_handler_id(&self.id)
                .caused_by(PipelineError::from_kind(ErrorKind::Argument).caused_by(err))
        })?;

        let claims = match header.kid.clone() {
            Some(kid) => {
                let jwk = self.get_key(ctx, &kid).await?;
                self.verify_token(&token, &header, &jwk)?
            }
            None => self.verify_token_without_kid(ctx, &token, &header).await?,
        };

        self.subject_info.create_subject(&claims).map_err(|err| {
            PipelineError::internal("failed to extract subject information from the JWT")
                .with_handler_id(&self.id)
                .caused_by(err)
        })
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Authenticator>> {
        if is_empty_config(config) {
            return Ok(self);
        }

        let overrides: OverrideConfig = decode_config("jwt authenticator", config)?;

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
            validate_jwk: self.validate_jwk,
            trust_store: self.trust_store.clone(),
        }))
    }

    fn is_fallback_on_error_allowed(&self) -> bool {
        self.allow_fallback_on_error
    }

    fn handler_id(&self) -> &str {
        &self.id
    }
}

/// TTL a JWK is cached under, combining the configured TTL (default 10
/// minutes) with the remaining lifetime of the key's certificate. `None`
/// disables caching for the key.
fn effective_cache_ttl(
    configured: Option<Duration>,
    cert_not_after: Option<i64>,
    now: i64,
) -> Option<Duration> {
    let cert_ttl = cert_not_after
        .map(|not_after| Duration::from_secs((not_after - now - CERT_TTL_LEEWAY_SECS).max(0) as u64))
        .unwrap_or(Duration::ZERO);
    let configured_ttl = configured.unwrap_or(DEFAULT_CACHE_TTL);

    match (configured_ttl.is_zero(), cert_ttl.is_zero()) {
        (true, true) => None,
        (true, false) => Some(cert_ttl),
        (false, true) => Some(configured_ttl),
        (false, false) => Some(configured_ttl.min(cert_ttl)),
    }
}

pub(crate) fn factory(
    id: &str,
    handler_type: &str,
    config: Option<&RawConfig>,
) -> Result<Option<Arc<dyn Authenticator>>> {
    if handler_type != "jwt" {
        return Ok(None);
    }
    Ok(Some(Arc::new(JwtAuthenticator::new(id, config)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, InMemoryCache};
    use crate::context::{AppContext, MockContext};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn raw(value: serde_json::Value) -> RawConfig {
        value.as_object().unwrap().clone()
    }

    fn authenticator(id: &str, jwks_url: &str, extra: serde_json::Value) -> JwtAuthenticator {
        let mut config = json!({
            "jwks_endpoint": {"url": jwks_url},
            "assertions": {"trusted_issuers": ["https://issuer.example"]},
        });
        config
            .as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        JwtAuthenticator::new(id, Some(&raw(config))).unwrap()
    }

    fn context_with_token(token: Option<&str>) -> MockContext {
        let token = token.map(|value| format!("Bearer {value}"));
        let mut ctx = MockContext::new();
        ctx.expect_request_header().return_const(token);
        ctx.expect_request_query_parameter().return_const(None);
        ctx.expect_request_body_parameter().return_const(None);
        ctx.expect_app_context()
            .return_const(AppContext::new(Arc::new(InMemoryCache::new())));
        ctx
    }

    /// An unsigned-but-parseable compact JWS for exercising everything up
    /// to the signature check.
    fn fake_token(header: serde_json::Value, payload: serde_json::Value) -> String {
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(payload.to_string()),
            URL_SAFE_NO_PAD.encode([0u8; 32]),
        )
    }

    #[test]
    fn construction_requires_trusted_issuers() {
        let err = JwtAuthenticator::new(
            "auth",
            Some(&raw(json!({"jwks_endpoint": {"url": "http://foo.bar"}}))),
        )
        .unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
        assert!(err.to_string().contains("no trusted issuers"));
    }

    #[test]
    fn construction_rejects_unknown_keys() {
        let err = JwtAuthenticator::new("auth", Some(&raw(json!({"foo": "bar"})))).unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
        assert!(err.to_string().contains("failed to decode"));
    }

    #[test]
    fn construction_rejects_invalid_endpoints() {
        let err = JwtAuthenticator::new(
            "auth",
            Some(&raw(json!({
                "jwks_endpoint": {"url": "http://foo.bar", "method": "FOO"},
                "assertions": {"trusted_issuers": ["https://issuer.example"]},
            }))),
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to validate endpoint"));
    }

    #[test]
    fn defaults_are_applied() {
        let auth = authenticator("auth", "http://foo.bar", json!({}));
        assert_eq!(
            auth.endpoint.headers.get("Accept-Type").unwrap(),
            "application/json"
        );
        assert_eq!(auth.endpoint.method.as_deref(), Some("GET"));
        assert_eq!(auth.subject_info.id, "sub");
        assert!(auth.validate_jwk);
        assert!(!auth.is_fallback_on_error_allowed());
    }

    #[test]
    fn empty_override_returns_the_prototype() {
        let prototype: Arc<dyn Authenticator> =
            Arc::new(authenticator("auth", "http://foo.bar", json!({})));
        let configured = prototype.clone().with_config(None).unwrap();
        assert!(Arc::ptr_eq(&prototype, &configured));
    }

    #[test]
    fn override_merges_assertions_and_replaces_ttl() {
        let prototype = Arc::new(authenticator(
            "auth",
            "http://foo.bar",
            json!({"cache_ttl": "5m"}),
        ));

        let configured = prototype
            .clone()
            .with_config(Some(&raw(json!({
                "assertions": {"audience": ["api"]},
                "cache_ttl": "1m",
                "allow_fallback_on_error": true,
            }))))
            .unwrap();

        // prototype unchanged
        assert_eq!(prototype.cache_ttl(), Some(Duration::from_secs(300)));
        assert!(!prototype.is_fallback_on_error_allowed());
        assert!(configured.is_fallback_on_error_allowed());
    }

    #[test]
    fn override_rejects_non_overridable_fields() {
        let prototype = Arc::new(authenticator("auth", "http://foo.bar", json!({})));
        let err = prototype
            .with_config(Some(&raw(json!({"jwks_endpoint": {"url": "http://baz"}}))))
            .unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
    }

    #[test]
    fn cache_ttl_table() {
        let now = 1_000_000;
        let zero = Some(Duration::ZERO);
        let five_minutes = Some(Duration::from_secs(300));

        // both zero: no caching
        assert_eq!(effective_cache_ttl(zero, Some(now + 10), now), None);
        // configured zero, cert lifetime left: cert wins
        assert_eq!(
            effective_cache_ttl(zero, Some(now + 110), now),
            Some(Duration::from_secs(100))
        );
        // cert exhausted, configured set: configured wins
        assert_eq!(
            effective_cache_ttl(five_minutes, Some(now + 5), now),
            Some(Duration::from_secs(300))
        );
        // both set: the smaller one wins
        assert_eq!(
            effective_cache_ttl(five_minutes, Some(now + 110), now),
            Some(Duration::from_secs(100))
        );
        assert_eq!(
            effective_cache_ttl(Some(Duration::from_secs(50)), Some(now + 110), now),
            Some(Duration::from_secs(50))
        );
        // nothing configured, no certificate: default applies
        assert_eq!(effective_cache_ttl(None, None, now), Some(DEFAULT_CACHE_TTL));
    }

    #[tokio::test]
    async fn missing_token_fails_with_fallback_classification() {
        let auth = authenticator("auth", "http://foo.bar", json!({}));
        let ctx = context_with_token(None);

        let err = auth.execute(&ctx).await.unwrap_err();
        assert!(err.is(ErrorKind::Authentication));
        assert!(err.is(ErrorKind::Argument));
        assert!(err.to_string().contains("no JWT present"));
        assert_eq!(err.handler_id(), Some("auth"));
    }

    #[tokio::test]
    async fn malformed_token_is_an_argument_caused_failure() {
        let auth = authenticator("auth", "http://foo.bar", json!({}));
        let ctx = context_with_token(Some("not a jwt"));

        let err = auth.execute(&ctx).await.unwrap_err();
        assert!(err.is(ErrorKind::Authentication));
        assert!(err.is(ErrorKind::Argument));
        assert!(err.to_string().contains("failed to parse JWT"));
    }

    #[tokio::test]
    async fn kid_without_matching_key_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": []})))
            .mount(&server)
            .await;

        let auth = authenticator("auth", &format!("{}/jwks", server.uri()), json!({}));
        let token = fake_token(json!({"alg": "RS256", "kid": "key1"}), json!({"sub": "foo"}));
        let ctx = context_with_token(Some(&token));

        let err = auth.execute(&ctx).await.unwrap_err();
        assert!(err.is(ErrorKind::Authentication));
        assert!(err.to_string().contains("no (unique) key found"));
        assert_eq!(err.handler_id(), Some("auth"));
    }

    #[tokio::test]
    async fn duplicated_kid_is_rejected() {
        let key = json!({"kty": "RSA", "kid": "key1", "alg": "RS256", "n": "AQAB", "e": "AQAB"});
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"keys": [key, key]})),
            )
            .mount(&server)
            .await;

        let auth = authenticator("auth", &server.uri(), json!({}));
        let token = fake_token(json!({"alg": "RS256", "kid": "key1"}), json!({"sub": "foo"}));
        let ctx = context_with_token(Some(&token));

        let err = auth.execute(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("no (unique) key found"));
    }

    #[tokio::test]
    async fn token_without_kid_and_unusable_keys_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": []})))
            .mount(&server)
            .await;

        let auth = authenticator("auth", &server.uri(), json!({}));
        let token = fake_token(json!({"alg": "RS256"}), json!({"sub": "foo"}));
        let ctx = context_with_token(Some(&token));

        let err = auth.execute(&ctx).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("none of the keys received from the JWKS endpoint"));
    }

    #[tokio::test]
    async fn jwks_server_error_is_a_communication_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let auth = authenticator("auth", &server.uri(), json!({}));
        let token = fake_token(json!({"alg": "RS256", "kid": "key1"}), json!({"sub": "foo"}));
        let ctx = context_with_token(Some(&token));

        let err = auth.execute(&ctx).await.unwrap_err();
        assert!(err.is(ErrorKind::Communication));
        assert!(err.to_string().contains("unexpected response code: 500"));
    }

    #[tokio::test]
    async fn garbled_jwks_body_is_an_internal_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let auth = authenticator("auth", &server.uri(), json!({}));
        let token = fake_token(json!({"alg": "RS256", "kid": "key1"}), json!({"sub": "foo"}));
        let ctx = context_with_token(Some(&token));

        let err = auth.execute(&ctx).await.unwrap_err();
        assert!(err.is(ErrorKind::Internal));
        assert!(err.to_string().contains("failed to decode the received JWKS"));
    }

    #[tokio::test]
    async fn cached_key_suppresses_the_jwks_fetch() {
        // a JWKS endpoint that must not be called
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let auth = authenticator("auth", &server.uri(), json!({}));

        let jwk: Jwk = serde_json::from_value(json!({
            "kty": "EC", "kid": "key1", "alg": "ES256", "crv": "P-256",
            "x": "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4",
            "y": "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM",
        }))
        .unwrap();

        let cache = Arc::new(InMemoryCache::new());
        cache.set(
            &auth.cache_key("key1"),
            Arc::new(jwk),
            Duration::from_secs(60),
        );

        let token = fake_token(
            json!({"alg": "ES256", "kid": "key1"}),
            json!({"sub": "foo", "iss": "https://issuer.example"}),
        );
        let mut ctx = MockContext::new();
        ctx.expect_request_header()
            .return_const(Some(format!("Bearer {token}")));
        ctx.expect_app_context()
            .return_const(AppContext::new(cache));

        // the fake signature cannot verify, but the failure proves the key
        // came from the cache: the JWKS endpoint answers 500 and expects no
        // calls at all
        let err = auth.execute(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("failed to verify JWT signature"));
    }

    #[tokio::test]
    async fn key_without_an_algorithm_is_rejected() {
        let auth = authenticator("auth", "http://foo.bar", json!({}));

        // no "alg" on the JWK: the token must not get to pick one
        let jwk: Jwk = serde_json::from_value(json!({
            "kty": "EC", "kid": "key1", "crv": "P-256",
            "x": "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4",
            "y": "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM",
        }))
        .unwrap();

        let cache = Arc::new(InMemoryCache::new());
        cache.set(
            &auth.cache_key("key1"),
            Arc::new(jwk),
            Duration::from_secs(60),
        );

        let token = fake_token(json!({"alg": "ES256", "kid": "key1"}), json!({"sub": "foo"}));
        let mut ctx = MockContext::new();
        ctx.expect_request_header()
            .return_const(Some(format!("Bearer {token}")));
        ctx.expect_app_context()
            .return_const(AppContext::new(cache));

        let err = auth.execute(&ctx).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("algorithm in the JWT header does not match"));
        assert_eq!(err.handler_id(), Some("auth"));
    }

    #[tokio::test]
    async fn algorithm_mismatch_between_header_and_key_is_rejected() {
        let auth = authenticator("auth", "http://foo.bar", json!({}));

        let jwk: Jwk = serde_json::from_value(json!({
            "kty": "EC", "kid": "key1", "alg": "ES256", "crv": "P-256",
            "x": "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4",
            "y": "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM",
        }))
        .unwrap();

        let cache = Arc::new(InMemoryCache::new());
        cache.set(
            &auth.cache_key("key1"),
            Arc::new(jwk),
            Duration::from_secs(60),
        );

        let token = fake_token(json!({"alg": "RS256", "kid": "key1"}), json!({"sub": "foo"}));
        let mut ctx = MockContext::new();
        ctx.expect_request_header()
            .return_const(Some(format!("Bearer {token}")));
        ctx.expect_app_context()
            .return_const(AppContext::new(cache));

        let err = auth.execute(&ctx).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("algorithm in the JWT header does not match"));
    }
}
