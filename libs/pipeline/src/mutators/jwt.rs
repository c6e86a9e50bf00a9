//! Mutator minting a signed JWT for the upstream request.
//!
//! The upstream receives a short lived RS256 token carrying the subject id
//! and optional template rendered claims, attached as a bearer
//! `Authorization` header (configurable). Signed tokens are cached
//! slightly shorter than their lifetime, so repeated requests by the same
//! subject reuse the same token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::cache::get_as;
use crate::context::Context;
use crate::error::{PipelineError, Result};
use crate::handler::{is_empty_config, Mutator, RawConfig};
use crate::registry::decode_config;
use crate::subject::Subject;
use crate::template::Template;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Margin between the cache lifetime of a signed token and its `exp`, in
/// seconds.
const CACHE_LEEWAY_SECS: u64 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SignerConfig {
    /// PEM encoded RSA private key.
    key: String,
    #[serde(default)]
    key_id: Option<String>,
    #[serde(default)]
    issuer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HeaderConfig {
    name: String,
    #[serde(default)]
    scheme: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    signer: SignerConfig,
    #[serde(default, with = "humantime_serde")]
    ttl: Option<Duration>,
    #[serde(default)]
    claims: Option<Template>,
    #[serde(default)]
    header: Option<HeaderConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OverrideConfig {
    #[serde(default, with = "humantime_serde")]
    ttl: Option<Duration>,
    #[serde(default)]
    claims: Option<Template>,
}

pub struct JwtMutator {
    id: String,
    encoding_key: EncodingKey,
    key_fingerprint: String,
    key_id: Option<String>,
    issuer: Option<String>,
    ttl: Duration,
    claims: Option<Template>,
    header: (String, Option<String>),
}

impl std::fmt::Debug for JwtMutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtMutator")
            .field("id", &self.id)
            .field("key_fingerprint", &self.key_fingerprint)
            .field("key_id", &self.key_id)
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .field("claims", &self.claims)
            .field("header", &self.header)
            .finish()
    }
}

impl JwtMutator {
    pub fn new(id: &str, config: Option<&RawConfig>) -> Result<Self> {
        let config: Config = decode_config("jwt mutator", config)?;

        let encoding_key = EncodingKey::from_rsa_pem(config.signer.key.as_bytes())
            .map_err(|err| {
                PipelineError::configuration("failed to parse the signer key").caused_by(err)
            })?;
        let key_fingerprint = hex::encode(Sha256::digest(config.signer.key.as_bytes()));

        let header = config
            .header
            .map(|header| (header.name, header.scheme))
            .unwrap_or_else(|| ("Authorization".to_string(), Some("Bearer".to_string())));

        Ok(Self {
            id: id.to_string(),
            encoding_key,
            key_fingerprint,
            key_id: config.signer.key_id,
            issuer: config.signer.issuer,
            ttl: config.ttl.unwrap_or(DEFAULT_TTL),
            claims: config.claims,
            header,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn cache_key(&self, subject: &Subject) -> String {
        let mut digest = Sha256::new();
        digest.update(self.key_fingerprint.as_bytes());
        digest.update(
            self.claims
                .as_ref()
                .map(Template::source)
                .unwrap_or_default()
                .as_bytes(),
        );
        digest.update(self.ttl.as_secs().to_be_bytes());
        digest.update(serde_json::to_vec(subject).unwrap_or_default());
        hex::encode(digest.finalize())
    }

    /// Builds the claim set: template rendered claims first, then the
    /// registered claims, which always win.
    fn build_claims(&self, subject: &Subject) -> Result<Map<String, Value>> {
        let mut claims = match &self.claims {
            None => Map::new(),
            Some(template) => {
                let rendered = template.render(Some(subject), None).map_err(|err| {
                    PipelineError::internal("failed to render the claims template")
                        .with_handler_id(&self.id)
                        .caused_by(err)
                })?;
                serde_json::from_str::<Value>(&rendered)
                    .ok()
                    .and_then(|value| value.as_object().cloned())
                    .ok_or_else(|| {
                        PipelineError::internal(
                            "claims template did not render to a JSON object",
                        )
                        .with_handler_id(&self.id)
                    })?
            }
        };

        let now = Utc::now().timestamp();
        claims.insert("sub".to_string(), Value::from(subject.id.clone()));
        claims.insert("jti".to_string(), Value::from(Uuid::new_v4().to_string()));
        claims.insert("iat".to_string(), Value::from(now));
        claims.insert("nbf".to_string(), Value::from(now));
        claims.insert(
            "exp".to_string(),
            Value::from(now + self.ttl.as_secs() as i64),
        );
        if let Some(issuer) = &self.issuer {
            claims.insert("iss".to_string(), Value::from(issuer.clone()));
        }

        Ok(claims)
    }

    fn mint_token(&self, subject: &Subject) -> Result<String> {
        let claims = self.build_claims(subject)?;

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();

        encode(&header, &claims, &self.encoding_key).map_err(|err| {
            PipelineError::internal("failed to sign the JWT")
                .with_handler_id(&self.id)
                .caused_by(err)
        })
    }
}

#[async_trait]
impl Mutator for JwtMutator {
    async fn execute(&self, ctx: &dyn Context, subject: Option<&Subject>) -> Result<()> {
        debug!(handler = %self.id, "mutating request using jwt mutator");

        let Some(subject) = subject else {
            return Err(PipelineError::internal(
                "failed to execute jwt mutator due to 'nil' subject",
            )
            .with_handler_id(&self.id));
        };

        let cache = ctx.app_context().cache();
        let cache_key = self.cache_key(subject);

        let token = match get_as::<String>(cache, &cache_key) {
            Some(token) => (*token).clone(),
            None => {
                let token = self.mint_token(subject)?;
                let cache_ttl = self
                    .ttl
                    .saturating_sub(Duration::from_secs(CACHE_LEEWAY_SECS));
                if !cache_ttl.is_zero() {
                    cache.set(&cache_key, Arc::new(token.clone()), cache_ttl);
                }
                token
            }
        };

        let (name, scheme) = &self.header;
        let value = match scheme {
            Some(scheme) => format!("{scheme} {token}"),
            None => token,
        };
        ctx.add_header_for_upstream(name, &value);

        Ok(())
    }

    fn with_config(self: Arc<Self>, config: Option<&RawConfig>) -> Result<Arc<dyn Mutator>> {
        if is_empty_config(config) {
            return Ok(self);
        }

        let overrides: OverrideConfig = decode_config("jwt mutator", config)?;

        Ok(Arc::new(Self {
            id: self.id.clone(),
            encoding_key: self.encoding_key.clone(),
            key_fingerprint: self.key_fingerprint.clone(),
            key_id: self.key_id.clone(),
            issuer: self.issuer.clone(),
            ttl: overrides.ttl.unwrap_or(self.ttl),
            claims: overrides.claims.or_else(|| self.claims.clone()),
            header: self.header.clone(),
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
) -> Result<Option<Arc<dyn Mutator>>> {
    if handler_type != "jwt" {
        return Ok(None);
    }
    Ok(Some(Arc::new(JwtMutator::new(id, config)?)))
}
