//! Outbound HTTP endpoint description.
//!
//! An [`Endpoint`] is a value object describing a call to an external
//! system: a (templated) URL, method, (templated) headers, an optional
//! authentication strategy, and timeout/retry policies. HTTP clients are
//! pooled per hostname and shared across requests.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lazy_static::lazy_static;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::cache::get_as;
use crate::context::AppContext;
use crate::subject::Subject;
use crate::template::{Template, TemplateError};

/// Upper bound applied when neither the endpoint nor the ambient deadline
/// constrain a call.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const KNOWN_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    Template(#[from] TemplateError),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid header {0}")]
    Header(String),

    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),

    #[error("request timed out: {0}")]
    Timeout(reqwest::Error),

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("token endpoint answered with status {0}")]
    TokenStatus(u16),

    #[error("failed to decode token response: {0}")]
    TokenDecode(reqwest::Error),
}

/// Where an API key is attached to the outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyLocation {
    Header,
    Query,
    Cookie,
}

/// How the outbound call authenticates itself against the remote system.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum AuthenticationStrategy {
    Basic {
        user: String,
        password: String,
    },
    ApiKey {
        #[serde(rename = "in")]
        location: ApiKeyLocation,
        name: String,
        value: String,
    },
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scopes: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl AuthenticationStrategy {
    async fn apply(
        &self,
        app: &AppContext,
        request: &mut reqwest::Request,
    ) -> Result<(), EndpointError> {
        match self {
            AuthenticationStrategy::Basic { user, password } => {
                let credentials = BASE64.encode(format!("{user}:{password}"));
                insert_header(request, "Authorization", &format!("Basic {credentials}"))?;
            }
            AuthenticationStrategy::ApiKey {
                location,
                name,
                value,
            } => match location {
                ApiKeyLocation::Header => insert_header(request, name, value)?,
                ApiKeyLocation::Cookie => {
                    insert_header(request, "Cookie", &format!("{name}={value}"))?
                }
                ApiKeyLocation::Query => {
                    request.url_mut().query_pairs_mut().append_pair(name, value);
                }
            },
            AuthenticationStrategy::ClientCredentials { .. } => {
                let token = self.client_credentials_token(app).await?;
                insert_header(request, "Authorization", &format!("Bearer {token}"))?;
            }
        }
        Ok(())
    }

    async fn client_credentials_token(&self, app: &AppContext) -> Result<String, EndpointError> {
        let AuthenticationStrategy::ClientCredentials {
            token_url,
            client_id,
            client_secret,
            scopes,
        } = self
        else {
            unreachable!("only called for the client credentials variant");
        };

        let cache_key = {
            let mut digest = Sha256::new();
            digest.update(b"client_credentials");
            digest.update(token_url.as_bytes());
            digest.update(client_id.as_bytes());
            digest.update(scopes.join(" ").as_bytes());
            hex::encode(digest.finalize())
        };

        if let Some(token) = get_as::<String>(app.cache(), &cache_key) {
            return Ok((*token).clone());
        }

        let url = Url::parse(token_url)?;
        let host = url.host_str().unwrap_or_default().to_string();
        let client = pooled_client(&host, None)?;

        let mut form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), client_id.clone()),
            ("client_secret".to_string(), client_secret.clone()),
        ];
        if !scopes.is_empty() {
            form.push(("scope".to_string(), scopes.join(" ")));
        }

        let response = client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(classify_transport_error)?;

        if !response.status().is_success() {
            return Err(EndpointError::TokenStatus(response.status().as_u16()));
        }

        let token: TokenResponse = response.json().await.map_err(EndpointError::TokenDecode)?;

        // keep the token around slightly shorter than its advertised lifetime
        if let Some(expires_in) = token.expires_in {
            let ttl = expires_in.saturating_sub(10);
            if ttl > 0 {
                app.cache().set(
                    &cache_key,
                    std::sync::Arc::new(token.access_token.clone()),
                    Duration::from_secs(ttl),
                );
            }
        }

        Ok(token.access_token)
    }

    fn fingerprint(&self, digest: &mut Sha256) {
        match self {
            AuthenticationStrategy::Basic { user, password } => {
                digest.update(b"basic");
                digest.update(user.as_bytes());
                digest.update(password.as_bytes());
            }
            AuthenticationStrategy::ApiKey {
                location,
                name,
                value,
            } => {
                digest.update(b"api_key");
                digest.update(format!("{location:?}").as_bytes());
                digest.update(name.as_bytes());
                digest.update(value.as_bytes());
            }
            AuthenticationStrategy::ClientCredentials {
                token_url,
                client_id,
                client_secret,
                scopes,
            } => {
                digest.update(b"client_credentials");
                digest.update(token_url.as_bytes());
                digest.update(client_id.as_bytes());
                digest.update(client_secret.as_bytes());
                digest.update(scopes.join(" ").as_bytes());
            }
        }
    }
}

/// Retry policy for transient transport failures.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Retry {
    #[serde(with = "humantime_serde")]
    pub give_up_after: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

/// Description of an outbound HTTP call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    pub url: String,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub auth: Option<AuthenticationStrategy>,

    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub retry: Option<Retry>,
}

impl Endpoint {
    /// Checks that the endpoint is usable: the URL must be set and, unless
    /// templated, parseable; a configured method must be a known token.
    pub fn validate(&self) -> Result<(), EndpointError> {
        if self.url.is_empty() {
            return Err(EndpointError::Validation("no url configured".to_string()));
        }

        // templated URLs can only be checked after rendering
        if !self.url.contains("{{") {
            Url::parse(&self.url)?;
        }

        if let Some(method) = &self.method {
            if !KNOWN_METHODS.contains(&method.to_uppercase().as_str()) {
                return Err(EndpointError::Validation(format!(
                    "unsupported method '{method}'"
                )));
            }
        }

        Ok(())
    }

    /// The configured method, or `default` if none is set.
    pub fn method_or(&self, default: &str) -> String {
        self.method
            .clone()
            .unwrap_or_else(|| default.to_string())
            .to_uppercase()
    }

    /// Renders the URL template and parses the result.
    pub fn render_url(
        &self,
        subject: Option<&Subject>,
        values: Option<&Value>,
    ) -> Result<Url, EndpointError> {
        let rendered = if self.url.contains("{{") {
            Template::new(self.url.clone())?.render(subject, values)?
        } else {
            self.url.clone()
        };
        Ok(Url::parse(&rendered)?)
    }

    /// Builds the outbound request: renders URL and header templates, sets
    /// the body, applies the authentication strategy, and bounds the
    /// request by the endpoint timeout and the ambient deadline.
    pub async fn create_request(
        &self,
        app: &AppContext,
        method: &str,
        body: Option<String>,
        subject: Option<&Subject>,
        values: Option<&Value>,
    ) -> Result<reqwest::Request, EndpointError> {
        let url = self.render_url(subject, values)?;
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| EndpointError::Validation(format!("unsupported method '{method}'")))?;

        let mut request = reqwest::Request::new(method, url);

        for (name, value) in self.render_headers(subject, values)? {
            insert_header(&mut request, &name, &value)?;
        }

        if let Some(content) = body {
            *request.body_mut() = Some(reqwest::Body::from(content));
        }

        if let Some(strategy) = &self.auth {
            strategy.apply(app, &mut request).await?;
        }

        let mut timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        if let Some(remaining) = app.remaining_time() {
            timeout = timeout.min(remaining);
        }
        *request.timeout_mut() = Some(timeout);

        Ok(request)
    }

    /// Renders all header templates against the given state.
    pub fn render_headers(
        &self,
        subject: Option<&Subject>,
        values: Option<&Value>,
    ) -> Result<Vec<(String, String)>, EndpointError> {
        let mut rendered: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(name, value)| {
                let value = if value.contains("{{") {
                    Template::new(value.clone())?.render(subject, values)?
                } else {
                    value.clone()
                };
                Ok((name.clone(), value))
            })
            .collect::<Result<_, EndpointError>>()?;
        rendered.sort();
        Ok(rendered)
    }

    /// The pooled HTTP client for the given hostname.
    pub fn client(&self, hostname: &str) -> Result<Client, EndpointError> {
        pooled_client(hostname, self.timeout)
    }

    /// Executes the request via the pooled client, retrying transient
    /// transport failures according to the configured retry policy.
    pub async fn send(
        &self,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, EndpointError> {
        let hostname = request
            .url()
            .host_str()
            .unwrap_or_default()
            .to_string();
        let client = self.client(&hostname)?;

        let Some(retry) = &self.retry else {
            return client.execute(request).await.map_err(classify_transport_error);
        };

        let started = Instant::now();
        let mut delay = Duration::from_millis(100);
        loop {
            let attempt = request.try_clone();
            let result = match attempt {
                Some(cloned) => client.execute(cloned).await,
                None => return client.execute(request).await.map_err(classify_transport_error),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_timeout() => return Err(EndpointError::Timeout(err)),
                Err(err) => {
                    if started.elapsed() + delay > retry.give_up_after {
                        return Err(EndpointError::Transport(err));
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(retry.max_delay);
                }
            }
        }
    }

    /// Stable fingerprint of this endpoint for cache keying. Covers the URL
    /// template, method, header templates and the authentication strategy.
    pub fn hash(&self) -> String {
        let mut digest = Sha256::new();
        digest.update(self.url.as_bytes());
        digest.update(self.method.as_deref().unwrap_or_default().as_bytes());

        let mut headers: Vec<_> = self.headers.iter().collect();
        headers.sort();
        for (name, value) in headers {
            digest.update(name.as_bytes());
            digest.update(b"=");
            digest.update(value.as_bytes());
        }

        if let Some(auth) = &self.auth {
            auth.fingerprint(&mut digest);
        }

        hex::encode(digest.finalize())
    }
}

fn insert_header(request: &mut reqwest::Request, name: &str, value: &str) -> Result<(), EndpointError> {
    let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| EndpointError::Header(name.to_string()))?;
    let value = reqwest::header::HeaderValue::from_str(value)
        .map_err(|_| EndpointError::Header(name.to_string()))?;
    request.headers_mut().insert(name, value);
    Ok(())
}

fn classify_transport_error(err: reqwest::Error) -> EndpointError {
    if err.is_timeout() {
        EndpointError::Timeout(err)
    } else {
        EndpointError::Transport(err)
    }
}

fn pooled_client(hostname: &str, timeout: Option<Duration>) -> Result<Client, EndpointError> {
    lazy_static! {
        static ref POOL: RwLock<HashMap<String, Client>> = RwLock::new(HashMap::new());
    }

    {
        let pool = POOL.read().expect("client pool lock poisoned");
        if let Some(client) = pool.get(hostname) {
            return Ok(client.clone());
        }
    }

    let client = Client::builder()
        .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
        .build()
        .map_err(EndpointError::Client)?;

    let mut pool = POOL.write().expect("client pool lock poisoned");
    Ok(pool.entry(hostname.to_string()).or_insert(client).clone())
}
