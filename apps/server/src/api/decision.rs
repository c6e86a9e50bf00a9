//! The decision endpoint: every non-health request runs through the rule
//! pipeline.
//!
//! The verdict encoding follows the error taxonomy: 2xx carries the
//! accumulated upstream headers and cookies, failures map their error kind
//! to a status (400 argument, 401 authentication, 403 authorization,
//! 502/504 communication, 500 otherwise) unless an error handler recorded
//! an explicit client response.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Instant;

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;
use url::Url;

use warden_pipeline::error::{ErrorKind, PipelineError};
use warden_pipeline::{AppContext, ClientResponse, Context};
use warden_rules::RepositoryError;

use crate::state::AppState;

/// Upper bound for buffered request bodies; bigger bodies are rejected
/// before the pipeline runs.
const BODY_LIMIT: usize = 1024 * 1024;

pub(crate) struct RequestContext {
    app: AppContext,
    method: String,
    url: Url,
    headers: HashMap<String, String>,
    client_ips: Vec<IpAddr>,
    body_parameters: HashMap<String, String>,
    upstream_headers: Mutex<Vec<(String, String)>>,
    upstream_cookies: Mutex<Vec<(String, String)>>,
    pipeline_error: Mutex<Option<PipelineError>>,
    client_response: Mutex<Option<ClientResponse>>,
}

impl RequestContext {
    fn new(
        state: &AppState,
        parts: &Parts,
        body: &[u8],
        peer: Option<IpAddr>,
    ) -> Result<Self, Response> {
        let headers = collect_headers(parts);
        let url = reconstruct_url(parts, &headers)?;

        Ok(Self {
            app: AppContext::new(state.cache.clone())
                .with_deadline(Instant::now() + state.timeout),
            method: parts.method.as_str().to_string(),
            url,
            client_ips: client_ips(&headers, peer),
            body_parameters: parse_body_parameters(&headers, body),
            headers,
            upstream_headers: Mutex::new(Vec::new()),
            upstream_cookies: Mutex::new(Vec::new()),
            pipeline_error: Mutex::new(None),
            client_response: Mutex::new(None),
        })
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn take_upstream_headers(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.upstream_headers.lock().expect("lock poisoned"))
    }

    fn take_upstream_cookies(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.upstream_cookies.lock().expect("lock poisoned"))
    }

    fn take_client_response(&self) -> Option<ClientResponse> {
        self.client_response.lock().expect("lock poisoned").take()
    }
}

impl Context for RequestContext {
    fn app_context(&self) -> &AppContext {
        &self.app
    }

    fn request_method(&self) -> String {
        self.method.clone()
    }

    fn request_url(&self) -> Url {
        self.url.clone()
    }

    fn request_header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    fn request_headers(&self) -> HashMap<String, String> {
        self.headers.clone()
    }

    fn request_cookie(&self, name: &str) -> Option<String> {
        let cookies = self.request_header("Cookie")?;
        cookies
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
    }

    fn request_query_parameter(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    fn request_body_parameter(&self, name: &str) -> Option<String> {
        self.body_parameters.get(name).cloned()
    }

    fn request_client_ips(&self) -> Vec<IpAddr> {
        self.client_ips.clone()
    }

    fn add_header_for_upstream(&self, name: &str, value: &str) {
        self.upstream_headers
            .lock()
            .expect("lock poisoned")
            .push((name.to_string(), value.to_string()));
    }

    fn add_cookie_for_upstream(&self, name: &str, value: &str) {
        self.upstream_cookies
            .lock()
            .expect("lock poisoned")
            .push((name.to_string(), value.to_string()));
    }

    fn set_pipeline_error(&self, error: PipelineError) {
        *self.pipeline_error.lock().expect("lock poisoned") = Some(error);
    }

    fn set_client_response(&self, response: ClientResponse) {
        *self.client_response.lock().expect("lock poisoned") = Some(response);
    }
}

pub(crate) async fn decide(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let body = match to_bytes(body, BODY_LIMIT).await {
        Ok(body) => body,
        Err(_) => {
            return error_body(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
        }
    };

    let ctx = match RequestContext::new(&state, &parts, &body, peer.map(|info| info.0.ip())) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };

    let rule = match state.repository.find_rule(ctx.url(), parts.method.as_str()) {
        Ok(rule) => rule,
        Err(RepositoryError::NoRuleFound(url)) => {
            debug!(%url, "no rule matched");
            return error_body(StatusCode::NOT_FOUND, "no rule matching the request");
        }
        Err(RepositoryError::MethodNotAllowed { .. }) => {
            return error_body(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
    };

    match rule.execute(&ctx).await {
        Ok(upstream) => {
            let mut response = StatusCode::OK.into_response();

            for (name, value) in ctx.take_upstream_headers() {
                append_header(&mut response, &name, &value);
            }

            let cookies = ctx.take_upstream_cookies();
            if !cookies.is_empty() {
                let joined = cookies
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                append_header(&mut response, "Cookie", &joined);
            }

            if let Some(upstream) = upstream {
                append_header(&mut response, "X-Warden-Upstream", upstream.as_str());
            }

            response
        }
        Err(err) => {
            debug!(rule = %rule.id(), error = %err, "pipeline rejected the request");

            let mut response = match ctx.take_client_response() {
                Some(client_response) => {
                    let status = StatusCode::from_u16(client_response.code)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    let mut response = match client_response.body {
                        Some(body) => (status, Json(body)).into_response(),
                        None => status.into_response(),
                    };
                    for (name, value) in client_response.headers {
                        append_header(&mut response, &name, &value);
                    }
                    response
                }
                None => error_body(status_for(err.kind()), err.kind().as_str()),
            };

            // headers attached by error handlers (e.g. WWW-Authenticate)
            // are part of the client visible outcome
            for (name, value) in ctx.take_upstream_headers() {
                append_header(&mut response, &name, &value);
            }

            response
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Argument => StatusCode::BAD_REQUEST,
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::Communication => StatusCode::BAD_GATEWAY,
        ErrorKind::CommunicationTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Configuration | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({"code": status.as_u16(), "message": message})),
    )
        .into_response()
}

fn append_header(response: &mut Response, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        response.headers_mut().append(name, value);
    }
}

fn collect_headers(parts: &Parts) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for name in parts.headers.keys() {
        let joined = parts
            .headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        headers.insert(name.as_str().to_string(), joined);
    }
    headers
}

fn reconstruct_url(parts: &Parts, headers: &HashMap<String, String>) -> Result<Url, Response> {
    let lookup = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    };

    let scheme = lookup("X-Forwarded-Proto").unwrap_or_else(|| "http".to_string());
    let host = lookup("X-Forwarded-Host")
        .or_else(|| lookup("Host"))
        .unwrap_or_else(|| "localhost".to_string());
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Url::parse(&format!("{scheme}://{host}{path_and_query}"))
        .map_err(|_| error_body(StatusCode::BAD_REQUEST, "malformed request url"))
}

fn client_ips(headers: &HashMap<String, String>, peer: Option<IpAddr>) -> Vec<IpAddr> {
    let mut ips: Vec<IpAddr> = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("x-forwarded-for"))
        .map(|(_, value)| {
            value
                .split(',')
                .filter_map(|entry| entry.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default();

    if let Some(peer) = peer {
        ips.push(peer);
    }

    ips
}

fn parse_body_parameters(headers: &HashMap<String, String>, body: &[u8]) -> HashMap<String, String> {
    if body.is_empty() {
        return HashMap::new();
    }

    let content_type = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.as_str())
        .unwrap_or_default();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        url::form_urlencoded::parse(body)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    } else if content_type.starts_with("application/json") {
        serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|value| value.as_object().cloned())
            .map(|object| {
                object
                    .into_iter()
                    .map(|(key, value)| {
                        let value = match value {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        (key, value)
                    })
                    .collect()
            })
            .unwrap_or_default()
    } else {
        HashMap::new()
    }
}
