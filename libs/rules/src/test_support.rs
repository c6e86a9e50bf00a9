//! Test doubles shared by the crate's unit tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use url::Url;

use warden_pipeline::error::{PipelineError, Result};
use warden_pipeline::handler::{Authenticator, RawConfig};
use warden_pipeline::{AppContext, ClientResponse, Context, InMemoryCache, Subject};

pub(crate) struct FakeContext {
    app: AppContext,
    pub headers: HashMap<String, String>,
    pub client_ips: Vec<IpAddr>,
    pub upstream_headers: Mutex<Vec<(String, String)>>,
    pub upstream_cookies: Mutex<Vec<(String, String)>>,
    pub pipeline_error: Mutex<Option<PipelineError>>,
    pub client_response: Mutex<Option<ClientResponse>>,
}

impl FakeContext {
    pub fn new() -> Self {
        Self {
            app: AppContext::new(Arc::new(InMemoryCache::new())),
            headers: HashMap::new(),
            client_ips: Vec::new(),
            upstream_headers: Mutex::new(Vec::new()),
            upstream_cookies: Mutex::new(Vec::new()),
            pipeline_error: Mutex::new(None),
            client_response: Mutex::new(None),
        }
    }

    pub fn upstream_headers(&self) -> Vec<(String, String)> {
        self.upstream_headers.lock().unwrap().clone()
    }
}

impl Context for FakeContext {
    fn app_context(&self) -> &AppContext {
        &self.app
    }

    fn request_method(&self) -> String {
        "GET".to_string()
    }

    fn request_url(&self) -> Url {
        Url::parse("http://foo.bar/api/baz").unwrap()
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

    fn request_cookie(&self, _name: &str) -> Option<String> {
        None
    }

    fn request_query_parameter(&self, _name: &str) -> Option<String> {
        None
    }

    fn request_body_parameter(&self, _name: &str) -> Option<String> {
        None
    }

    fn request_client_ips(&self) -> Vec<IpAddr> {
        self.client_ips.clone()
    }

    fn add_header_for_upstream(&self, name: &str, value: &str) {
        self.upstream_headers
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
    }

    fn add_cookie_for_upstream(&self, name: &str, value: &str) {
        self.upstream_cookies
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
    }

    fn set_pipeline_error(&self, error: PipelineError) {
        *self.pipeline_error.lock().unwrap() = Some(error);
    }

    fn set_client_response(&self, response: ClientResponse) {
        *self.client_response.lock().unwrap() = Some(response);
    }
}

#[derive(Debug)]
pub(crate) struct StaticAuthenticator {
    id: String,
    subject: String,
    calls: AtomicUsize,
}

impl StaticAuthenticator {
    pub fn new(id: &str, subject: &str) -> Self {
        Self {
            id: id.to_string(),
            subject: subject.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn execute(&self, _ctx: &dyn Context) -> Result<Subject> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Subject::new(self.subject.clone()))
    }

    fn with_config(self: Arc<Self>, _config: Option<&RawConfig>) -> Result<Arc<dyn Authenticator>> {
        Ok(self)
    }

    fn handler_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug)]
pub(crate) struct FailingAuthenticator {
    id: String,
    error: PipelineError,
    allow_fallback: bool,
}

impl FailingAuthenticator {
    pub fn new(id: &str, error: PipelineError, allow_fallback: bool) -> Self {
        Self {
            id: id.to_string(),
            error,
            allow_fallback,
        }
    }
}

#[async_trait]
impl Authenticator for FailingAuthenticator {
    async fn execute(&self, _ctx: &dyn Context) -> Result<Subject> {
        Err(self.error.clone())
    }

    fn with_config(self: Arc<Self>, _config: Option<&RawConfig>) -> Result<Arc<dyn Authenticator>> {
        Ok(self)
    }

    fn is_fallback_on_error_allowed(&self) -> bool {
        self.allow_fallback
    }

    fn handler_id(&self) -> &str {
        &self.id
    }
}
