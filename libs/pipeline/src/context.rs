//! The capability object handed to every pipeline step.
//!
//! A [`Context`] gives a handler read access to the inbound request, lets it
//! accumulate mutations for the upstream request, and exposes the
//! app-scoped services (cache, deadline). Handlers never see the transport
//! types directly, which keeps the pipeline usable both in reverse-proxy
//! and in decision-only deployments.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use url::Url;

use crate::cache::Cache;
use crate::error::PipelineError;

/// Ambient, app-scoped services shared by all requests.
#[derive(Clone)]
pub struct AppContext {
    cache: Arc<dyn Cache>,
    deadline: Option<Instant>,
}

impl AppContext {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            deadline: None,
        }
    }

    /// Derives a context whose outbound calls must complete before
    /// `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cache(&self) -> &dyn Cache {
        self.cache.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the ambient deadline, if one is set. `None` means
    /// unbounded; `Some(ZERO)` means the deadline has passed.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// A response an error handler wants the client to receive, e.g. a
/// redirect or a serialized error body.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientResponse {
    pub code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

/// Read surface of the inbound request plus the mutation accumulators.
///
/// Mutations recorded after a terminal pipeline error must not be forwarded
/// to the upstream; enforcing that is the transport boundary's job, since
/// only it knows when the pipeline has finished.
#[cfg_attr(test, mockall::automock)]
pub trait Context: Send + Sync {
    fn app_context(&self) -> &AppContext;

    fn request_method(&self) -> String;
    fn request_url(&self) -> Url;
    fn request_header(&self, name: &str) -> Option<String>;
    fn request_headers(&self) -> HashMap<String, String>;
    fn request_cookie(&self, name: &str) -> Option<String>;
    fn request_query_parameter(&self, name: &str) -> Option<String>;
    fn request_body_parameter(&self, name: &str) -> Option<String>;
    fn request_client_ips(&self) -> Vec<IpAddr>;

    fn add_header_for_upstream(&self, name: &str, value: &str);
    fn add_cookie_for_upstream(&self, name: &str, value: &str);

    /// Records the terminal pipeline error for the transport boundary.
    fn set_pipeline_error(&self, error: PipelineError);

    /// Records a client-visible response produced by an error handler.
    fn set_client_response(&self, response: ClientResponse);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    #[test]
    fn remaining_time_honors_the_deadline() {
        let app = AppContext::new(Arc::new(InMemoryCache::new()));
        assert!(app.remaining_time().is_none());

        let app = app.with_deadline(Instant::now() + Duration::from_secs(5));
        let remaining = app.remaining_time().unwrap();
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::from_secs(4));
    }

    #[test]
    fn passed_deadline_reports_zero() {
        let app = AppContext::new(Arc::new(InMemoryCache::new()))
            .with_deadline(Instant::now() - Duration::from_secs(1));
        assert_eq!(app.remaining_time(), Some(Duration::ZERO));
    }
}
