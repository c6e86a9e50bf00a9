//! Predicates deciding whether an error handler is responsible for an
//! error.
//!
//! A condition matcher combines up to three predicates: the error kind
//! (with an optional `raised_by` handler filter), the client IP (CIDR
//! ranges) and request header values. Every configured predicate must
//! match.

use ipnetwork::IpNetwork;
use serde::Deserialize;

use crate::context::Context;
use crate::error::{ErrorKind, PipelineError};

/// The error kind vocabulary usable in `when` conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKindAlias {
    AuthenticationError,
    AuthorizationError,
    InternalError,
    PreconditionError,
}

impl ErrorKindAlias {
    /// The pipeline error kinds covered by this alias.
    pub fn kinds(&self) -> &'static [ErrorKind] {
        match self {
            ErrorKindAlias::AuthenticationError => &[ErrorKind::Authentication],
            ErrorKindAlias::AuthorizationError => &[ErrorKind::Authorization],
            ErrorKindAlias::InternalError => &[ErrorKind::Internal, ErrorKind::Configuration],
            ErrorKindAlias::PreconditionError => &[ErrorKind::Argument],
        }
    }
}

/// A single error descriptor: kind alias plus an optional origin filter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorDescriptor {
    #[serde(rename = "type")]
    pub kind: ErrorKindAlias,
    #[serde(default)]
    pub raised_by: Option<String>,
}

impl ErrorDescriptor {
    fn matches(&self, error: &PipelineError) -> bool {
        let kind_matches = self.kind.kinds().iter().any(|kind| error.is(*kind));
        if !kind_matches {
            return false;
        }

        match &self.raised_by {
            None => true,
            Some(handler_id) => error.handler_id() == Some(handler_id.as_str()),
        }
    }
}

/// Matches if any of the descriptors matches.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct ErrorMatcher(pub Vec<ErrorDescriptor>);

impl ErrorMatcher {
    pub fn matches(&self, error: &PipelineError) -> bool {
        self.0.iter().any(|descriptor| descriptor.matches(error))
    }
}

/// Matches if any client IP falls into any of the configured ranges.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct CidrMatcher(pub Vec<IpNetwork>);

impl CidrMatcher {
    pub fn matches(&self, ctx: &dyn Context) -> bool {
        let ips = ctx.request_client_ips();
        ips.iter()
            .any(|ip| self.0.iter().any(|network| network.contains(*ip)))
    }
}

/// Matches if, for every configured header, the request carries one of the
/// allowed values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct HeaderMatcher(pub std::collections::HashMap<String, Vec<String>>);

impl HeaderMatcher {
    pub fn matches(&self, ctx: &dyn Context) -> bool {
        self.0.iter().all(|(name, allowed)| {
            ctx.request_header(name)
                .map(|value| allowed.contains(&value))
                .unwrap_or(false)
        })
    }
}

/// AND-composition over the configured predicates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorConditionMatcher {
    #[serde(default)]
    pub error: Option<ErrorMatcher>,
    #[serde(default)]
    pub cidr: Option<CidrMatcher>,
    #[serde(default)]
    pub headers: Option<HeaderMatcher>,
}

impl ErrorConditionMatcher {
    pub fn matches(&self, ctx: &dyn Context, error: &PipelineError) -> bool {
        if let Some(matcher) = &self.error {
            if !matcher.matches(error) {
                return false;
            }
        }
        if let Some(matcher) = &self.cidr {
            if !matcher.matches(ctx) {
                return false;
            }
        }
        if let Some(matcher) = &self.headers {
            if !matcher.matches(ctx) {
                return false;
            }
        }
        true
    }
}
