//! Credential extraction from the inbound request.
//!
//! A composite strategy tries an ordered list of locations (header with an
//! optional scheme prefix, query parameter, body parameter, cookie); the
//! first strategy producing a non-empty value wins. The extracted
//! [`AuthData`] remembers where it came from, so it can be re-injected into
//! a downstream request at the same location.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::context::Context;
use crate::error::{PipelineError, Result};

/// A single extraction location.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractStrategy {
    Header { name: String, scheme: Option<String> },
    QueryParameter { name: String },
    BodyParameter { name: String },
    Cookie { name: String },
}

impl ExtractStrategy {
    fn extract(&self, ctx: &dyn Context) -> Option<String> {
        let value = match self {
            ExtractStrategy::Header { name, scheme } => {
                let raw = ctx.request_header(name)?;
                match scheme {
                    Some(scheme) => {
                        let prefix = format!("{scheme} ");
                        raw.strip_prefix(&prefix).map(|rest| rest.to_string())?
                    }
                    None => raw,
                }
            }
            ExtractStrategy::QueryParameter { name } => ctx.request_query_parameter(name)?,
            ExtractStrategy::BodyParameter { name } => ctx.request_body_parameter(name)?,
            ExtractStrategy::Cookie { name } => ctx.request_cookie(name)?,
        };

        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

impl<'de> Deserialize<'de> for ExtractStrategy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Raw {
            #[serde(default)]
            header: Option<String>,
            #[serde(default)]
            schema: Option<String>,
            #[serde(default)]
            query_parameter: Option<String>,
            #[serde(default)]
            body_parameter: Option<String>,
            #[serde(default)]
            cookie: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let locations = [
            raw.header.is_some(),
            raw.query_parameter.is_some(),
            raw.body_parameter.is_some(),
            raw.cookie.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if locations != 1 {
            return Err(D::Error::custom(
                "exactly one of 'header', 'query_parameter', 'body_parameter' or 'cookie' must be set",
            ));
        }
        if raw.schema.is_some() && raw.header.is_none() {
            return Err(D::Error::custom("'schema' is only applicable to 'header'"));
        }

        Ok(if let Some(name) = raw.header {
            ExtractStrategy::Header {
                name,
                scheme: raw.schema,
            }
        } else if let Some(name) = raw.query_parameter {
            ExtractStrategy::QueryParameter { name }
        } else if let Some(name) = raw.body_parameter {
            ExtractStrategy::BodyParameter { name }
        } else {
            ExtractStrategy::Cookie {
                name: raw.cookie.expect("checked above"),
            }
        })
    }
}

/// Ordered list of extraction strategies; first non-empty value wins.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct CompositeExtractStrategy(pub Vec<ExtractStrategy>);

impl CompositeExtractStrategy {
    pub fn get_auth_data(&self, ctx: &dyn Context) -> Result<AuthData> {
        for strategy in &self.0 {
            if let Some(value) = strategy.extract(ctx) {
                return Ok(AuthData {
                    value,
                    strategy: strategy.clone(),
                });
            }
        }

        Err(PipelineError::argument("no authentication data present"))
    }
}

/// An extracted credential together with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthData {
    value: String,
    strategy: ExtractStrategy,
}

impl AuthData {
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Re-injects the credential into an outbound request at the location
    /// it was extracted from.
    pub fn apply_to(&self, request: &mut reqwest::Request) {
        match &self.strategy {
            ExtractStrategy::Header { name, scheme } => {
                let value = match scheme {
                    Some(scheme) => format!("{scheme} {}", self.value),
                    None => self.value.clone(),
                };
                if let (Ok(name), Ok(value)) = (
                    reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                    reqwest::header::HeaderValue::from_str(&value),
                ) {
                    request.headers_mut().insert(name, value);
                }
            }
            ExtractStrategy::QueryParameter { name } => {
                request
                    .url_mut()
                    .query_pairs_mut()
                    .append_pair(name, &self.value);
            }
            ExtractStrategy::BodyParameter { name } => {
                let content =
                    format!("{name}={}", urlencoding::encode(&self.value));
                *request.body_mut() = Some(reqwest::Body::from(content));
                if let Ok(value) =
                    reqwest::header::HeaderValue::from_str("application/x-www-form-urlencoded")
                {
                    request
                        .headers_mut()
                        .insert(reqwest::header::CONTENT_TYPE, value);
                }
            }
            ExtractStrategy::Cookie { name } => {
                if let Ok(value) =
                    reqwest::header::HeaderValue::from_str(&format!("{name}={}", self.value))
                {
                    request.headers_mut().insert(reqwest::header::COOKIE, value);
                }
            }
        }
    }
}

/// The extraction order used by authenticators when no `jwt_source` /
/// `auth_data_source` is configured.
pub fn default_auth_data_source() -> CompositeExtractStrategy {
    CompositeExtractStrategy(vec![
        ExtractStrategy::Header {
            name: "Authorization".to_string(),
            scheme: Some("Bearer".to_string()),
        },
        ExtractStrategy::QueryParameter {
            name: "access_token".to_string(),
        },
        ExtractStrategy::BodyParameter {
            name: "access_token".to_string(),
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MockContext;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn decodes_from_config() {
        let composite: CompositeExtractStrategy = serde_json::from_value(json!([
            {"header": "Authorization", "schema": "Bearer"},
            {"query_parameter": "access_token"},
            {"cookie": "token"},
        ]))
        .unwrap();

        assert_eq!(composite.0.len(), 3);
        assert_eq!(
            composite.0[0],
            ExtractStrategy::Header {
                name: "Authorization".to_string(),
                scheme: Some("Bearer".to_string())
            }
        );
    }

    #[test]
    fn rejects_ambiguous_strategy_configs() {
        let result = serde_json::from_value::<CompositeExtractStrategy>(json!([
            {"header": "Authorization", "cookie": "token"},
        ]));
        assert!(result.is_err());

        let result = serde_json::from_value::<CompositeExtractStrategy>(json!([
            {"schema": "Bearer", "query_parameter": "access_token"},
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn first_matching_strategy_wins() {
        let mut ctx = MockContext::new();
        ctx.expect_request_header()
            .withf(|name| name == "Authorization")
            .return_const(None);
        ctx.expect_request_query_parameter()
            .withf(|name| name == "access_token")
            .return_const(Some("foobar".to_string()));

        let auth_data = default_auth_data_source().get_auth_data(&ctx).unwrap();
        assert_eq!(auth_data.value(), "foobar");
    }

    #[test]
    fn scheme_prefix_is_stripped() {
        let mut ctx = MockContext::new();
        ctx.expect_request_header()
            .return_const(Some("Bearer my-token".to_string()));

        let composite = CompositeExtractStrategy(vec![ExtractStrategy::Header {
            name: "Authorization".to_string(),
            scheme: Some("Bearer".to_string()),
        }]);
        assert_eq!(composite.get_auth_data(&ctx).unwrap().value(), "my-token");
    }

    #[test]
    fn wrong_scheme_does_not_match() {
        let mut ctx = MockContext::new();
        ctx.expect_request_header()
            .return_const(Some("Basic Zm9vOmJhcg==".to_string()));

        let composite = CompositeExtractStrategy(vec![ExtractStrategy::Header {
            name: "Authorization".to_string(),
            scheme: Some("Bearer".to_string()),
        }]);

        let err = composite.get_auth_data(&ctx).unwrap_err();
        assert!(err.is(ErrorKind::Argument));
    }

    #[test]
    fn missing_auth_data_is_an_argument_error() {
        let mut ctx = MockContext::new();
        ctx.expect_request_header().return_const(None);
        ctx.expect_request_query_parameter().return_const(None);
        ctx.expect_request_body_parameter().return_const(None);

        let err = default_auth_data_source().get_auth_data(&ctx).unwrap_err();
        assert!(err.is(ErrorKind::Argument));
        assert!(err.to_string().contains("no authentication data present"));
    }

    #[test]
    fn auth_data_reinjects_at_the_original_location() {
        let mut ctx = MockContext::new();
        ctx.expect_request_header()
            .return_const(Some("Bearer my-token".to_string()));

        let composite = CompositeExtractStrategy(vec![ExtractStrategy::Header {
            name: "Authorization".to_string(),
            scheme: Some("Bearer".to_string()),
        }]);
        let auth_data = composite.get_auth_data(&ctx).unwrap();

        let mut request = reqwest::Request::new(
            reqwest::Method::GET,
            url::Url::parse("http://foo.bar").unwrap(),
        );
        auth_data.apply_to(&mut request);
        assert_eq!(
            request.headers().get("Authorization").unwrap(),
            "Bearer my-token"
        );
    }
}
