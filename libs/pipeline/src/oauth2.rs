//! OAuth2 / JWT claim assertions.
//!
//! An [`Expectation`] bundles the claim constraints applied after signature
//! verification: trusted issuers, required audience, allowed signature
//! algorithms, scope requirements and the clock leeway for the time based
//! claims.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

/// Default clock skew tolerated for `exp` and `nbf`, in seconds.
const DEFAULT_LEEWAY_SECS: i64 = 10;

/// The hardcoded safe set: asymmetric algorithms only, neither `none` nor
/// any of the HMAC family.
pub fn default_allowed_algorithms() -> Vec<String> {
    [
        "ES256", "ES384", "ES512", "RS256", "RS384", "RS512", "PS256", "PS384", "PS512", "EdDSA",
    ]
    .iter()
    .map(|alg| alg.to_string())
    .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssertionError {
    #[error("issuer is not trusted")]
    UntrustedIssuer,

    #[error("audience mismatch")]
    AudienceMismatch,

    #[error("token is expired")]
    Expired,

    #[error("token is not yet valid")]
    NotYetValid,

    #[error("required scopes are not granted")]
    ScopesMismatch,

    #[error("algorithm '{0}' is not allowed")]
    AlgorithmNotAllowed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMatchingStrategy {
    #[default]
    Exact,
    Wildcard,
}

/// Requirement on the scopes granted to the token.
///
/// With the `wildcard` strategy a required value of the form `foo.*`
/// matches `foo` itself and anything below it.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopesMatcher {
    #[serde(default)]
    pub matching_strategy: ScopeMatchingStrategy,
    #[serde(default)]
    pub values: Vec<String>,
}

impl ScopesMatcher {
    pub fn matches(&self, granted: &[String]) -> bool {
        self.values.iter().all(|required| match self.matching_strategy {
            ScopeMatchingStrategy::Exact => granted.iter().any(|scope| scope == required),
            ScopeMatchingStrategy::Wildcard => granted.iter().any(|scope| {
                if let Some(prefix) = required.strip_suffix(".*") {
                    scope == prefix || scope.starts_with(&format!("{prefix}."))
                } else {
                    scope == required
                }
            }),
        })
    }
}

/// The typed claim set of a verified token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub aud: Vec<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub jti: Option<String>,
    #[serde(default, alias = "scope", deserialize_with = "scope_list")]
    pub scp: Vec<String>,
}

/// `aud` may be a single string or an array of strings.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(single) => Ok(vec![single]),
        Value::Array(values) => Ok(values
            .into_iter()
            .filter_map(|value| value.as_str().map(|s| s.to_string()))
            .collect()),
        Value::Null => Ok(Vec::new()),
        _ => Err(serde::de::Error::custom("expected string or array")),
    }
}

/// Scopes come as a space delimited string (`scope`) or as an array
/// (`scp`).
fn scope_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(joined) => Ok(joined
            .split_whitespace()
            .map(|scope| scope.to_string())
            .collect()),
        Value::Array(values) => Ok(values
            .into_iter()
            .filter_map(|value| value.as_str().map(|s| s.to_string()))
            .collect()),
        Value::Null => Ok(Vec::new()),
        _ => Err(serde::de::Error::custom("expected string or array")),
    }
}

/// Claim constraints asserted after signature verification.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expectation {
    #[serde(default)]
    pub trusted_issuers: Vec<String>,
    #[serde(default)]
    pub audience: Vec<String>,
    #[serde(default)]
    pub allowed_algorithms: Vec<String>,
    #[serde(default)]
    pub scopes_matcher: Option<ScopesMatcher>,
    #[serde(default, with = "humantime_serde")]
    pub validity_leeway: Option<Duration>,
}

impl Expectation {
    pub fn leeway_secs(&self) -> i64 {
        self.validity_leeway
            .map(|leeway| leeway.as_secs() as i64)
            .unwrap_or(DEFAULT_LEEWAY_SECS)
    }

    /// The allowed algorithm set, falling back to the hardcoded safe set.
    pub fn effective_allowed_algorithms(&self) -> Vec<String> {
        if self.allowed_algorithms.is_empty() {
            default_allowed_algorithms()
        } else {
            self.allowed_algorithms.clone()
        }
    }

    pub fn assert_algorithm(&self, algorithm: &str) -> Result<(), AssertionError> {
        if self
            .effective_allowed_algorithms()
            .iter()
            .any(|allowed| allowed == algorithm)
        {
            Ok(())
        } else {
            Err(AssertionError::AlgorithmNotAllowed(algorithm.to_string()))
        }
    }

    pub fn assert_claims(&self, claims: &Claims) -> Result<(), AssertionError> {
        let now = Utc::now().timestamp();
        let leeway = self.leeway_secs();

        if !self.trusted_issuers.is_empty() {
            let trusted = claims
                .iss
                .as_ref()
                .map(|iss| self.trusted_issuers.contains(iss))
                .unwrap_or(false);
            if !trusted {
                return Err(AssertionError::UntrustedIssuer);
            }
        }

        if !self.audience.is_empty()
            && !claims.aud.iter().any(|aud| self.audience.contains(aud))
        {
            return Err(AssertionError::AudienceMismatch);
        }

        if let Some(exp) = claims.exp {
            if exp + leeway <= now {
                return Err(AssertionError::Expired);
            }
        }

        if let Some(nbf) = claims.nbf {
            if nbf > now + leeway {
                return Err(AssertionError::NotYetValid);
            }
        }

        if let Some(matcher) = &self.scopes_matcher {
            if !matcher.matches(&claims.scp) {
                return Err(AssertionError::ScopesMismatch);
            }
        }

        Ok(())
    }

    /// Merges per-rule overrides over this prototype expectation. Fields
    /// left empty in the override keep the prototype's values.
    pub fn merged_with(&self, overrides: &Expectation) -> Expectation {
        Expectation {
            trusted_issuers: if overrides.trusted_issuers.is_empty() {
                self.trusted_issuers.clone()
            } else {
                overrides.trusted_issuers.clone()
            },
            audience: if overrides.audience.is_empty() {
                self.audience.clone()
            } else {
                overrides.audience.clone()
            },
            allowed_algorithms: if overrides.allowed_algorithms.is_empty() {
                self.allowed_algorithms.clone()
            } else {
                overrides.allowed_algorithms.clone()
            },
            scopes_matcher: overrides
                .scopes_matcher
                .clone()
                .or_else(|| self.scopes_matcher.clone()),
            validity_leeway: overrides.validity_leeway.or(self.validity_leeway),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> Claims {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn audience_accepts_string_and_array_forms() {
        assert_eq!(claims(json!({"aud": "foo"})).aud, vec!["foo"]);
        assert_eq!(
            claims(json!({"aud": ["foo", "bar"]})).aud,
            vec!["foo", "bar"]
        );
    }

    #[test]
    fn scopes_accept_both_claim_names() {
        assert_eq!(
            claims(json!({"scope": "read write"})).scp,
            vec!["read", "write"]
        );
        assert_eq!(claims(json!({"scp": ["read"]})).scp, vec!["read"]);
    }

    #[test]
    fn issuer_must_be_trusted() {
        let expectation = Expectation {
            trusted_issuers: vec!["https://issuer.example".to_string()],
            ..Default::default()
        };

        assert_eq!(
            expectation.assert_claims(&claims(json!({"iss": "https://other.example"}))),
            Err(AssertionError::UntrustedIssuer)
        );
        assert_eq!(
            expectation.assert_claims(&claims(json!({}))),
            Err(AssertionError::UntrustedIssuer)
        );
        assert!(expectation
            .assert_claims(&claims(json!({"iss": "https://issuer.example"})))
            .is_ok());
    }

    #[test]
    fn audience_intersection_must_be_non_empty_when_configured() {
        let expectation = Expectation {
            audience: vec!["api".to_string()],
            ..Default::default()
        };

        assert_eq!(
            expectation.assert_claims(&claims(json!({"aud": ["web"]}))),
            Err(AssertionError::AudienceMismatch)
        );
        assert!(expectation
            .assert_claims(&claims(json!({"aud": ["web", "api"]})))
            .is_ok());
    }

    #[test]
    fn expiry_honors_the_leeway() {
        let expectation = Expectation::default();
        let now = Utc::now().timestamp();

        assert_eq!(
            expectation.assert_claims(&claims(json!({"exp": now - 60}))),
            Err(AssertionError::Expired)
        );
        // within the default 10s leeway
        assert!(expectation
            .assert_claims(&claims(json!({"exp": now - 5})))
            .is_ok());
    }

    #[test]
    fn not_before_honors_the_leeway() {
        let expectation = Expectation::default();
        let now = Utc::now().timestamp();

        assert_eq!(
            expectation.assert_claims(&claims(json!({"nbf": now + 60}))),
            Err(AssertionError::NotYetValid)
        );
        assert!(expectation
            .assert_claims(&claims(json!({"nbf": now + 5})))
            .is_ok());
    }

    #[test]
    fn scope_matching_strategies() {
        let exact = ScopesMatcher {
            matching_strategy: ScopeMatchingStrategy::Exact,
            values: vec!["read".to_string()],
        };
        assert!(exact.matches(&["read".to_string(), "write".to_string()]));
        assert!(!exact.matches(&["write".to_string()]));

        let wildcard = ScopesMatcher {
            matching_strategy: ScopeMatchingStrategy::Wildcard,
            values: vec!["foo.*".to_string()],
        };
        assert!(wildcard.matches(&["foo.bar".to_string()]));
        assert!(wildcard.matches(&["foo".to_string()]));
        assert!(!wildcard.matches(&["foobar".to_string()]));
    }

    #[test]
    fn default_algorithm_set_is_asymmetric_only() {
        let expectation = Expectation::default();
        assert!(expectation.assert_algorithm("RS256").is_ok());
        assert!(expectation.assert_algorithm("ES384").is_ok());
        assert!(matches!(
            expectation.assert_algorithm("HS256"),
            Err(AssertionError::AlgorithmNotAllowed(_))
        ));
        assert!(matches!(
            expectation.assert_algorithm("none"),
            Err(AssertionError::AlgorithmNotAllowed(_))
        ));
    }

    #[test]
    fn merge_keeps_prototype_values_for_empty_override_fields() {
        let prototype = Expectation {
            trusted_issuers: vec!["https://issuer.example".to_string()],
            audience: vec!["api".to_string()],
            ..Default::default()
        };
        let overrides = Expectation {
            audience: vec!["other".to_string()],
            ..Default::default()
        };

        let merged = prototype.merged_with(&overrides);
        assert_eq!(merged.trusted_issuers, prototype.trusted_issuers);
        assert_eq!(merged.audience, vec!["other"]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_value::<Expectation>(json!({"foo": "bar"}));
        assert!(result.is_err());
    }
}
