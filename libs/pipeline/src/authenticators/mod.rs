//! Authenticators: pipeline steps producing a [`Subject`].

mod anonymous;
mod generic;
mod jwt;
mod oauth2_introspection;

pub use anonymous::AnonymousAuthenticator;
pub use generic::GenericAuthenticator;
pub use jwt::JwtAuthenticator;
pub use oauth2_introspection::OAuth2IntrospectionAuthenticator;

pub(crate) use anonymous::factory as anonymous_factory;
pub(crate) use generic::factory as generic_factory;
pub(crate) use jwt::factory as jwt_factory;
pub(crate) use oauth2_introspection::factory as oauth2_introspection_factory;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::subject::Subject;

fn default_id_claim() -> String {
    "sub".to_string()
}

/// Describes how a [`Subject`] is derived from a verified claim set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubjectInfo {
    /// Dotted path to the claim carrying the subject id.
    #[serde(default = "default_id_claim")]
    pub id: String,

    /// Optional dotted path selecting the attribute source. The whole claim
    /// set is used when unset.
    #[serde(default)]
    pub attributes: Option<String>,
}

impl Default for SubjectInfo {
    fn default() -> Self {
        Self {
            id: default_id_claim(),
            attributes: None,
        }
    }
}

impl SubjectInfo {
    pub fn create_subject(&self, claims: &Value) -> Result<Subject> {
        let id = match lookup(claims, &self.id) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(PipelineError::internal(format!(
                    "no usable value under '{}' to use as subject id",
                    self.id
                )))
            }
        };

        let attribute_source = match &self.attributes {
            None => claims,
            Some(path) => lookup(claims, path).ok_or_else(|| {
                PipelineError::internal(format!("no value under '{path}' to use as attributes"))
            })?,
        };

        let attributes = attribute_source
            .as_object()
            .cloned()
            .ok_or_else(|| PipelineError::internal("attribute source is not an object"))?;

        Ok(Subject::with_attributes(id, attributes))
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}
