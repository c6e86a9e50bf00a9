//! The authenticated principal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The principal produced by an authenticator and carried through the rest
/// of the pipeline.
///
/// `attributes` is an open map: authenticators put the verified claims
/// here, authorizers and hydrators are free to decorate it further.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: Map<String, Value>,
}

impl Subject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attributes(id: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            attributes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_capitalized_field_names() {
        let mut sub = Subject::new("foo");
        sub.attributes
            .insert("groups".to_string(), json!(["admin"]));

        let value = serde_json::to_value(&sub).unwrap();
        assert_eq!(value["ID"], "foo");
        assert_eq!(value["Attributes"]["groups"][0], "admin");
    }
}
