use crate::validation::Validation;
use serde::{Deserialize, Serialize};

/// A typed parameter definition. The `schema` is a JSON-Schema-shaped
/// object; only its `type` and `default` members are interpreted by the
/// engine. `secure` means every stored value for this key must be a
/// [`crate::SecureData`] envelope encrypted to the owning object's
/// public key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub documentation: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub schema: serde_json::Value,
    #[serde(flatten)]
    pub validation: Validation,
}

impl Param {
    /// The declared default, if the schema carries one.
    pub fn default_value(&self) -> Option<serde_json::Value> {
        self.schema.get("default").cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_value_from_schema() {
        let p = Param {
            name: "ntp-server".to_owned(),
            schema: json!({"type": "string", "default": "pool.ntp.org"}),
            ..Param::default()
        };
        assert_eq!(p.default_value(), Some(json!("pool.ntp.org")));
    }

    #[test]
    fn no_default_when_absent() {
        let p = Param::default();
        assert_eq!(p.default_value(), None);
    }
}
