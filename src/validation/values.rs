//! Submitted values: destination augmentation and JSON Schema validation.

use serde_json::{json, Value};

use crate::collaborators::GitDestination;
use crate::error::{ValidationError, ValueViolation};

/// Key of the optional repository location in submitted values.
pub const STORE_PATH_KEY: &str = "storePath";

/// Checks submitted values against a template schema.
pub trait ValuesValidator: Send + Sync {
    /// Returns every violation, not just the first one.
    fn validate(&self, values: &Value, schema: &Value) -> Result<(), ValidationError>;
}

/// [`ValuesValidator`] backed by the `jsonschema` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchemaValidator;

impl JsonSchemaValidator {
    pub fn new() -> Self {
        Self
    }
}

impl ValuesValidator for JsonSchemaValidator {
    fn validate(&self, values: &Value, schema: &Value) -> Result<(), ValidationError> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| ValidationError::InvalidSchema(e.to_string()))?;

        let violations: Vec<ValueViolation> = validator
            .iter_errors(values)
            .map(|e| ValueViolation {
                path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::InvalidValues(violations))
        }
    }
}

/// Adds `destination.git` parsed from `storePath`, when one is given.
///
/// Values without a `storePath` are returned unchanged. Non-object values are
/// left for the schema to reject.
pub fn augment_values(mut values: Value) -> Result<Value, ValidationError> {
    let Some(object) = values.as_object_mut() else {
        return Ok(values);
    };

    let store_path = match object.get(STORE_PATH_KEY) {
        None | Some(Value::Null) => return Ok(values),
        Some(Value::String(path)) => path.clone(),
        Some(other) => {
            return Err(ValidationError::InvalidStorePath {
                path: other.to_string(),
                reason: "must be a string".to_string(),
            })
        }
    };

    let destination = GitDestination::parse(&store_path).map_err(|reason| {
        ValidationError::InvalidStorePath {
            path: store_path.clone(),
            reason,
        }
    })?;

    object.insert(
        "destination".to_string(),
        json!({ "git": serde_json::to_value(&destination).unwrap_or(Value::Null) }),
    );
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["component_id", "owner"],
            "properties": {
                "component_id": { "type": "string", "minLength": 1 },
                "owner": { "type": "string" }
            }
        })
    }

    #[test]
    fn test_valid_values_pass() {
        let values = json!({"component_id": "foo", "owner": "team-a"});
        assert!(JsonSchemaValidator::new().validate(&values, &schema()).is_ok());
    }

    #[test]
    fn test_every_violation_is_reported() {
        let values = json!({"component_id": ""});
        let err = JsonSchemaValidator::new()
            .validate(&values, &schema())
            .unwrap_err();

        let violations = err.violations();
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().any(|v| v.path == "/component_id"));
        assert!(violations.iter().any(|v| v.message.contains("owner")));
    }

    #[test]
    fn test_invalid_schema_is_reported() {
        let err = JsonSchemaValidator::new()
            .validate(&json!({}), &json!({"type": 12}))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSchema(_)));
    }

    #[test]
    fn test_augment_adds_git_destination() {
        let values = augment_values(json!({
            "component_id": "woop",
            "storePath": "https://github.com/jhaals/foo"
        }))
        .unwrap();

        let git = &values["destination"]["git"];
        assert_eq!(git["host"], "github.com");
        assert_eq!(git["owner"], "jhaals");
        assert_eq!(git["name"], "foo");
        assert_eq!(values["component_id"], "woop");
    }

    #[test]
    fn test_augment_without_store_path_is_noop() {
        let values = json!({"component_id": "foo"});
        assert_eq!(augment_values(values.clone()).unwrap(), values);
    }

    #[test]
    fn test_augment_rejects_unparseable_store_path() {
        let err = augment_values(json!({"storePath": "not a url"})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidStorePath { .. }));
    }
}
