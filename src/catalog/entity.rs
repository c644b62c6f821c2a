//! Template entity model and location annotation parsing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CatalogError;

/// Annotation holding `<protocol>:<location>` of the file an entity came from.
pub const LOCATION_ANNOTATION: &str = "backstage.io/managed-by-location";

/// API version stamped on entities built in code.
pub const DEFAULT_API_VERSION: &str = "backstage.io/v1alpha1";

/// The only entity kind the scaffolder accepts.
pub const TEMPLATE_KIND: &str = "Template";

/// A template as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateEntity {
    pub api_version: String,
    pub kind: String,
    pub metadata: TemplateMetadata,
    pub spec: TemplateSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Kind of component the template produces (`website`, `service`, ...).
    #[serde(rename = "type", default)]
    pub component_type: String,
    /// Templater that renders the skeleton.
    pub templater: String,
    /// Skeleton directory relative to the template file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// JSON Schema the submitted values must satisfy.
    #[serde(default = "empty_schema")]
    pub schema: Value,
}

fn empty_schema() -> Value {
    Value::Object(Default::default())
}

impl TemplateEntity {
    /// Creates a template with an empty schema and no annotations.
    pub fn new(name: impl Into<String>, templater: impl Into<String>) -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            kind: TEMPLATE_KIND.to_string(),
            metadata: TemplateMetadata {
                name: name.into(),
                ..Default::default()
            },
            spec: TemplateSpec {
                component_type: "service".to_string(),
                templater: templater.into(),
                path: None,
                schema: empty_schema(),
            },
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.spec.schema = schema;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.spec.path = Some(path.into());
        self
    }

    pub fn with_location(mut self, protocol: &str, location: &str) -> Self {
        self.metadata.annotations.insert(
            LOCATION_ANNOTATION.to_string(),
            format!("{protocol}:{location}"),
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_template(&self) -> bool {
        self.kind == TEMPLATE_KIND
    }
}

/// Where a template's files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationSpec {
    /// `file`, `github`, `gitlab`, `url`, ...
    pub protocol: String,
    /// Path or URL of the template file.
    pub location: String,
}

/// Splits the location annotation on its first `:`.
///
/// `github:https://github.com/o/r/blob/main/t.yaml` yields protocol `github`
/// and the full URL as location.
pub fn parse_location_annotation(entity: &TemplateEntity) -> Result<LocationSpec, CatalogError> {
    let invalid = |reason: &str| CatalogError::InvalidLocation {
        template: entity.metadata.name.clone(),
        reason: reason.to_string(),
    };

    let annotation = entity
        .metadata
        .annotations
        .get(LOCATION_ANNOTATION)
        .ok_or_else(|| invalid(&format!("no {LOCATION_ANNOTATION} annotation")))?;

    let (protocol, location) = annotation
        .split_once(':')
        .ok_or_else(|| invalid("annotation must have the form <protocol>:<location>"))?;

    if protocol.is_empty() {
        return Err(invalid("empty protocol"));
    }
    if location.is_empty() {
        return Err(invalid("empty location"));
    }

    Ok(LocationSpec {
        protocol: protocol.to_string(),
        location: location.to_string(),
    })
}
