//! Template lookup: the resolver seam and its catalog implementations.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::CatalogError;

use super::entity::{TemplateEntity, LOCATION_ANNOTATION};

/// Resolves template names to template definitions.
#[async_trait]
pub trait TemplateResolver: Send + Sync {
    /// Returns the template named `name`, or `TemplateNotFound`.
    async fn find_template(&self, name: &str) -> Result<TemplateEntity, CatalogError>;

    /// Lists every known template, sorted by name.
    async fn list_templates(&self) -> Result<Vec<TemplateEntity>, CatalogError>;
}

/// Checks that a template name is usable as a lookup key.
pub fn validate_template_name(name: &str) -> Result<(), CatalogError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(CatalogError::InvalidTemplateName(name.to_string()))
    }
}

/// Catalog held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    templates: RwLock<HashMap<String, TemplateEntity>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a template. Names must be unique and the entity kind `Template`.
    pub fn register(&self, entity: TemplateEntity) -> Result<(), CatalogError> {
        validate_template_name(entity.name())?;
        if !entity.is_template() {
            return Err(CatalogError::Parse {
                path: entity.name().to_string(),
                message: format!("expected kind 'Template', found '{}'", entity.kind),
            });
        }

        let mut templates = self.templates.write().expect("catalog lock poisoned");
        if templates.contains_key(entity.name()) {
            return Err(CatalogError::DuplicateTemplate(entity.name().to_string()));
        }
        templates.insert(entity.name().to_string(), entity);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_template(self, entity: TemplateEntity) -> Result<Self, CatalogError> {
        self.register(entity)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.templates.read().expect("catalog lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TemplateResolver for InMemoryCatalog {
    async fn find_template(&self, name: &str) -> Result<TemplateEntity, CatalogError> {
        self.templates
            .read()
            .expect("catalog lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::TemplateNotFound(name.to_string()))
    }

    async fn list_templates(&self) -> Result<Vec<TemplateEntity>, CatalogError> {
        let mut templates: Vec<TemplateEntity> = self
            .templates
            .read()
            .expect("catalog lock poisoned")
            .values()
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(templates)
    }
}

/// Catalog loaded from the `*.yaml`/`*.yml` files of one directory.
///
/// Entities without a location annotation get a `file:` annotation pointing
/// at the file they were read from, so the file preparer can find their
/// skeleton next to them.
#[derive(Debug)]
pub struct DirectoryCatalog {
    root: PathBuf,
    inner: InMemoryCatalog,
}

impl DirectoryCatalog {
    /// Loads every template file directly under `dir` (non-recursive).
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let root = dir.as_ref().to_path_buf();
        let inner = InMemoryCatalog::new();

        let mut paths = Vec::new();
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            if path.is_dir() {
                continue;
            }
            let is_yaml = path
                .extension()
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            let entity = Self::load_file(path)?;
            debug!(template = %entity.name(), path = %path.display(), "Loaded template");
            inner.register(entity)?;
        }

        info!(dir = %root.display(), templates = inner.len(), "Template catalog loaded");
        Ok(Self { root, inner })
    }

    /// Parses one template file and stamps its location annotation.
    pub fn load_file(path: &Path) -> Result<TemplateEntity, CatalogError> {
        let path_str = path.display().to_string();
        let content = fs::read_to_string(path)?;

        let mut entity: TemplateEntity =
            serde_yaml::from_str(&content).map_err(|e| CatalogError::Parse {
                path: path_str.clone(),
                message: e.to_string(),
            })?;

        if !entity.is_template() {
            return Err(CatalogError::Parse {
                path: path_str,
                message: format!("expected kind 'Template', found '{}'", entity.kind),
            });
        }

        if !entity.metadata.annotations.contains_key(LOCATION_ANNOTATION) {
            let absolute = fs::canonicalize(path)?;
            entity.metadata.annotations.insert(
                LOCATION_ANNOTATION.to_string(),
                format!("file:{}", absolute.display()),
            );
        }

        Ok(entity)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl TemplateResolver for DirectoryCatalog {
    async fn find_template(&self, name: &str) -> Result<TemplateEntity, CatalogError> {
        self.inner.find_template(name).await
    }

    async fn list_templates(&self) -> Result<Vec<TemplateEntity>, CatalogError> {
        self.inner.list_templates().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::parse_location_annotation;
    use std::io::Write;
    use tempfile::tempdir;

    fn template_yaml(name: &str) -> String {
        format!(
            r#"
apiVersion: backstage.io/v1alpha1
kind: Template
metadata:
  name: {name}
spec:
  type: service
  templater: tera
  path: ./skeleton
  schema:
    required: [component_id]
"#
        )
    }

    #[tokio::test]
    async fn test_in_memory_find_and_not_found() {
        let catalog = InMemoryCatalog::new()
            .with_template(TemplateEntity::new("react", "cookiecutter"))
            .unwrap();

        let found = catalog.find_template("react").await.unwrap();
        assert_eq!(found.spec.templater, "cookiecutter");

        let err = catalog.find_template("vue").await.unwrap_err();
        assert!(matches!(err, CatalogError::TemplateNotFound(name) if name == "vue"));
    }

    #[test]
    fn test_in_memory_rejects_duplicates_and_bad_names() {
        let catalog = InMemoryCatalog::new();
        catalog.register(TemplateEntity::new("a", "tera")).unwrap();
        assert!(matches!(
            catalog.register(TemplateEntity::new("a", "tera")),
            Err(CatalogError::DuplicateTemplate(_))
        ));
        assert!(matches!(
            catalog.register(TemplateEntity::new("has space", "tera")),
            Err(CatalogError::InvalidTemplateName(_))
        ));
        assert!(validate_template_name("").is_err());
        assert!(validate_template_name("springboot-grpc_v1.2").is_ok());
    }

    #[tokio::test]
    async fn test_directory_catalog_loads_yaml_and_stamps_location() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("react.yaml"), template_yaml("react")).unwrap();
        fs::write(dir.path().join("go.yml"), template_yaml("go-service")).unwrap();
        fs::write(dir.path().join("README.md"), "not a template").unwrap();

        let catalog = DirectoryCatalog::load(dir.path()).unwrap();
        assert_eq!(catalog.len(), 2);

        let names: Vec<String> = catalog
            .list_templates()
            .await
            .unwrap()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["go-service", "react"]);

        let react = catalog.find_template("react").await.unwrap();
        let location = parse_location_annotation(&react).unwrap();
        assert_eq!(location.protocol, "file");
        assert!(location.location.ends_with("react.yaml"));
    }

    #[test]
    fn test_directory_catalog_rejects_other_kinds() {
        let dir = tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("component.yaml")).unwrap();
        write!(
            file,
            "apiVersion: v1\nkind: Component\nmetadata:\n  name: c\nspec:\n  templater: tera\n"
        )
        .unwrap();

        let err = DirectoryCatalog::load(dir.path()).unwrap_err();
        assert!(matches!(err, CatalogError::Parse { .. }));
    }

    #[test]
    fn test_directory_catalog_rejects_duplicate_names() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.yaml"), template_yaml("same")).unwrap();
        fs::write(dir.path().join("b.yaml"), template_yaml("same")).unwrap();

        assert!(matches!(
            DirectoryCatalog::load(dir.path()),
            Err(CatalogError::DuplicateTemplate(_))
        ));
    }
}
