//! Templaters turn a skeleton plus values into a result directory.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tera::{Context, Tera};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{render_chain, CollaboratorError, DockerError};
use crate::execution::{ContainerConfig, ContainerGuard};
use crate::pipeline::StageContext;

/// Selects a templater from `spec.templater`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplaterKind {
    Cookiecutter,
    Tera,
    Other(String),
}

impl From<&str> for TemplaterKind {
    fn from(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "cookiecutter" => Self::Cookiecutter,
            "tera" => Self::Tera,
            _ => Self::Other(name.to_string()),
        }
    }
}

impl fmt::Display for TemplaterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cookiecutter => write!(f, "cookiecutter"),
            Self::Tera => write!(f, "tera"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Renders a skeleton directory with the submitted values.
#[async_trait]
pub trait Templater: Send + Sync {
    /// Returns the directory holding the rendered project.
    async fn run(
        &self,
        skeleton_dir: &Path,
        values: &Value,
        ctx: &StageContext,
    ) -> Result<PathBuf, CollaboratorError>;
}

/// Registry of templaters keyed by [`TemplaterKind`].
#[derive(Clone, Default)]
pub struct Templaters {
    handlers: HashMap<TemplaterKind, Arc<dyn Templater>>,
}

impl Templaters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cookiecutter (Docker) and Tera templaters.
    pub fn with_defaults(cookiecutter_image: impl Into<String>) -> Self {
        Self::new()
            .with(
                TemplaterKind::Cookiecutter,
                CookiecutterTemplater::new(cookiecutter_image),
            )
            .with(TemplaterKind::Tera, TeraTemplater)
    }

    pub fn with(mut self, kind: TemplaterKind, templater: impl Templater + 'static) -> Self {
        self.register(kind, Arc::new(templater));
        self
    }

    pub fn register(&mut self, kind: TemplaterKind, templater: Arc<dyn Templater>) {
        self.handlers.insert(kind, templater);
    }

    pub fn get(&self, kind: &TemplaterKind) -> Result<Arc<dyn Templater>, CollaboratorError> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| CollaboratorError::NoHandler {
                role: "templater",
                key: kind.to_string(),
            })
    }
}

/// Renders every file and path name of the skeleton with Tera.
///
/// Values are available both at the top level (`{{ component_id }}`) and
/// under `values`. Files that are not UTF-8 are copied verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeraTemplater;

impl TeraTemplater {
    fn context(values: &Value) -> Result<Context, CollaboratorError> {
        let mut context = match values {
            Value::Object(_) => Context::from_serialize(values)?,
            _ => Context::new(),
        };
        context.insert("values", values);
        Ok(context)
    }

    fn render_str(template: &str, context: &Context, path: &str) -> Result<String, CollaboratorError> {
        Tera::one_off(template, context, false).map_err(|e| CollaboratorError::Render {
            path: path.to_string(),
            message: render_chain(&e),
        })
    }

    /// Renders `skeleton` into `result`. Returns the number of files written.
    pub fn render_tree(
        skeleton: &Path,
        result: &Path,
        values: &Value,
    ) -> Result<usize, CollaboratorError> {
        let context = Self::context(values)?;
        let mut written = 0;

        for entry in WalkDir::new(skeleton)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
        {
            let entry = entry.map_err(|e| CollaboratorError::Io(e.into()))?;
            let relative = entry
                .path()
                .strip_prefix(skeleton)
                .map_err(|e| CollaboratorError::Invalid(e.to_string()))?;
            let relative_str = relative.to_string_lossy();
            let target = result.join(Self::render_str(&relative_str, &context, &relative_str)?);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let bytes = fs::read(entry.path())?;
            match String::from_utf8(bytes) {
                Ok(text) => {
                    let rendered = Self::render_str(&text, &context, &relative_str)?;
                    fs::write(&target, rendered)?;
                }
                Err(binary) => {
                    debug!(path = %relative_str, "Copying binary file verbatim");
                    fs::write(&target, binary.into_bytes())?;
                }
            }
            written += 1;
        }

        Ok(written)
    }
}

#[async_trait]
impl Templater for TeraTemplater {
    async fn run(
        &self,
        skeleton_dir: &Path,
        values: &Value,
        ctx: &StageContext,
    ) -> Result<PathBuf, CollaboratorError> {
        let result_dir = ctx.scratch_dir("result-")?;
        ctx.logger()
            .info(format!("Rendering {} with tera", skeleton_dir.display()))
            .await;

        let skeleton = skeleton_dir.to_path_buf();
        let result = result_dir.clone();
        let values = values.clone();
        let written = tokio::task::spawn_blocking(move || {
            TeraTemplater::render_tree(&skeleton, &result, &values)
        })
        .await
        .map_err(|e| CollaboratorError::Panicked(e.to_string()))??;

        ctx.logger().info(format!("Rendered {written} files")).await;
        Ok(result_dir)
    }
}

/// Runs cookiecutter in a container with the skeleton bind-mounted.
///
/// Container output is forwarded line by line to the task log.
#[derive(Debug, Clone)]
pub struct CookiecutterTemplater {
    image: String,
}

impl CookiecutterTemplater {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Writes `cookiecutter.json` so `--no-input` picks up the values.
    fn write_values(skeleton_dir: &Path, values: &Value) -> Result<(), CollaboratorError> {
        let path = skeleton_dir.join("cookiecutter.json");
        let mut merged = match fs::read_to_string(&path) {
            Ok(existing) => serde_json::from_str::<Value>(&existing)?,
            Err(_) => Value::Object(Default::default()),
        };

        if let (Value::Object(target), Value::Object(source)) = (&mut merged, values) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }

        fs::write(&path, serde_json::to_vec_pretty(&merged)?)?;
        Ok(())
    }

    fn command() -> Vec<String> {
        ["cookiecutter", "--no-input", "-o", "/result", "/template", "--verbose"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

#[async_trait]
impl Templater for CookiecutterTemplater {
    async fn run(
        &self,
        skeleton_dir: &Path,
        values: &Value,
        ctx: &StageContext,
    ) -> Result<PathBuf, CollaboratorError> {
        let docker = ctx.docker()?;
        docker.ping().await?;

        Self::write_values(skeleton_dir, values)?;
        let result_dir = ctx.scratch_dir("result-")?;

        docker.ensure_image(&self.image).await?;

        let config = ContainerConfig::new(format!("scaffolder-{}", uuid::Uuid::new_v4()), &self.image)
            .with_cmd(Self::command())
            .with_volume(&skeleton_dir.display().to_string(), "/template")
            .with_volume(&result_dir.display().to_string(), "/result");

        let container_id = docker.create_container(config).await?;
        let container = ContainerGuard::new(Arc::clone(docker), container_id.clone());
        ctx.logger()
            .info(format!("Running {} in container {}", self.image, container_id))
            .await;

        let outcome = async {
            docker.start_container(&container_id).await?;

            let mut logs = Box::pin(docker.follow_logs(&container_id));
            while let Some(chunk) = logs.next().await {
                ctx.logger().lines(&chunk?).await;
            }

            docker.wait_container(&container_id).await
        }
        .await;

        if let Err(e) = container.remove().await {
            warn!(container_id = %container_id, error = %e, "Failed to remove container");
        }

        match outcome? {
            0 => Ok(result_dir),
            exit_code => Err(DockerError::NonZeroExit { exit_code }.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_templater_kind_from_name() {
        assert_eq!(TemplaterKind::from("cookiecutter"), TemplaterKind::Cookiecutter);
        assert_eq!(TemplaterKind::from("Tera"), TemplaterKind::Tera);
        assert_eq!(
            TemplaterKind::from("handlebars"),
            TemplaterKind::Other("handlebars".to_string())
        );
        assert_eq!(TemplaterKind::Other("cra".to_string()).to_string(), "cra");
    }

    #[test]
    fn test_registry_reports_missing_handler() {
        let templaters = Templaters::new().with(TemplaterKind::Tera, TeraTemplater);
        assert!(templaters.get(&TemplaterKind::Tera).is_ok());
        let err = templaters.get(&TemplaterKind::Cookiecutter).err().unwrap();
        assert!(err.to_string().contains("cookiecutter"));
    }

    #[test]
    fn test_render_tree_renders_contents_and_names() {
        let skeleton = tempdir().unwrap();
        let result = tempdir().unwrap();
        fs::create_dir_all(skeleton.path().join("{{ component_id }}/src")).unwrap();
        fs::write(
            skeleton.path().join("{{ component_id }}/README.md"),
            "# {{ component_id }}\nOwned by {{ values.owner }}\n",
        )
        .unwrap();
        fs::write(
            skeleton.path().join("{{ component_id }}/src/logo.bin"),
            [0xff_u8, 0xfe, 0x00, 0x7b, 0x7b],
        )
        .unwrap();

        let values = json!({"component_id": "foo", "owner": "team-a"});
        let written = TeraTemplater::render_tree(skeleton.path(), result.path(), &values).unwrap();

        assert_eq!(written, 2);
        let readme = fs::read_to_string(result.path().join("foo/README.md")).unwrap();
        assert_eq!(readme, "# foo\nOwned by team-a\n");
        let logo = fs::read(result.path().join("foo/src/logo.bin")).unwrap();
        assert_eq!(logo, vec![0xff, 0xfe, 0x00, 0x7b, 0x7b]);
    }

    #[test]
    fn test_render_tree_reports_failing_file() {
        let skeleton = tempdir().unwrap();
        let result = tempdir().unwrap();
        fs::write(skeleton.path().join("broken.txt"), "{{ missing_value }}").unwrap();

        let err = TeraTemplater::render_tree(skeleton.path(), result.path(), &json!({}))
            .unwrap_err();
        match err {
            CollaboratorError::Render { path, .. } => assert_eq!(path, "broken.txt"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cookiecutter_values_are_merged() {
        let skeleton = tempdir().unwrap();
        fs::write(
            skeleton.path().join("cookiecutter.json"),
            r#"{"component_id": "default", "http_port": 8080}"#,
        )
        .unwrap();

        CookiecutterTemplater::write_values(skeleton.path(), &json!({"component_id": "foo"}))
            .unwrap();

        let merged: Value = serde_json::from_str(
            &fs::read_to_string(skeleton.path().join("cookiecutter.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(merged["component_id"], "foo");
        assert_eq!(merged["http_port"], 8080);
    }
}
