//! Preparers fetch a template's skeleton into a scratch directory.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::catalog::{LocationSpec, TemplateEntity};
use crate::error::CollaboratorError;
use crate::pipeline::StageContext;

use super::copy_dir;
use super::git::run_git;

/// Selects a preparer from a template's location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PreparerKey {
    /// Template read from the local filesystem.
    File,
    /// Template hosted on a remote (`github.com`, `gitlab.com`, ...).
    Host(String),
}

impl PreparerKey {
    /// `file` protocol maps to `File`; anything else to the host of the
    /// location URL.
    pub fn for_location(location: &LocationSpec) -> Result<Self, CollaboratorError> {
        if location.protocol == "file" {
            return Ok(Self::File);
        }

        let url = Url::parse(&location.location).map_err(|e| {
            CollaboratorError::Invalid(format!(
                "location '{}' is not a URL: {e}",
                location.location
            ))
        })?;
        let host = url.host_str().ok_or_else(|| {
            CollaboratorError::Invalid(format!("location '{}' has no host", location.location))
        })?;

        Ok(Self::Host(host.to_string()))
    }
}

impl fmt::Display for PreparerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Host(host) => write!(f, "{host}"),
        }
    }
}

/// Produces the skeleton directory for a template.
#[async_trait]
pub trait Preparer: Send + Sync {
    async fn prepare(
        &self,
        template: &TemplateEntity,
        location: &LocationSpec,
        ctx: &StageContext,
    ) -> Result<PathBuf, CollaboratorError>;
}

/// Registry of preparers keyed by [`PreparerKey`].
#[derive(Clone, Default)]
pub struct Preparers {
    handlers: HashMap<PreparerKey, Arc<dyn Preparer>>,
}

impl Preparers {
    pub fn new() -> Self {
        Self::default()
    }

    /// File preparer plus git preparers for github.com and gitlab.com.
    pub fn with_defaults() -> Self {
        Self::new()
            .with(PreparerKey::File, FilePreparer)
            .with(PreparerKey::Host("github.com".to_string()), GitPreparer)
            .with(PreparerKey::Host("gitlab.com".to_string()), GitPreparer)
    }

    pub fn with(mut self, key: PreparerKey, preparer: impl Preparer + 'static) -> Self {
        self.register(key, Arc::new(preparer));
        self
    }

    pub fn register(&mut self, key: PreparerKey, preparer: Arc<dyn Preparer>) {
        self.handlers.insert(key, preparer);
    }

    pub fn get(&self, key: &PreparerKey) -> Result<Arc<dyn Preparer>, CollaboratorError> {
        self.handlers
            .get(key)
            .cloned()
            .ok_or_else(|| CollaboratorError::NoHandler {
                role: "preparer",
                key: key.to_string(),
            })
    }

    pub fn keys(&self) -> Vec<&PreparerKey> {
        self.handlers.keys().collect()
    }
}

/// Joins a template's `spec.path` onto the directory holding its file.
fn skeleton_source(template_dir: &Path, template: &TemplateEntity) -> PathBuf {
    match template.spec.path.as_deref() {
        Some(path) if !path.is_empty() => template_dir.join(path),
        _ => template_dir.to_path_buf(),
    }
}

/// Copies a skeleton that lives next to a template file on local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilePreparer;

#[async_trait]
impl Preparer for FilePreparer {
    async fn prepare(
        &self,
        template: &TemplateEntity,
        location: &LocationSpec,
        ctx: &StageContext,
    ) -> Result<PathBuf, CollaboratorError> {
        let template_file = PathBuf::from(&location.location);
        let template_dir = template_file
            .parent()
            .ok_or_else(|| {
                CollaboratorError::Invalid(format!(
                    "location '{}' has no parent directory",
                    location.location
                ))
            })?
            .to_path_buf();
        let source = skeleton_source(&template_dir, template);

        let skeleton_dir = ctx.scratch_dir("skeleton-")?;
        ctx.logger()
            .info(format!(
                "Copying skeleton from {} to {}",
                source.display(),
                skeleton_dir.display()
            ))
            .await;

        let copied = copy_dir(source, skeleton_dir.clone()).await?;
        ctx.logger().info(format!("Copied {copied} files")).await;

        Ok(skeleton_dir)
    }
}

/// Where a hosted template file lives inside its repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RepositoryLocation {
    pub clone_url: String,
    pub reference: Option<String>,
    /// Directory of the template file, relative to the repository root.
    pub directory: PathBuf,
}

impl RepositoryLocation {
    /// Understands `https://host/owner/repo/blob/<ref>/<path>` (and `tree`,
    /// and GitLab's `/-/blob/`). Anything else is treated as a plain
    /// repository URL with the template at its root.
    pub(crate) fn parse(location: &str) -> Result<Self, CollaboratorError> {
        let url = Url::parse(location).map_err(|e| {
            CollaboratorError::Invalid(format!("location '{location}' is not a URL: {e}"))
        })?;
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        let marker = segments
            .iter()
            .position(|seg| *seg == "blob" || *seg == "tree");

        let (repo_segments, reference, file_segments) = match marker {
            Some(i) if i + 1 < segments.len() => {
                let repo_end = if i > 0 && segments[i - 1] == "-" { i - 1 } else { i };
                (
                    &segments[..repo_end],
                    Some(segments[i + 1].to_string()),
                    &segments[i + 2..],
                )
            }
            _ => (&segments[..], None, &segments[segments.len()..]),
        };

        if repo_segments.len() < 2 {
            return Err(CollaboratorError::Invalid(format!(
                "location '{location}' does not name a repository"
            )));
        }

        let mut clone_url = url.clone();
        clone_url.set_query(None);
        clone_url.set_fragment(None);
        let repo_path = repo_segments.join("/");
        let repo_path = repo_path.strip_suffix(".git").unwrap_or(&repo_path);
        clone_url.set_path(&format!("{repo_path}.git"));

        // the last segment is the template file itself
        let directory = match file_segments.split_last() {
            Some((_, dirs)) => dirs.iter().collect(),
            None => PathBuf::new(),
        };

        Ok(Self {
            clone_url: clone_url.to_string(),
            reference,
            directory,
        })
    }
}

/// Shallow-clones the repository that hosts a template.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitPreparer;

#[async_trait]
impl Preparer for GitPreparer {
    async fn prepare(
        &self,
        template: &TemplateEntity,
        location: &LocationSpec,
        ctx: &StageContext,
    ) -> Result<PathBuf, CollaboratorError> {
        let repo = RepositoryLocation::parse(&location.location)?;
        let checkout = ctx.scratch_dir("checkout-")?;

        ctx.logger()
            .info(format!("Cloning {}", repo.clone_url))
            .await;

        let mut args = vec!["clone", "--quiet", "--depth", "1"];
        if let Some(reference) = repo.reference.as_deref() {
            args.extend(["--branch", reference]);
        }
        let target = checkout.display().to_string();
        args.extend([repo.clone_url.as_str(), target.as_str()]);
        run_git(ctx.working_directory(), &args).await?;

        let source = skeleton_source(&checkout.join(&repo.directory), template);
        if !source.is_dir() {
            return Err(CollaboratorError::Invalid(format!(
                "skeleton directory {} not found in repository",
                source.display()
            )));
        }

        Ok(source)
    }
}
