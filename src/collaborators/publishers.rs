//! Publishers store a rendered project somewhere durable.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::CollaboratorError;
use crate::pipeline::{ContextDelta, ScaffolderConfig, StageContext};
use crate::validation::STORE_PATH_KEY;

use super::copy_dir;
use super::git::{init_commit_and_push, GitCredentials, GitDestination};

/// Selects a publisher from the `storePath` destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PublisherKey {
    /// `file://` destinations.
    File,
    /// Remote repository host.
    Host(String),
}

impl PublisherKey {
    pub fn for_destination(destination: &GitDestination) -> Self {
        if destination.is_file() {
            Self::File
        } else {
            Self::Host(destination.host.clone())
        }
    }

    /// Parses `storePath` out of submitted values.
    pub fn from_values(values: &Value) -> Result<(Self, GitDestination), CollaboratorError> {
        let store_path = values
            .get(STORE_PATH_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CollaboratorError::Invalid(format!("values have no '{STORE_PATH_KEY}'"))
            })?;
        let destination = GitDestination::parse(store_path).map_err(CollaboratorError::Invalid)?;
        Ok((Self::for_destination(&destination), destination))
    }
}

impl fmt::Display for PublisherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Host(host) => write!(f, "{host}"),
        }
    }
}

/// Where a published project ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    /// Browsable location of the new repository or directory.
    pub location: String,
    /// Location of the project's catalog descriptor, if the publisher knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_info_url: Option<String>,
}

impl PublishResult {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            catalog_info_url: None,
        }
    }

    pub fn with_catalog_info_url(mut self, url: impl Into<String>) -> Self {
        self.catalog_info_url = Some(url.into());
        self
    }

    pub fn into_delta(self) -> ContextDelta {
        let mut delta = ContextDelta::new();
        delta.insert("location".to_string(), Value::String(self.location));
        if let Some(url) = self.catalog_info_url {
            delta.insert("catalog_info_url".to_string(), Value::String(url));
        }
        delta
    }
}

/// Stores the rendered project.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        result_dir: &Path,
        destination: &GitDestination,
        ctx: &StageContext,
    ) -> Result<PublishResult, CollaboratorError>;
}

/// Registry of publishers keyed by [`PublisherKey`].
#[derive(Clone, Default)]
pub struct Publishers {
    handlers: HashMap<PublisherKey, Arc<dyn Publisher>>,
}

impl Publishers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory publisher for `file://` targets, a plain git publisher for
    /// each of `config.git_hosts`, and the GitHub publisher when a token is
    /// configured. The GitHub publisher takes precedence for `github.com`.
    pub fn with_defaults(config: &ScaffolderConfig) -> Self {
        let mut publishers = Self::new().with(PublisherKey::File, DirectoryPublisher::new());
        for host in &config.git_hosts {
            publishers = publishers.with(
                PublisherKey::Host(host.clone()),
                GitPublisher::new(&config.git_author_name, &config.git_author_email),
            );
        }
        if let Some(token) = &config.github_token {
            publishers = publishers.with(
                PublisherKey::Host("github.com".to_string()),
                GithubPublisher::new(&config.github_api_url, token)
                    .with_author(&config.git_author_name, &config.git_author_email),
            );
        }
        publishers
    }

    pub fn with(mut self, key: PublisherKey, publisher: impl Publisher + 'static) -> Self {
        self.register(key, Arc::new(publisher));
        self
    }

    pub fn register(&mut self, key: PublisherKey, publisher: Arc<dyn Publisher>) {
        self.handlers.insert(key, publisher);
    }

    pub fn get(&self, key: &PublisherKey) -> Result<Arc<dyn Publisher>, CollaboratorError> {
        self.handlers
            .get(key)
            .cloned()
            .ok_or_else(|| CollaboratorError::NoHandler {
                role: "publisher",
                key: key.to_string(),
            })
    }
}

/// Copies the project into a local directory.
///
/// With a root configured, the project lands in `<root>/<name>`; otherwise
/// the `file://` destination path is used as is.
#[derive(Debug, Clone, Default)]
pub struct DirectoryPublisher {
    root: Option<PathBuf>,
}

impl DirectoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn target(&self, destination: &GitDestination) -> Result<PathBuf, CollaboratorError> {
        if let Some(root) = &self.root {
            return Ok(root.join(&destination.name));
        }
        url::Url::parse(&destination.href)
            .ok()
            .and_then(|u| u.to_file_path().ok())
            .ok_or_else(|| {
                CollaboratorError::Invalid(format!(
                    "'{}' is not a local directory",
                    destination.href
                ))
            })
    }
}

#[async_trait]
impl Publisher for DirectoryPublisher {
    async fn publish(
        &self,
        result_dir: &Path,
        destination: &GitDestination,
        ctx: &StageContext,
    ) -> Result<PublishResult, CollaboratorError> {
        let target = self.target(destination)?;
        if target.exists() && std::fs::read_dir(&target)?.next().is_some() {
            return Err(CollaboratorError::Invalid(format!(
                "{} already exists and is not empty",
                target.display()
            )));
        }

        ctx.logger()
            .info(format!("Copying result to {}", target.display()))
            .await;
        copy_dir(result_dir.to_path_buf(), target.clone()).await?;

        let location = url::Url::from_directory_path(&target)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("file://{}", target.display()));
        let catalog_info = target.join("catalog-info.yaml");

        let mut result = PublishResult::new(location);
        if catalog_info.is_file() {
            result = result.with_catalog_info_url(format!("file://{}", catalog_info.display()));
        }
        Ok(result)
    }
}

/// Pushes the project to an existing remote repository.
#[derive(Debug, Clone)]
pub struct GitPublisher {
    author_name: String,
    author_email: String,
}

impl GitPublisher {
    pub fn new(author_name: impl Into<String>, author_email: impl Into<String>) -> Self {
        Self {
            author_name: author_name.into(),
            author_email: author_email.into(),
        }
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(
        &self,
        result_dir: &Path,
        destination: &GitDestination,
        ctx: &StageContext,
    ) -> Result<PublishResult, CollaboratorError> {
        ctx.logger()
            .info(format!("Pushing to {}", destination.href))
            .await;
        init_commit_and_push(
            result_dir,
            &destination.href,
            &self.author_name,
            &self.author_email,
            None,
        )
        .await?;

        Ok(PublishResult::new(destination.href.clone()))
    }
}

/// Creates a GitHub repository through the REST API, then pushes to it.
#[derive(Debug, Clone)]
pub struct GithubPublisher {
    client: reqwest::Client,
    api_url: String,
    credentials: GitCredentials,
    author_name: String,
    author_email: String,
}

#[derive(Debug, Deserialize)]
struct GithubOwner {
    #[serde(rename = "type")]
    owner_type: String,
}

#[derive(Debug, Deserialize)]
struct GithubRepository {
    html_url: String,
    clone_url: String,
    #[serde(default)]
    default_branch: Option<String>,
}

impl GithubPublisher {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            credentials: GitCredentials::new("x-access-token", token),
            author_name: "Scaffolder".to_string(),
            author_email: "scaffolder@localhost".to_string(),
        }
    }

    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("User-Agent", "scaffolder/0.1")
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("Authorization", format!("Bearer {}", self.credentials.token()))
    }

    /// Organisations and users have different creation endpoints.
    async fn create_repository(
        &self,
        destination: &GitDestination,
        description: Option<&str>,
    ) -> Result<GithubRepository, CollaboratorError> {
        let owner_url = format!("{}/users/{}", self.api_url, destination.owner);
        let response = self.request(reqwest::Method::GET, &owner_url).send().await?;
        if !response.status().is_success() {
            return Err(CollaboratorError::Http(format!(
                "looking up owner '{}' returned {}",
                destination.owner,
                response.status()
            )));
        }
        let owner: GithubOwner = response.json().await?;

        let create_url = if owner.owner_type == "Organization" {
            format!("{}/orgs/{}/repos", self.api_url, destination.owner)
        } else {
            format!("{}/user/repos", self.api_url)
        };

        let response = self
            .request(reqwest::Method::POST, &create_url)
            .json(&json!({
                "name": destination.name,
                "description": description.unwrap_or_default(),
                "private": false,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Http(format!(
                "creating repository {} returned {status}: {body}",
                destination.full_name()
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl Publisher for GithubPublisher {
    async fn publish(
        &self,
        result_dir: &Path,
        destination: &GitDestination,
        ctx: &StageContext,
    ) -> Result<PublishResult, CollaboratorError> {
        let description = ctx.values().get("description").and_then(Value::as_str);

        ctx.logger()
            .info(format!("Creating repository {}", destination.full_name()))
            .await;
        let repository = self.create_repository(destination, description).await?;
        info!(repository = %repository.html_url, "Created GitHub repository");

        ctx.logger()
            .info(format!("Pushing to {}", repository.html_url))
            .await;
        init_commit_and_push(
            result_dir,
            &repository.clone_url,
            &self.author_name,
            &self.author_email,
            Some(&self.credentials),
        )
        .await?;

        let branch = repository.default_branch.as_deref().unwrap_or("main");
        Ok(PublishResult::new(repository.html_url.clone()).with_catalog_info_url(format!(
            "{}/blob/{branch}/catalog-info.yaml",
            repository.html_url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TemplateEntity;
    use crate::pipeline::TaskLogger;
    use crate::tasks::{MemoryTaskBroker, TaskBroker, TaskSpec};
    use std::fs;

    #[test]
    fn test_publisher_key_from_values() {
        let (key, dest) =
            PublisherKey::from_values(&json!({"storePath": "https://github.com/org/repo"}))
                .unwrap();
        assert_eq!(key, PublisherKey::Host("github.com".to_string()));
        assert_eq!(dest.full_name(), "org/repo");

        let (key, _) =
            PublisherKey::from_values(&json!({"storePath": "file:///tmp/out/repo"})).unwrap();
        assert_eq!(key, PublisherKey::File);

        assert!(PublisherKey::from_values(&json!({})).is_err());
    }

    #[test]
    fn test_publish_result_into_delta() {
        let delta = PublishResult::new("https://repo/foo")
            .with_catalog_info_url("https://repo/foo/blob/main/catalog-info.yaml")
            .into_delta();
        assert_eq!(delta["location"], "https://repo/foo");
        assert!(delta.contains_key("catalog_info_url"));

        let bare = PublishResult::new("https://repo/foo").into_delta();
        assert_eq!(bare.len(), 1);
    }

    #[test]
    fn test_registry_reports_missing_handler() {
        let publishers = Publishers::new().with(PublisherKey::File, DirectoryPublisher::new());
        let err = publishers
            .get(&PublisherKey::Host("github.com".to_string()))
            .err()
            .unwrap();
        assert!(matches!(err, CollaboratorError::NoHandler { role: "publisher", .. }));
    }

    #[test]
    fn test_defaults_register_github_only_with_token() {
        let config = ScaffolderConfig::default();
        let github = PublisherKey::Host("github.com".to_string());
        assert!(Publishers::with_defaults(&config).get(&github).is_err());
        assert!(Publishers::with_defaults(&config).get(&PublisherKey::File).is_ok());

        let config = config.with_github_token("ghp_test");
        assert!(Publishers::with_defaults(&config).get(&github).is_ok());
    }

    #[test]
    fn test_defaults_register_git_publisher_for_configured_hosts() {
        let config = ScaffolderConfig::default()
            .with_git_host("git.example.com")
            .with_git_host("github.com");
        let publishers = Publishers::with_defaults(&config);
        assert!(publishers
            .get(&PublisherKey::Host("git.example.com".to_string()))
            .is_ok());
        assert!(publishers
            .get(&PublisherKey::Host("gitlab.com".to_string()))
            .is_err());

        let (key, _) = PublisherKey::from_values(
            &json!({"storePath": "https://git.example.com/team/service.git"}),
        )
        .unwrap();
        assert!(publishers.get(&key).is_ok());

        // without a token github.com falls back to plain git
        let github = PublisherKey::Host("github.com".to_string());
        assert!(publishers.get(&github).is_ok());
    }

    #[test]
    fn test_github_publisher_hides_token() {
        let publisher = GithubPublisher::new("https://api.github.com/", "ghp_secret");
        assert_eq!(publisher.api_url, "https://api.github.com");
        assert_eq!(publisher.credentials.token(), "ghp_secret");
        assert!(!format!("{publisher:?}").contains("ghp_secret"));
    }

    #[tokio::test]
    async fn test_directory_publisher_copies_result() {
        let result = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fs::write(result.path().join("catalog-info.yaml"), "kind: Component").unwrap();

        let broker = Arc::new(MemoryTaskBroker::new());
        broker
            .dispatch(TaskSpec::new(TemplateEntity::new("t", "tera"), json!({})))
            .await
            .unwrap();
        let task = broker.claim().await.unwrap().unwrap();
        let ctx = StageContext::new(&task, TaskLogger::new(broker, task.id), out.path());

        let destination = GitDestination::parse("file:///ignored/my-service").unwrap();
        let published = DirectoryPublisher::with_root(out.path())
            .publish(result.path(), &destination, &ctx)
            .await
            .unwrap();

        assert!(out.path().join("my-service/catalog-info.yaml").is_file());
        assert!(published.location.starts_with("file://"));
        assert!(published.catalog_info_url.is_some());
    }
}
