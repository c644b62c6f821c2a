//! Scaffolder configuration.
//!
//! Covers the worker loop (polling, timeouts), where task scratch space
//! lives, and the settings the built-in collaborators need (cookiecutter
//! image, git identity, GitHub API access).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configured working directory is missing.
    #[error("working directory {} does not exist", .0.display())]
    WorkingDirectoryMissing(PathBuf),

    /// The configured working directory cannot be written to.
    #[error("working directory {} is not writable", .0.display())]
    WorkingDirectoryNotWritable(PathBuf),

    /// IO error while checking configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the scaffolder service and its worker.
#[derive(Debug, Clone)]
pub struct ScaffolderConfig {
    // Worker settings
    /// Root for task scratch directories.
    pub working_directory: PathBuf,
    /// Upper bound on how long an idle worker waits before claiming again.
    pub poll_interval: Duration,
    /// Maximum run time of a single stage; `None` disables the limit.
    pub stage_timeout: Option<Duration>,
    /// How long shutdown waits for the in-flight task.
    pub shutdown_timeout: Duration,

    // Collaborator settings
    /// Image used by the cookiecutter templater.
    pub cookiecutter_image: String,
    /// Author of commits created by publishers.
    pub git_author_name: String,
    pub git_author_email: String,
    /// Token for the GitHub publisher.
    pub github_token: Option<String>,
    /// GitHub REST API base URL.
    pub github_api_url: String,
    /// Hosts whose existing repositories are pushed to with plain git.
    pub git_hosts: Vec<String>,
}

impl Default for ScaffolderConfig {
    fn default() -> Self {
        Self {
            working_directory: std::env::temp_dir(),
            poll_interval: Duration::from_millis(1000),
            stage_timeout: Some(Duration::from_secs(1800)), // 30 minutes
            shutdown_timeout: Duration::from_secs(60),

            cookiecutter_image: "spotify/backstage-cookiecutter".to_string(),
            git_author_name: "Scaffolder".to_string(),
            git_author_email: "scaffolder@localhost".to_string(),
            github_token: None,
            github_api_url: "https://api.github.com".to_string(),
            git_hosts: Vec::new(),
        }
    }
}

impl ScaffolderConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SCAFFOLDER_WORKING_DIRECTORY`: Scratch root (default: OS temp dir)
    /// - `SCAFFOLDER_POLL_INTERVAL_MS`: Idle poll interval (default: 1000)
    /// - `SCAFFOLDER_STAGE_TIMEOUT_SECS`: Stage timeout, 0 disables (default: 1800)
    /// - `SCAFFOLDER_SHUTDOWN_TIMEOUT_SECS`: Shutdown timeout (default: 60)
    /// - `SCAFFOLDER_COOKIECUTTER_IMAGE`: Cookiecutter image
    /// - `SCAFFOLDER_GIT_AUTHOR_NAME` / `SCAFFOLDER_GIT_AUTHOR_EMAIL`: Commit author
    /// - `GITHUB_TOKEN`: Token for creating repositories on GitHub
    /// - `SCAFFOLDER_GITHUB_API_URL`: GitHub API base URL
    /// - `SCAFFOLDER_GIT_HOSTS`: Comma-separated hosts for the plain git publisher
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// working directory is unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut custom_working_directory = false;

        if let Ok(val) = std::env::var("SCAFFOLDER_WORKING_DIRECTORY") {
            config.working_directory = PathBuf::from(val);
            custom_working_directory = true;
        }

        if let Ok(val) = std::env::var("SCAFFOLDER_POLL_INTERVAL_MS") {
            let millis: u64 = parse_env_value(&val, "SCAFFOLDER_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(millis);
        }

        if let Ok(val) = std::env::var("SCAFFOLDER_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SCAFFOLDER_STAGE_TIMEOUT_SECS")?;
            config.stage_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Ok(val) = std::env::var("SCAFFOLDER_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SCAFFOLDER_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("SCAFFOLDER_COOKIECUTTER_IMAGE") {
            config.cookiecutter_image = val;
        }

        if let Ok(val) = std::env::var("SCAFFOLDER_GIT_AUTHOR_NAME") {
            config.git_author_name = val;
        }

        if let Ok(val) = std::env::var("SCAFFOLDER_GIT_AUTHOR_EMAIL") {
            config.git_author_email = val;
        }

        if let Ok(val) = std::env::var("GITHUB_TOKEN") {
            if !val.trim().is_empty() {
                config.github_token = Some(val);
            }
        }

        if let Ok(val) = std::env::var("SCAFFOLDER_GITHUB_API_URL") {
            config.github_api_url = val;
        }

        if let Ok(val) = std::env::var("SCAFFOLDER_GIT_HOSTS") {
            config.git_hosts = parse_host_list(&val);
        }

        config.validate()?;
        if custom_working_directory {
            config.check_working_directory()?;
        }
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.cookiecutter_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "cookiecutter_image cannot be empty".to_string(),
            ));
        }

        if self.git_author_name.is_empty() || self.git_author_email.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "git author name and email cannot be empty".to_string(),
            ));
        }

        if self.git_hosts.iter().any(|h| h.is_empty() || h.contains('/')) {
            return Err(ConfigError::ValidationFailed(
                "git_hosts must be bare host names".to_string(),
            ));
        }

        if url::Url::parse(&self.github_api_url).is_err() {
            return Err(ConfigError::ValidationFailed(format!(
                "github_api_url '{}' is not a valid URL",
                self.github_api_url
            )));
        }

        Ok(())
    }

    /// Checks that the working directory exists and is writable.
    pub fn check_working_directory(&self) -> Result<(), ConfigError> {
        let dir = &self.working_directory;
        if !dir.is_dir() {
            return Err(ConfigError::WorkingDirectoryMissing(dir.clone()));
        }

        // write a real file; permission bits miss read-only mounts
        match tempfile::tempfile_in(dir) {
            Ok(_) => Ok(()),
            Err(_) => Err(ConfigError::WorkingDirectoryNotWritable(dir.clone())),
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_cookiecutter_image(mut self, image: impl Into<String>) -> Self {
        self.cookiecutter_image = image.into();
        self
    }

    pub fn with_git_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.git_author_name = name.into();
        self.git_author_email = email.into();
        self
    }

    pub fn with_github_token(mut self, token: impl Into<String>) -> Self {
        self.github_token = Some(token.into());
        self
    }

    pub fn with_github_api_url(mut self, url: impl Into<String>) -> Self {
        self.github_api_url = url.into();
        self
    }

    pub fn with_git_host(mut self, host: impl Into<String>) -> Self {
        self.git_hosts.push(host.into());
        self
    }
}

/// Splits a comma-separated host list, dropping blanks and duplicates.
fn parse_host_list(value: &str) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for host in value.split(',').map(str::trim).filter(|h| !h.is_empty()) {
        let host = host.to_ascii_lowercase();
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    hosts
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
