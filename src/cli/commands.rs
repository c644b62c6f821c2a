//! CLI command definitions for the scaffolder.
//!
//! `run` is the interesting one: it submits a task, runs an in-process
//! worker and prints the task's event stream as `event:<json>` lines until
//! the completion event arrives.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::{DirectoryCatalog, TemplateResolver};
use crate::collaborators::{DirectoryPublisher, PublisherKey};
use crate::error::SubmitError;
use crate::execution::DockerClient;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{ScaffolderConfig, ScaffolderPipeline};
use crate::service::Scaffolder;
use crate::tasks::{EventBody, TaskStatus};

/// Default directory holding template files.
const DEFAULT_CATALOG_DIR: &str = "./templates";

/// Materialize software projects from templates.
#[derive(Parser)]
#[command(name = "scaffolder")]
#[command(about = "Create projects from templates through a prepare/template/publish pipeline")]
#[command(version)]
#[command(
    long_about = "scaffolder resolves a template from a catalog directory, validates the supplied values against the template schema, and runs the prepare, template and publish stages while streaming task events.\n\nExample usage:\n  scaffolder run --template react-ssr --values '{\"component_id\":\"foo\",\"storePath\":\"file:///tmp/foo\"}'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// List the templates of a catalog directory.
    #[command(alias = "ls")]
    Templates(TemplatesArgs),

    /// Check values against a template without creating a task.
    Validate(ValidateArgs),

    /// Submit a task and stream its events until it completes.
    Run(RunArgs),
}

/// Arguments for `scaffolder templates`.
#[derive(Parser, Debug)]
pub struct TemplatesArgs {
    /// Directory of template YAML files.
    #[arg(short, long, default_value = DEFAULT_CATALOG_DIR)]
    pub catalog: PathBuf,

    /// Output JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `scaffolder validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Directory of template YAML files.
    #[arg(short, long, default_value = DEFAULT_CATALOG_DIR)]
    pub catalog: PathBuf,

    /// Template name.
    #[arg(short, long)]
    pub template: String,

    /// Values as inline JSON, or `@path` to read them from a file.
    #[arg(short, long, default_value = "{}")]
    pub values: String,
}

/// Arguments for `scaffolder run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory of template YAML files.
    #[arg(short, long, default_value = DEFAULT_CATALOG_DIR)]
    pub catalog: PathBuf,

    /// Template name.
    #[arg(short, long)]
    pub template: String,

    /// Values as inline JSON, or `@path` to read them from a file.
    #[arg(short, long, default_value = "{}")]
    pub values: String,

    /// Root for task scratch directories (overrides SCAFFOLDER_WORKING_DIRECTORY).
    #[arg(short = 'w', long)]
    pub working_dir: Option<PathBuf>,

    /// Publish `file://` destinations under this directory instead of their own path.
    #[arg(long)]
    pub publish_dir: Option<PathBuf>,

    /// Only print events after this offset.
    #[arg(long)]
    pub after: Option<u64>,

    /// Print Prometheus metrics to stderr when the task is done.
    #[arg(long)]
    pub metrics: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Templates(args) => run_templates_command(args).await,
        Commands::Validate(args) => run_validate_command(args).await,
        Commands::Run(args) => run_run_command(args).await,
    }
}

fn load_catalog(dir: &Path) -> anyhow::Result<Arc<DirectoryCatalog>> {
    let catalog = DirectoryCatalog::load(dir)
        .with_context(|| format!("failed to load catalog from {}", dir.display()))?;
    info!(catalog = %dir.display(), templates = catalog.len(), "Loaded template catalog");
    Ok(Arc::new(catalog))
}

/// Inline JSON, or `@file` holding JSON.
fn parse_values(raw: &str) -> anyhow::Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read values file {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("values are not valid JSON")
}

async fn run_templates_command(args: TemplatesArgs) -> anyhow::Result<()> {
    let catalog = load_catalog(&args.catalog)?;
    let templates = catalog.list_templates().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&templates)?);
        return Ok(());
    }

    if templates.is_empty() {
        println!("No templates found in {}", args.catalog.display());
        return Ok(());
    }

    println!("{:<32} {:<14} {}", "NAME", "TEMPLATER", "TITLE");
    for template in &templates {
        println!(
            "{:<32} {:<14} {}",
            template.name(),
            template.spec.templater,
            template.metadata.title.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run_validate_command(args: ValidateArgs) -> anyhow::Result<()> {
    let scaffolder = Scaffolder::in_memory(load_catalog(&args.catalog)?);
    let values = parse_values(&args.values)?;

    match scaffolder.validate(&args.template, values).await {
        Ok(values) => {
            println!("{}", serde_json::to_string_pretty(&values)?);
            Ok(())
        }
        Err(e) => {
            if let SubmitError::Validation(validation) = &e {
                for violation in validation.violations() {
                    eprintln!("{violation}");
                }
            }
            anyhow::bail!("{}: {e}", e.kind())
        }
    }
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<()> {
    init_metrics().context("failed to register metrics")?;

    let mut config = ScaffolderConfig::from_env()?;
    if let Some(dir) = &args.working_dir {
        config = config.with_working_directory(dir);
        config.check_working_directory()?;
    }

    let mut pipeline = ScaffolderPipeline::with_defaults(&config);
    if let Some(dir) = &args.publish_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        pipeline
            .publishers_mut()
            .register(PublisherKey::File, Arc::new(DirectoryPublisher::with_root(dir)));
    }

    let docker = match DockerClient::new() {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(error = %e, "Docker unavailable; container templaters will fail");
            None
        }
    };

    let scaffolder = Scaffolder::in_memory(load_catalog(&args.catalog)?);
    let values = parse_values(&args.values)?;
    let task_id = scaffolder.submit(&args.template, values).await?;

    // subscribe before the worker can finish the task
    let mut events = scaffolder.subscribe(task_id, args.after).await?;
    let worker = scaffolder.start_worker(Arc::new(pipeline), config, docker);

    let mut final_status = None;
    while let Some(event) = events.next_event().await {
        println!("event:{}", serde_json::to_string(&event)?);
        if let EventBody::Completion { status, .. } = &event.body {
            final_status = Some(*status);
        }
    }

    if let Err(e) = worker.shutdown().await {
        warn!(error = %e, "Worker did not stop cleanly");
    }

    if args.metrics {
        eprintln!("{}", export_metrics());
    }

    match final_status {
        Some(TaskStatus::Completed) => Ok(()),
        Some(status) => {
            let snapshot = scaffolder.query(task_id).await?;
            let reason = snapshot
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| status.to_string());
            anyhow::bail!("task {task_id} failed: {reason}")
        }
        None => anyhow::bail!("event stream for task {task_id} ended without a completion event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_values_inline_and_file() {
        assert_eq!(parse_values(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.json");
        fs::write(&path, r#"{"component_id": "foo"}"#).unwrap();
        let values = parse_values(&format!("@{}", path.display())).unwrap();
        assert_eq!(values["component_id"], "foo");

        assert!(parse_values("not json").is_err());
        assert!(parse_values("@/definitely/missing.json").is_err());
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "scaffolder",
            "run",
            "--template",
            "react-ssr",
            "--values",
            "{}",
            "--after",
            "3",
            "-l",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.template, "react-ssr");
                assert_eq!(args.after, Some(3));
                assert_eq!(args.catalog, PathBuf::from(DEFAULT_CATALOG_DIR));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_cli_requires_template_for_validate() {
        assert!(Cli::try_parse_from(["scaffolder", "validate"]).is_err());
    }
}
