//! Pipeline collaborators: preparers, templaters and publishers.
//!
//! Each role has a trait, a handful of implementations and a registry that
//! maps a discriminant to an implementation:
//!
//! | Role      | Discriminant                          | Built in                                  |
//! |-----------|---------------------------------------|-------------------------------------------|
//! | Preparer  | [`PreparerKey`] (location protocol/host) | [`FilePreparer`], [`GitPreparer`]       |
//! | Templater | [`TemplaterKind`] (`spec.templater`)  | [`CookiecutterTemplater`], [`TeraTemplater`] |
//! | Publisher | [`PublisherKey`] (`storePath` host)   | [`GithubPublisher`], [`GitPublisher`], [`DirectoryPublisher`] |
//!
//! Registries are consulted once per task when the pipeline is built; a
//! missing registration fails the stage that needed it.

pub mod git;
pub mod preparers;
pub mod publishers;
pub mod templaters;

pub use git::{GitCredentials, GitDestination};
pub use preparers::{FilePreparer, GitPreparer, Preparer, PreparerKey, Preparers};
pub use publishers::{
    DirectoryPublisher, GitPublisher, GithubPublisher, PublishResult, Publisher, PublisherKey,
    Publishers,
};
pub use templaters::{CookiecutterTemplater, TeraTemplater, Templater, TemplaterKind, Templaters};

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::CollaboratorError;

/// Recursively copies the contents of `src` into `dest`, skipping `.git`.
///
/// Blocking; call through [`copy_dir`] from async code.
pub(crate) fn copy_dir_blocking(src: &Path, dest: &Path) -> Result<usize, CollaboratorError> {
    if !src.is_dir() {
        return Err(CollaboratorError::Invalid(format!(
            "{} is not a directory",
            src.display()
        )));
    }

    let mut copied = 0;
    for entry in WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry.map_err(|e| CollaboratorError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| CollaboratorError::Invalid(e.to_string()))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Copies a directory tree on the blocking pool. Returns the file count.
pub(crate) async fn copy_dir(src: PathBuf, dest: PathBuf) -> Result<usize, CollaboratorError> {
    tokio::task::spawn_blocking(move || copy_dir_blocking(&src, &dest))
        .await
        .map_err(|e| CollaboratorError::Panicked(e.to_string()))?
}

/// Stringifies a path for storing in the stage context.
pub(crate) fn path_value(path: &Path) -> serde_json::Value {
    serde_json::Value::String(path.display().to_string())
}
