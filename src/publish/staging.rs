// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Scoped ownership of a staging directory.
//!
//! A [`StagingDir`] owns its directory for exactly one publish. Whoever holds
//! the guard may fill the directory however they like. Once the guard goes
//! away the directory goes with it, regardless of whether the publish
//! succeeded, failed, or unwound from a panic.

use std::{
    fs::{create_dir, create_dir_all},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Exclusive handle on a freshly created staging directory.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    removed: bool,
}

impl StagingDir {
    /// Create a new empty staging directory at `path`.
    ///
    /// Parent directories are created as needed, but `path` itself must not
    /// exist yet. A guard is only handed out for a directory this call
    /// actually created, so dropping it never deletes somebody else's work.
    ///
    /// # Errors
    ///
    /// - Return [`std::io::Error`] if the directory cannot be created, or
    ///   already exists.
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            create_dir_all(parent)?;
        }
        create_dir(&path)?;
        debug!("created staging directory {:?}", path.display());

        Ok(Self {
            path,
            removed: false,
        })
    }

    /// Path to staging directory.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Remove staging directory and report the outcome.
    ///
    /// # Errors
    ///
    /// - Return [`CleanupError`] if the directory could not be removed.
    pub fn remove(mut self) -> Result<(), CleanupError> {
        self.removed = true;
        remove_tree(&self.path).map_err(|source| CleanupError {
            staging: self.path.clone(),
            source,
        })
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }

        debug!("discarding staging directory {:?}", self.path.display());
        if let Err(error) = remove_tree(&self.path) {
            warn!(
                "failed to remove staging directory {:?}: {error}",
                self.path.display()
            );
        }
    }
}

/// Remove a directory tree, treating an already missing tree as removed.
pub(crate) fn remove_tree(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

/// Staging directory could not be removed after a publish.
///
/// Never fatal. The target was already published when this happens, and the
/// next publish will deal with the leftover staging directory according to
/// its [`StalePolicy`](crate::StalePolicy).
#[derive(Debug, thiserror::Error)]
#[error("failed to remove staging directory at {:?}", .staging.display())]
pub struct CleanupError {
    pub staging: PathBuf,
    #[source]
    pub source: std::io::Error,
}
