// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Staged directory publishing.
//!
//! A __target__ directory is read by other processes at arbitrary times,
//! e.g., a virtual machine that mounts it as a shared folder. Rebuilding it in
//! place would expose a half written, or even missing, directory to those
//! readers. Some folder sharing methods outright die when the shared folder is
//! deleted and recreated.
//!
//! Instead, the [`Publisher`] builds the new contents in a __staging__
//! directory that sits next to the target, then mirrors the staging directory
//! into the target so only the differences are applied. The staging directory
//! is removed afterwards no matter how the publish went.
//!
//! # Failure Semantics
//!
//! - Populate fails: the target is never touched.
//! - Mirror fails: the target may be partially updated. This is reported as
//!   [`PublishError::Sync`], which is a worse outcome than a populate failure.
//! - Staging cleanup fails after a successful mirror: the publish still
//!   counts as a success. The failure is logged and recorded in the
//!   [`PublishReport`].
//!
//! # Concurrency
//!
//! Publishing is blocking and not re-entrant. Two publishes against the same
//! target share a staging path, so callers must serialize them. Nothing here
//! locks. [`StalePolicy::Refuse`] can detect an in-flight publish in the
//! common case, but it is not a lock either.

pub mod mirror;
pub mod staging;

use crate::publish::{
    mirror::{MirrorSync, RsyncMirror, SyncError},
    staging::{remove_tree, CleanupError, StagingDir},
};

use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fs::symlink_metadata,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Boxed error returned by populate callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Suffix appended to target name to form its staging directory.
pub const STAGING_SUFFIX: &str = "-tmp";

/// Determine staging path for a target directory.
///
/// The staging directory is a sibling of the target named after it with
/// [`STAGING_SUFFIX`] appended, so `/srv/shelf` stages into `/srv/shelf-tmp`.
/// Keeping it on the same filesystem as the target keeps the mirror cheap.
///
/// # Errors
///
/// - Return [`PublishError::InvalidTarget`] if target does not end in a
///   normal path component, e.g., `/`, `..`, or an empty path.
pub fn derive_staging_path(target: impl AsRef<Path>) -> Result<PathBuf> {
    let target = target.as_ref();
    let name = match target.components().next_back() {
        Some(Component::Normal(name)) => name,
        _ => {
            return Err(PublishError::InvalidTarget {
                target: target.to_path_buf(),
            })
        }
    };

    let mut staging_name = OsString::from(name);
    staging_name.push(STAGING_SUFFIX);

    Ok(target.with_file_name(staging_name))
}

/// What to do with a staging directory left behind by an earlier run.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StalePolicy {
    /// Remove it before populating, since it can only be debris from a
    /// crashed publish.
    #[default]
    Reset,

    /// Assume another publish owns it, and fail without touching anything.
    Refuse,
}

/// Outcome of a successful publish.
#[derive(Debug)]
pub struct PublishReport {
    /// Directory that was published to.
    pub target: PathBuf,

    /// Staging directory that was used.
    pub staging: PathBuf,

    /// Staging removal failure, if any.
    pub cleanup: Option<CleanupError>,
}

/// Publish directory contents through a staging directory.
///
/// See the [module documentation](self) for failure and concurrency
/// semantics.
#[derive(Debug, Clone, Default)]
pub struct Publisher<S = RsyncMirror>
where
    S: MirrorSync,
{
    syncer: S,
    stale: StalePolicy,
}

impl<S> Publisher<S>
where
    S: MirrorSync,
{
    /// Construct new publisher around a mirror backend.
    pub fn new(syncer: S) -> Self {
        Self {
            syncer,
            stale: StalePolicy::default(),
        }
    }

    /// Set policy for leftover staging directories.
    pub fn with_stale_policy(mut self, stale: StalePolicy) -> Self {
        self.stale = stale;
        self
    }

    /// Current policy for leftover staging directories.
    pub fn stale_policy(&self) -> StalePolicy {
        self.stale
    }

    /// Populate a staging directory, then mirror it into target.
    ///
    /// The `populate` callback receives a fresh, empty directory that does
    /// not exist before the call. It must not rely on the target's current
    /// contents.
    ///
    /// # Errors
    ///
    /// - Return [`PublishError::InvalidTarget`] if no staging path can be
    ///   derived from target.
    /// - Return [`PublishError::StagingBusy`] if staging path exists under
    ///   [`StalePolicy::Refuse`].
    /// - Return [`PublishError::Prepare`] if staging directory cannot be reset
    ///   or created.
    /// - Return [`PublishError::Populate`] if populate callback fails.
    /// - Return [`PublishError::Sync`] if mirroring into target fails.
    #[instrument(skip(self, target, populate), level = "debug")]
    pub fn publish<F, E>(&self, target: impl AsRef<Path>, populate: F) -> Result<PublishReport>
    where
        F: FnOnce(&Path) -> Result<(), E>,
        E: Into<BoxError>,
    {
        let target = target.as_ref();
        let staging_path = derive_staging_path(target)?;
        self.prepare(target, &staging_path)?;

        let staging = StagingDir::create(&staging_path).map_err(|err| PublishError::Prepare {
            source: err,
            target: target.to_path_buf(),
            staging: staging_path.clone(),
        })?;

        debug!("populate {:?}", staging.path().display());
        populate(staging.path()).map_err(|err| PublishError::Populate {
            source: err.into(),
            target: target.to_path_buf(),
            staging: staging_path.clone(),
        })?;

        info!(
            "publish {:?} into {:?}",
            staging.path().display(),
            target.display()
        );
        self.syncer
            .mirror(staging.path(), target)
            .map_err(|err| PublishError::Sync {
                source: err,
                target: target.to_path_buf(),
                staging: staging_path.clone(),
            })?;

        let cleanup = staging.remove().err();
        if let Some(error) = &cleanup {
            warn!("published {:?}, but {error}", target.display());
        }

        Ok(PublishReport {
            target: target.to_path_buf(),
            staging: staging_path,
            cleanup,
        })
    }

    fn prepare(&self, target: &Path, staging: &Path) -> Result<()> {
        if symlink_metadata(staging).is_err() {
            return Ok(());
        }

        match self.stale {
            StalePolicy::Refuse => Err(PublishError::StagingBusy {
                target: target.to_path_buf(),
                staging: staging.to_path_buf(),
            }),
            StalePolicy::Reset => {
                warn!("removing stale staging directory {:?}", staging.display());
                remove_stale(staging).map_err(|err| PublishError::Prepare {
                    source: err,
                    target: target.to_path_buf(),
                    staging: staging.to_path_buf(),
                })
            }
        }
    }
}

fn remove_stale(staging: &Path) -> std::io::Result<()> {
    if symlink_metadata(staging)?.is_dir() {
        remove_tree(staging)
    } else {
        std::fs::remove_file(staging)
    }
}

/// Staged publishing error types.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Target path has no name to derive a staging path from.
    #[error("cannot derive staging directory from target {:?}", .target.display())]
    InvalidTarget { target: PathBuf },

    /// Staging path already exists and stale policy refuses to reset it.
    #[error(
        "staging directory {:?} for {:?} already exists, is another publish running?",
        .staging.display(),
        .target.display()
    )]
    StagingBusy { target: PathBuf, staging: PathBuf },

    /// Staging directory could not be reset or created.
    #[error(
        "failed to prepare staging directory {:?} for {:?}",
        .staging.display(),
        .target.display()
    )]
    Prepare {
        #[source]
        source: std::io::Error,
        target: PathBuf,
        staging: PathBuf,
    },

    /// Populate callback failed, target is untouched.
    #[error(
        "failed to populate staging directory {:?}, {:?} left untouched",
        .staging.display(),
        .target.display()
    )]
    Populate {
        #[source]
        source: BoxError,
        target: PathBuf,
        staging: PathBuf,
    },

    /// Mirror failed, target may be partially updated.
    #[error(
        "failed to mirror {:?} into {:?}, target may be inconsistent",
        .staging.display(),
        .target.display()
    )]
    Sync {
        #[source]
        source: SyncError,
        target: PathBuf,
        staging: PathBuf,
    },
}

impl PublishError {
    /// Check whether target is known to be exactly as it was before publish.
    pub fn target_intact(&self) -> bool {
        !matches!(self, Self::Sync { .. })
    }
}

/// Friendly result alias :3
pub type Result<T, E = PublishError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::mirror::NativeMirror;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::{
        cell::Cell,
        fs::{create_dir_all, read_to_string, write},
        panic::{catch_unwind, AssertUnwindSafe},
    };

    struct FailingMirror;

    impl MirrorSync for FailingMirror {
        fn mirror(&self, _: &Path, _: &Path) -> mirror::Result<()> {
            Err(SyncError::Exit {
                program: "rsync".into(),
                code: Some(23),
                message: "stderr: some files could not be transferred".into(),
            })
        }
    }

    /// Mirrors for real, then leaves a plain file where staging was, so the
    /// staging tree can no longer be removed as a directory.
    struct ClobberingMirror;

    impl MirrorSync for ClobberingMirror {
        fn mirror(&self, source: &Path, destination: &Path) -> mirror::Result<()> {
            NativeMirror.mirror(source, destination)?;
            std::fs::remove_dir_all(source).map_err(|err| SyncError::Io {
                source: err,
                path: source.to_path_buf(),
            })?;
            write(source, "not a directory").map_err(|err| SyncError::Io {
                source: err,
                path: source.to_path_buf(),
            })
        }
    }

    #[test_case("/srv/shelf", "/srv/shelf-tmp"; "absolute path")]
    #[test_case("shelf", "shelf-tmp"; "bare name")]
    #[test_case("/srv/shelf/", "/srv/shelf-tmp"; "trailing separator")]
    #[test_case("vagrant/berkshelf-1371234", "vagrant/berkshelf-1371234-tmp"; "nested relative path")]
    #[test]
    fn staging_path_sits_next_to_target(target: &str, expect: &str) {
        use pretty_assertions::assert_eq;
        let result = derive_staging_path(target).unwrap();
        assert_eq!(result, PathBuf::from(expect));
    }

    #[test_case("/"; "root")]
    #[test_case(""; "empty")]
    #[test_case("/srv/.."; "parent component")]
    #[test]
    fn staging_path_rejects_nameless_target(target: &str) {
        let result = derive_staging_path(target);
        assert!(matches!(result, Err(PublishError::InvalidTarget { .. })));
    }

    #[test]
    fn populate_receives_fresh_empty_directory() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let target = root.path().join("shelf");
        let seen = Cell::new(false);

        Publisher::new(NativeMirror).publish(&target, |dir| -> std::io::Result<()> {
            assert_eq!(dir, root.path().join("shelf-tmp"));
            assert_eq!(std::fs::read_dir(dir)?.count(), 0);
            seen.set(true);
            Ok(())
        })?;

        assert!(seen.get());

        Ok(())
    }

    #[test]
    fn refuse_policy_leaves_existing_staging_alone() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let target = root.path().join("shelf");
        let staging = root.path().join("shelf-tmp");
        create_dir_all(&staging)?;
        write(staging.join("in-flight.txt"), "busy")?;

        let publisher = Publisher::new(NativeMirror).with_stale_policy(StalePolicy::Refuse);
        let result = publisher.publish(&target, |_| -> std::io::Result<()> {
            panic!("populate must not run");
        });

        assert!(matches!(result, Err(PublishError::StagingBusy { .. })));
        assert_eq!(read_to_string(staging.join("in-flight.txt"))?, "busy");
        assert_eq!(target.exists(), false);

        Ok(())
    }

    #[test]
    fn reset_policy_discards_stale_staging() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let target = root.path().join("shelf");
        let staging = root.path().join("shelf-tmp");
        create_dir_all(&staging)?;
        write(staging.join("debris.txt"), "from a crashed run")?;

        Publisher::new(NativeMirror).publish(&target, |dir| write(dir.join("a.txt"), "hello"))?;

        assert_eq!(target.join("debris.txt").exists(), false);
        assert_eq!(read_to_string(target.join("a.txt"))?, "hello");
        assert_eq!(staging.exists(), false);

        Ok(())
    }

    #[test]
    fn sync_failure_is_distinct_from_populate_failure() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let target = root.path().join("shelf");

        let result = Publisher::new(FailingMirror).publish(&target, |dir| write(dir.join("a.txt"), "hello"));

        let error = result.unwrap_err();
        assert!(matches!(error, PublishError::Sync { .. }));
        assert_eq!(error.target_intact(), false);
        assert_eq!(root.path().join("shelf-tmp").exists(), false);

        Ok(())
    }

    #[test]
    fn panicking_populate_still_removes_staging() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let target = root.path().join("shelf");
        let publisher = Publisher::new(NativeMirror);

        let result = catch_unwind(AssertUnwindSafe(|| {
            publisher.publish(&target, |dir| -> std::io::Result<()> {
                write(dir.join("half.txt"), "half")?;
                panic!("vendoring blew up");
            })
        }));

        assert!(result.is_err());
        assert_eq!(root.path().join("shelf-tmp").exists(), false);
        assert_eq!(target.exists(), false);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn cleanup_failure_keeps_publish_successful() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let target = root.path().join("shelf");
        let staging = root.path().join("shelf-tmp");

        let report = Publisher::new(ClobberingMirror).publish(&target, |dir| write(dir.join("a.txt"), "hello"))?;

        assert_eq!(read_to_string(target.join("a.txt"))?, "hello");
        assert_eq!(report.staging, staging);
        match &report.cleanup {
            Some(error) => assert_eq!(error.staging, staging),
            None => panic!("expected cleanup error"),
        }
        assert_eq!(staging.is_file(), true);

        Ok(())
    }
}
