// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror synchronization.
//!
//! Make a destination directory tree exactly match a source tree. Files only
//! in the destination are removed, differing files are overwritten, and the
//! directory structure is mirrored. Unchanged files are left alone, because
//! the destination may be read by someone else while the mirror runs.
//!
//! Two backends exist. [`RsyncMirror`] hands the job to an external rsync
//! binary, which is what most hosts already have. [`NativeMirror`] does the
//! same walk in-process for hosts without rsync.

use crate::syscall::{describe_status, syscall_non_interactive, SyscallError};

use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, BufReader, ErrorKind, Read},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

/// Make destination tree equal to source tree.
pub trait MirrorSync {
    /// Mirror `source` into `destination`.
    ///
    /// On success the destination tree must be exactly the source tree. On
    /// failure the destination may be partially updated.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError`] if the destination could not be made to match
    ///   the source.
    fn mirror(&self, source: &Path, destination: &Path) -> Result<()>;
}

impl<M> MirrorSync for &M
where
    M: MirrorSync + ?Sized,
{
    fn mirror(&self, source: &Path, destination: &Path) -> Result<()> {
        (**self).mirror(source, destination)
    }
}

impl<M> MirrorSync for Box<M>
where
    M: MirrorSync + ?Sized,
{
    fn mirror(&self, source: &Path, destination: &Path) -> Result<()> {
        (**self).mirror(source, destination)
    }
}

/// Selectable mirror backend.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncBackend {
    /// External rsync binary.
    #[default]
    Rsync,

    /// In-process mirror.
    Native,
}

/// Mirror through an external rsync binary.
///
/// Runs `rsync -aW --delete <source>/. <destination>/.`. Whole-file transfer
/// is used since both trees live on the same host, so the delta algorithm
/// would only burn CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsyncMirror {
    program: OsString,
}

impl RsyncMirror {
    /// Construct new rsync mirror using given rsync executable.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn expand_bin_args(&self, source: &Path, destination: &Path) -> Vec<OsString> {
        vec![
            "-aW".into(),
            "--delete".into(),
            dir_contents(source),
            dir_contents(destination),
        ]
    }
}

impl Default for RsyncMirror {
    fn default() -> Self {
        Self::new("rsync")
    }
}

impl MirrorSync for RsyncMirror {
    #[instrument(skip(self), level = "debug")]
    fn mirror(&self, source: &Path, destination: &Path) -> Result<()> {
        info!(
            "rsync {:?} into {:?}",
            source.display(),
            destination.display()
        );
        let output = syscall_non_interactive(&self.program, self.expand_bin_args(source, destination))?;
        if !output.is_empty() {
            debug!("{output}");
        }

        Ok(())
    }
}

/// Mirror in-process by walking both trees.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NativeMirror;

impl NativeMirror {
    /// Construct new in-process mirror.
    pub fn new() -> Self {
        Self
    }

    fn copy_pass(&self, source: &Path, destination: &Path) -> Result<usize> {
        let mut changed = 0;
        for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let Ok(relative) = entry.path().strip_prefix(source) else {
                continue;
            };
            let target = destination.join(relative);
            let kind = entry.file_type();

            if kind.is_dir() {
                if make_dir(&target)? {
                    changed += 1;
                }
            } else if kind.is_symlink() {
                if copy_symlink(entry.path(), &target)? {
                    changed += 1;
                }
            } else if copy_file(entry.path(), &target)? {
                changed += 1;
            }
        }

        Ok(changed)
    }

    fn delete_pass(&self, source: &Path, destination: &Path) -> Result<usize> {
        let mut extraneous = Vec::new();
        let mut walker = WalkDir::new(destination).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry?;
            let Ok(relative) = entry.path().strip_prefix(destination) else {
                continue;
            };

            if fs::symlink_metadata(source.join(relative)).is_err() {
                // INVARIANT: Whole subtree goes, so do not descend into it.
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                extraneous.push(entry.into_path());
            }
        }

        for path in &extraneous {
            debug!("delete {:?}", path.display());
            remove_entry(path)?;
        }

        Ok(extraneous.len())
    }
}

impl MirrorSync for NativeMirror {
    #[instrument(skip(self), level = "debug")]
    fn mirror(&self, source: &Path, destination: &Path) -> Result<()> {
        if !source.is_dir() {
            return Err(SyncError::NotADirectory {
                path: source.to_path_buf(),
            });
        }

        // INVARIANT: Follow a symlinked destination root, the same way rsync
        // resolves "<destination>/.".
        match fs::metadata(destination) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(SyncError::NotADirectory {
                    path: destination.to_path_buf(),
                })
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(destination).map_err(|err| io_error(err, destination))?;
            }
            Err(error) => return Err(io_error(error, destination)),
        }

        let copied = self.copy_pass(source, destination)?;
        let deleted = self.delete_pass(source, destination)?;
        info!(
            "mirrored {:?} into {:?}: {copied} updated, {deleted} deleted",
            source.display(),
            destination.display()
        );

        Ok(())
    }
}

/// Create directory, replacing any non-directory in the way.
fn make_dir(target: &Path) -> Result<bool> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => return Ok(false),
        Ok(_) => remove_entry(target)?,
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => return Err(io_error(error, target)),
    }

    fs::create_dir(target).map_err(|err| io_error(err, target))?;
    Ok(true)
}

/// Copy regular file unless destination already holds identical bytes and
/// permissions.
fn copy_file(source: &Path, target: &Path) -> Result<bool> {
    let permissions = fs::metadata(source)
        .map_err(|err| io_error(err, source))?
        .permissions();

    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_file() => {
            if same_contents(source, target)? {
                if meta.permissions() == permissions {
                    return Ok(false);
                }

                fs::set_permissions(target, permissions).map_err(|err| io_error(err, target))?;
                debug!("update permissions {:?}", target.display());
                return Ok(true);
            }
        }
        Ok(_) => remove_entry(target)?,
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => return Err(io_error(error, target)),
    }

    // INVARIANT: Readers see either the old file or the new file, never a
    // partial write. Temporary name is created exclusively, so it can never
    // clobber an entry that is part of the mirror itself.
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let mut partial = NamedTempFile::new_in(parent).map_err(|err| io_error(err, parent))?;
    let mut reader = File::open(source).map_err(|err| io_error(err, source))?;
    io::copy(&mut reader, partial.as_file_mut()).map_err(|err| io_error(err, partial.path()))?;
    partial
        .as_file()
        .set_permissions(permissions)
        .map_err(|err| io_error(err, partial.path()))?;
    partial
        .persist(target)
        .map_err(|err| io_error(err.error, target))?;
    debug!("update {:?}", target.display());

    Ok(true)
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> Result<bool> {
    let link = fs::read_link(source).map_err(|err| io_error(err, source))?;
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(target).map_err(|err| io_error(err, target))? == link {
                return Ok(false);
            }
            remove_entry(target)?;
        }
        Ok(_) => remove_entry(target)?,
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => return Err(io_error(error, target)),
    }

    std::os::unix::fs::symlink(&link, target).map_err(|err| io_error(err, target))?;
    Ok(true)
}

// Windows needs elevated rights for symlinks, so mirror what they point to.
#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> Result<bool> {
    if source.is_dir() {
        return make_dir(target);
    }
    copy_file(source, target)
}

fn remove_entry(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path).map_err(|err| io_error(err, path))?;
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    result.map_err(|err| io_error(err, path))
}

fn same_contents(left: &Path, right: &Path) -> Result<bool> {
    let left_meta = fs::metadata(left).map_err(|err| io_error(err, left))?;
    let right_meta = fs::metadata(right).map_err(|err| io_error(err, right))?;
    if left_meta.len() != right_meta.len() {
        return Ok(false);
    }

    let mut left_reader = BufReader::new(File::open(left).map_err(|err| io_error(err, left))?);
    let mut right_reader = BufReader::new(File::open(right).map_err(|err| io_error(err, right))?);
    let mut left_buf = [0u8; 8192];
    let mut right_buf = [0u8; 8192];
    loop {
        let count = read_full(&mut left_reader, &mut left_buf).map_err(|err| io_error(err, left))?;
        let other = read_full(&mut right_reader, &mut right_buf).map_err(|err| io_error(err, right))?;
        if count != other || left_buf[..count] != right_buf[..other] {
            return Ok(false);
        }
        if count == 0 {
            return Ok(true);
        }
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }

    Ok(filled)
}

/// Trailing "/." makes rsync treat a path as the directory's contents.
///
/// Relative paths get a leading "./" so a name like "-shelf" is never read
/// as an option.
fn dir_contents(path: &Path) -> OsString {
    let mut arg = if path.is_relative() {
        Path::new(".").join(path).into_os_string()
    } else {
        path.as_os_str().to_os_string()
    };
    arg.push("/.");
    arg
}

fn io_error(source: std::io::Error, path: &Path) -> SyncError {
    SyncError::Io {
        source,
        path: path.to_path_buf(),
    }
}

/// Mirror synchronization error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Mirror utility could not be started.
    #[error("failed to run {:?}", .program)]
    Spawn {
        #[source]
        source: std::io::Error,
        program: OsString,
    },

    /// Mirror utility ran but reported failure.
    #[error("{:?} exited with status {}:\n{}", .program, describe_status(.code), .message)]
    Exit {
        program: OsString,
        code: Option<i32>,
        message: String,
    },

    /// Filesystem operation failed during in-process mirror.
    #[error("failed to mirror {:?}", .path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory walk failed during in-process mirror.
    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    /// Mirror endpoint exists but is not a directory.
    #[error("expected directory at {:?}", .path.display())]
    NotADirectory { path: PathBuf },
}

impl From<SyscallError> for SyncError {
    fn from(error: SyscallError) -> Self {
        match error {
            SyscallError::Spawn { source, program } => Self::Spawn { source, program },
            SyscallError::Exit {
                program,
                code,
                message,
            } => Self::Exit {
                program,
                code,
                message,
            },
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::{create_dir_all, read_to_string, write};

    fn snapshot(root: &Path) -> Vec<(String, Option<String>)> {
        WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .map(|entry| {
                let entry = entry.unwrap();
                let name = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned();
                let contents = entry
                    .file_type()
                    .is_file()
                    .then(|| read_to_string(entry.path()).unwrap());
                (name, contents)
            })
            .collect()
    }

    #[test]
    fn native_mirror_converges_to_source() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let source = root.path().join("src");
        let destination = root.path().join("dst");

        create_dir_all(source.join("nginx/recipes"))?;
        write(source.join("nginx/metadata.rb"), "name 'nginx'\nversion '2.0.0'")?;
        write(source.join("nginx/recipes/default.rb"), "package 'nginx'")?;
        write(source.join("Berksfile.lock"), "DEPENDENCIES\n  nginx\n")?;

        create_dir_all(destination.join("nginx"))?;
        create_dir_all(destination.join("apache2/recipes"))?;
        write(destination.join("nginx/metadata.rb"), "name 'nginx'\nversion '1.0.0'")?;
        write(destination.join("apache2/recipes/default.rb"), "package 'httpd'")?;
        write(destination.join("stale.txt"), "stale")?;

        NativeMirror::new().mirror(&source, &destination)?;

        assert_eq!(snapshot(&destination), snapshot(&source));

        Ok(())
    }

    #[test]
    fn native_mirror_creates_missing_destination() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let source = root.path().join("src");
        let destination = root.path().join("deep/dst");
        create_dir_all(&source)?;
        write(source.join("a.txt"), "hello")?;

        NativeMirror::new().mirror(&source, &destination)?;

        assert_eq!(read_to_string(destination.join("a.txt"))?, "hello");

        Ok(())
    }

    #[test]
    fn native_mirror_leaves_unchanged_files_alone() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let source = root.path().join("src");
        let destination = root.path().join("dst");
        create_dir_all(&source)?;
        create_dir_all(&destination)?;
        write(source.join("same.txt"), "same")?;
        write(destination.join("same.txt"), "same")?;

        let before = fs::metadata(destination.join("same.txt"))?;
        let changed = NativeMirror::new().copy_pass(&source, &destination)?;
        let after = fs::metadata(destination.join("same.txt"))?;

        assert_eq!(changed, 0);
        assert_eq!(before.modified()?, after.modified()?);

        Ok(())
    }

    #[test]
    fn native_mirror_replaces_type_changes() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let source = root.path().join("src");
        let destination = root.path().join("dst");
        create_dir_all(source.join("was_file"))?;
        write(source.join("was_file/inner.txt"), "inner")?;
        write(source.join("was_dir"), "now a file")?;
        create_dir_all(destination.join("was_dir/nested"))?;
        write(destination.join("was_dir/nested/old.txt"), "old")?;
        write(destination.join("was_file"), "old file")?;

        NativeMirror::new().mirror(&source, &destination)?;

        assert_eq!(snapshot(&destination), snapshot(&source));

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn native_mirror_copies_symlinks_as_symlinks() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let source = root.path().join("src");
        let destination = root.path().join("dst");
        create_dir_all(&source)?;
        write(source.join("real.txt"), "real")?;
        std::os::unix::fs::symlink("real.txt", source.join("link.txt"))?;

        NativeMirror::new().mirror(&source, &destination)?;

        let link = destination.join("link.txt");
        assert_eq!(fs::symlink_metadata(&link)?.file_type().is_symlink(), true);
        assert_eq!(fs::read_link(&link)?, PathBuf::from("real.txt"));

        Ok(())
    }

    #[test]
    fn native_mirror_rejects_file_destination() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let source = root.path().join("src");
        let destination = root.path().join("dst");
        create_dir_all(&source)?;
        write(&destination, "not a directory")?;

        let result = NativeMirror::new().mirror(&source, &destination);
        assert!(matches!(result, Err(SyncError::NotADirectory { .. })));

        Ok(())
    }

    #[test]
    fn rsync_arguments_target_directory_contents() {
        let mirror = RsyncMirror::default();
        let result = mirror.expand_bin_args(Path::new("/shelf-tmp"), Path::new("/shelf"));
        let expect: Vec<OsString> = vec![
            "-aW".into(),
            "--delete".into(),
            "/shelf-tmp/.".into(),
            "/shelf/.".into(),
        ];
        assert_eq!(result, expect);
    }

    #[test]
    fn rsync_missing_binary_is_spawn_error() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let mirror = RsyncMirror::new(root.path().join("no-such-rsync"));

        let result = mirror.mirror(root.path(), root.path());
        assert!(matches!(result, Err(SyncError::Spawn { .. })));

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn rsync_nonzero_exit_is_reported() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let mirror = RsyncMirror::new("false");

        let result = mirror.mirror(root.path(), root.path());
        assert!(matches!(result, Err(SyncError::Exit { code: Some(1), .. })));

        Ok(())
    }

    #[test]
    fn rsync_arguments_never_start_with_dash() {
        let mirror = RsyncMirror::default();
        let result = mirror.expand_bin_args(Path::new("-shelf-tmp"), Path::new("-shelf"));
        let expect: Vec<OsString> = vec![
            "-aW".into(),
            "--delete".into(),
            "./-shelf-tmp/.".into(),
            "./-shelf/.".into(),
        ];
        assert_eq!(result, expect);
    }

    #[test]
    fn native_mirror_keeps_dotfiles_named_like_temporaries() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let source = root.path().join("src");
        let destination = root.path().join("dst");
        create_dir_all(&source)?;
        write(source.join("foo"), "real foo")?;
        write(source.join(".foo.shelfsync-partial"), "user dotfile")?;
        write(source.join(".tmpAbCdEf"), "another dotfile")?;

        NativeMirror::new().mirror(&source, &destination)?;

        assert_eq!(snapshot(&destination), snapshot(&source));
        assert_eq!(read_to_string(destination.join("foo"))?, "real foo");

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn native_mirror_updates_permissions_of_identical_files() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir()?;
        let source = root.path().join("src");
        let destination = root.path().join("dst");
        create_dir_all(&source)?;
        create_dir_all(&destination)?;
        write(source.join("run.sh"), "#!/bin/sh\n")?;
        write(destination.join("run.sh"), "#!/bin/sh\n")?;
        write(source.join("new.sh"), "echo new\n")?;
        fs::set_permissions(source.join("run.sh"), fs::Permissions::from_mode(0o755))?;
        fs::set_permissions(destination.join("run.sh"), fs::Permissions::from_mode(0o644))?;
        fs::set_permissions(source.join("new.sh"), fs::Permissions::from_mode(0o750))?;

        NativeMirror::new().mirror(&source, &destination)?;

        let mode = |path: PathBuf| -> anyhow::Result<u32> {
            Ok(fs::metadata(path)?.permissions().mode() & 0o777)
        };
        assert_eq!(mode(destination.join("run.sh"))?, 0o755);
        assert_eq!(mode(destination.join("new.sh"))?, 0o750);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn native_mirror_follows_symlinked_destination() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let source = root.path().join("src");
        let real = root.path().join("real-shelf");
        let destination = root.path().join("shelf");
        create_dir_all(&source)?;
        create_dir_all(&real)?;
        write(source.join("a.txt"), "hello")?;
        write(real.join("stale.txt"), "stale")?;
        std::os::unix::fs::symlink(&real, &destination)?;

        NativeMirror::new().mirror(&source, &destination)?;

        assert_eq!(fs::symlink_metadata(&destination)?.file_type().is_symlink(), true);
        assert_eq!(snapshot(&real), snapshot(&source));

        Ok(())
    }
}
