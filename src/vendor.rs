// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Cookbook vendoring.
//!
//! Vendoring resolves the dependency graph of a Berksfile, fetches every
//! cookbook, and writes them into a directory together with a lock manifest.
//! All of that is the job of the external `berks` tool. This module only
//! knows how to ask it to vendor into a given directory.

use crate::{
    config::VendorSettings,
    syscall::{describe_status, syscall_non_interactive, SyscallError},
};

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Fill a directory with vendored dependencies.
pub trait Vendor {
    /// Vendor everything into `destination`.
    ///
    /// The destination does not need to exist beforehand, and its prior
    /// contents must not influence the result.
    ///
    /// # Errors
    ///
    /// - Return [`VendorError`] if vendoring fails.
    fn vendor(&self, destination: &Path) -> Result<()>;
}

impl<V> Vendor for &V
where
    V: Vendor + ?Sized,
{
    fn vendor(&self, destination: &Path) -> Result<()> {
        (**self).vendor(destination)
    }
}

/// Cookbook group filters passed to the vendoring tool.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct VendorOptions {
    /// Only vendor cookbooks in these groups.
    pub only: Vec<String>,

    /// Vendor every cookbook except those in these groups.
    pub except: Vec<String>,
}

impl From<&VendorSettings> for VendorOptions {
    fn from(settings: &VendorSettings) -> Self {
        Self {
            only: settings.only.clone(),
            except: settings.except.clone(),
        }
    }
}

/// Vendor through the `berks` executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerksVendor {
    program: OsString,
    berksfile: PathBuf,
    options: VendorOptions,
}

impl BerksVendor {
    /// Load Berksfile at target path.
    ///
    /// # Errors
    ///
    /// - Return [`VendorError::MissingBerksfile`] if no file exists at
    ///   target path.
    pub fn from_file(berksfile: impl Into<PathBuf>, options: VendorOptions) -> Result<Self> {
        let berksfile = berksfile.into();
        if !berksfile.is_file() {
            return Err(VendorError::MissingBerksfile { berksfile });
        }

        Ok(Self {
            program: "berks".into(),
            berksfile,
            options,
        })
    }

    /// Use a different vendoring executable.
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    /// Path to loaded Berksfile.
    pub fn berksfile(&self) -> &Path {
        self.berksfile.as_path()
    }

    fn expand_bin_args(&self, destination: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "vendor".into(),
            destination.as_os_str().to_os_string(),
            "--berksfile".into(),
            self.berksfile.as_os_str().to_os_string(),
        ];

        if !self.options.only.is_empty() {
            args.push("--only".into());
            args.extend(self.options.only.iter().map(OsString::from));
        }

        if !self.options.except.is_empty() {
            args.push("--except".into());
            args.extend(self.options.except.iter().map(OsString::from));
        }

        args
    }
}

impl Vendor for BerksVendor {
    #[instrument(skip(self), level = "debug")]
    fn vendor(&self, destination: &Path) -> Result<()> {
        info!(
            "vendor {:?} into {:?}",
            self.berksfile.display(),
            destination.display()
        );
        let message = syscall_non_interactive(&self.program, self.expand_bin_args(destination))?;
        if !message.is_empty() {
            debug!("{message}");
        }

        Ok(())
    }
}

/// Vendoring error types.
#[derive(Debug, thiserror::Error)]
pub enum VendorError {
    /// Berksfile does not exist.
    #[error("no Berksfile found at {:?}", .berksfile.display())]
    MissingBerksfile { berksfile: PathBuf },

    /// Vendoring tool could not be started.
    #[error("failed to run {:?}", .program)]
    Spawn {
        #[source]
        source: std::io::Error,
        program: OsString,
    },

    /// Vendoring tool ran but reported failure.
    #[error("{:?} exited with status {}:\n{}", .program, describe_status(.code), .message)]
    Exit {
        program: OsString,
        code: Option<i32>,
        message: String,
    },
}

impl From<SyscallError> for VendorError {
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
pub type Result<T, E = VendorError> = std::result::Result<T, E>;
