// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file that Shelfsync uses to
//! simplify the process of serialization and deserialization. The parsed
//! [`ShelfConfig`] is handed to the install action explicitly. Nothing in
//! this crate keeps configuration in global state.

use crate::{
    path::{default_shelf_dir, NoWayHome},
    publish::{mirror::SyncBackend, StalePolicy},
};

use semver::VersionReq;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Shelfsync configuration layout.
///
/// # General Layout
///
/// Every section is optional. Missing sections and keys fall back to their
/// defaults, so an empty file is a valid configuration.
///
/// - `[berkshelf]`: whether vendoring is enabled, and where the Berksfile
///   and the shelf live.
/// - `[vendor]`: how to invoke the vendoring tool.
/// - `[sync]`: which mirror backend publishes into the shelf.
/// - `[publish]`: what to do with leftover staging directories.
/// - `[host]`: host tool versions that are supported and tested.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShelfConfig {
    pub berkshelf: BerkshelfSettings,
    pub vendor: VendorSettings,
    pub sync: SyncSettings,
    pub publish: PublishSettings,
    pub host: HostSettings,
}

impl ShelfConfig {
    /// Read and parse configuration file.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if the file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if the file is malformed.
    /// - Return [`ConfigError::ShellExpansion`] if a path references an
    ///   unset variable.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_to_string(path.as_ref()).map_err(|err| ConfigError::Read {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;

        content.parse()
    }

    /// Resolve shelf directory, falling back to the default location.
    ///
    /// # Errors
    ///
    /// - Return [`NoWayHome`] if no shelf is configured and the home
    ///   directory cannot be determined.
    pub fn shelf_dir(&self) -> Result<PathBuf, NoWayHome> {
        match &self.berkshelf.shelf {
            Some(shelf) => Ok(shelf.clone()),
            None => default_shelf_dir(),
        }
    }
}

impl FromStr for ShelfConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: ShelfConfig = toml::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        config.berkshelf.berksfile_path = expand_path(&config.berkshelf.berksfile_path)?;
        config.berkshelf.shelf = config
            .berkshelf
            .shelf
            .as_deref()
            .map(expand_path)
            .transpose()?;

        Ok(config)
    }
}

impl Display for ShelfConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Berkshelf integration settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BerkshelfSettings {
    /// Vendor cookbooks at all.
    pub enabled: bool,

    /// Path to Berksfile to vendor from.
    pub berksfile_path: PathBuf,

    /// Shelf directory shared with the guest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shelf: Option<PathBuf>,
}

impl Default for BerkshelfSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            berksfile_path: PathBuf::from("Berksfile"),
            shelf: None,
        }
    }
}

/// Vendoring tool invocation settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VendorSettings {
    /// Vendoring executable.
    pub program: String,

    /// Only vendor cookbooks in these groups.
    pub only: Vec<String>,

    /// Vendor every cookbook except those in these groups.
    pub except: Vec<String>,
}

impl Default for VendorSettings {
    fn default() -> Self {
        Self {
            program: "berks".into(),
            only: Vec::new(),
            except: Vec::new(),
        }
    }
}

/// Mirror backend settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSettings {
    pub backend: SyncBackend,

    /// Executable used by the rsync backend.
    pub program: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backend: SyncBackend::Rsync,
            program: "rsync".into(),
        }
    }
}

/// Publish settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishSettings {
    pub stale_staging: StalePolicy,
}

/// Host tool version requirements.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostSettings {
    /// Oldest host version that works at all.
    pub minimum: VersionReq,

    /// Host versions this release was tested against.
    pub tested: VersionReq,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            minimum: VersionReq::parse(">=1.1").unwrap_or(VersionReq::STAR),
            tested: VersionReq::parse("~1.2").unwrap_or(VersionReq::STAR),
        }
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration file at {:?}", .path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
