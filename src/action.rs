// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Install action for a provisioning pipeline.
//!
//! Provisioning tools run a chain of actions when a machine boots. The
//! [`InstallAction`] is one link of that chain. It decides whether cookbooks
//! need vendoring at all, checks that the host is recent enough, publishes
//! the vendored cookbooks into the shelf, and then hands control to the rest
//! of the chain.
//!
//! # Decision Sequence
//!
//! 1. Provisioning disabled: skip.
//! 2. Berkshelf disabled: skip, but warn when a Berksfile is lying around,
//!    since the user probably forgot to enable it.
//! 3. Load the Berksfile.
//! 4. Chef solo provisioner: check host [`Precondition`], then publish.
//! 5. Continue with the rest of the chain.

use crate::{
    config::{HostSettings, ShelfConfig},
    path::NoWayHome,
    publish::{
        mirror::{MirrorSync, NativeMirror, RsyncMirror, SyncBackend},
        BoxError, PublishError, PublishReport, Publisher,
    },
    vendor::{BerksVendor, Vendor, VendorError, VendorOptions},
};

use semver::{Version, VersionReq};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};
use tracing::{debug, info, instrument, warn};

/// Provisioner configured for the machine.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Provisioner {
    ChefSolo,
    ChefClient,
    Shell,
    Other(String),
}

impl FromStr for Provisioner {
    type Err = std::convert::Infallible;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        Ok(match data.replace('-', "_").as_str() {
            "chef_solo" => Self::ChefSolo,
            "chef_client" => Self::ChefClient,
            "shell" => Self::Shell,
            _ => Self::Other(data.to_string()),
        })
    }
}

impl Display for Provisioner {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::ChefSolo => fmt.write_str("chef_solo"),
            Self::ChefClient => fmt.write_str("chef_client"),
            Self::Shell => fmt.write_str("shell"),
            Self::Other(name) => fmt.write_str(name),
        }
    }
}

/// Facts about the current run supplied by the host.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Environment {
    /// Provisioning was requested, i.e., no `--no-provision`.
    pub provision: bool,

    /// Provisioners configured for the machine.
    pub provisioners: Vec<Provisioner>,

    /// Version of host tool, if known.
    pub host_version: Option<Version>,
}

impl Environment {
    /// Check whether machine is provisioned through chef solo.
    pub fn chef_solo(&self) -> bool {
        self.provisioners.contains(&Provisioner::ChefSolo)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            provision: true,
            provisioners: vec![Provisioner::ChefSolo],
            host_version: None,
        }
    }
}

/// Capability check the host must pass before vendoring.
pub trait Precondition {
    /// Check host capabilities.
    ///
    /// # Errors
    ///
    /// - Return [`PreconditionError`] if host cannot support vendoring.
    fn check(&self, env: &Environment) -> Result<(), PreconditionError>;
}

/// Host version requirements.
///
/// Hosts below the minimum are rejected. Hosts outside the tested range are
/// accepted with a warning. Hosts that do not report a version are accepted.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HostVersion {
    minimum: VersionReq,
    tested: VersionReq,
}

impl HostVersion {
    /// Construct new host version requirements.
    pub fn new(minimum: VersionReq, tested: VersionReq) -> Self {
        Self { minimum, tested }
    }
}

impl Default for HostVersion {
    fn default() -> Self {
        Self::from(&HostSettings::default())
    }
}

impl From<&HostSettings> for HostVersion {
    fn from(settings: &HostSettings) -> Self {
        Self::new(settings.minimum.clone(), settings.tested.clone())
    }
}

impl Precondition for HostVersion {
    fn check(&self, env: &Environment) -> Result<(), PreconditionError> {
        let Some(version) = &env.host_version else {
            debug!("host version unknown, skipping version checks");
            return Ok(());
        };

        // INVARIANT: Development builds of a host compare as their release,
        // since semver requirements never match prereleases of other versions.
        let release = Version::new(version.major, version.minor, version.patch);

        if !self.minimum.matches(&release) {
            return Err(PreconditionError::Unsupported {
                version: version.clone(),
                minimum: self.minimum.clone(),
            });
        }

        if !self.tested.matches(&release) {
            for line in untested_host_notice(version) {
                warn!("{line}");
            }
            debug!("tested host versions: {}", self.tested);
        }

        Ok(())
    }
}

fn untested_host_notice(version: &Version) -> [String; 4] {
    [
        format!("this version of shelfsync has not been fully tested on host version {version}"),
        "you should check for a newer version of shelfsync".into(),
        "if you encounter any errors with this version, please report them to the shelfsync issue tracker".into(),
        "you can also join the discussion on the shelfsync discussion board".into(),
    ]
}

/// What the install action did before continuing the chain.
#[derive(Debug)]
pub enum InstallOutcome {
    /// Provisioning was disabled.
    ProvisionDisabled,

    /// Berkshelf integration was disabled.
    BerkshelfDisabled,

    /// No chef solo provisioner, nothing needs the shelf.
    NotChefSolo,

    /// Vendored cookbooks were published into the shelf.
    Published(PublishReport),
}

/// Vendor cookbooks into the shelf as part of a provisioning chain.
#[derive(Debug, Clone)]
pub struct InstallAction<P = HostVersion>
where
    P: Precondition,
{
    config: ShelfConfig,
    precondition: P,
}

impl InstallAction<HostVersion> {
    /// Construct new install action that checks host versions from config.
    pub fn new(config: ShelfConfig) -> Self {
        let precondition = HostVersion::from(&config.host);
        Self {
            config,
            precondition,
        }
    }
}

impl<P> InstallAction<P>
where
    P: Precondition,
{
    /// Replace host precondition.
    pub fn with_precondition<Q: Precondition>(self, precondition: Q) -> InstallAction<Q> {
        InstallAction {
            config: self.config,
            precondition,
        }
    }

    /// Configuration this action runs with.
    pub fn config(&self) -> &ShelfConfig {
        &self.config
    }

    /// Run action, then continue with rest of chain.
    ///
    /// The `next` callback is the rest of the provisioning chain. It runs
    /// exactly once unless the action itself fails.
    ///
    /// # Errors
    ///
    /// - Return [`ActionError`] if installing fails, or `next` fails.
    pub fn call<F, T, E>(&self, env: &Environment, next: F) -> Result<T>
    where
        F: FnOnce(&Environment) -> Result<T, E>,
        E: Into<BoxError>,
    {
        self.install(env)?;
        next(env).map_err(|err| ActionError::Chain(err.into()))
    }

    /// Run decision sequence without continuing the chain.
    ///
    /// # Errors
    ///
    /// - Return [`ActionError::Vendor`] if Berksfile cannot be loaded.
    /// - Return [`ActionError::Precondition`] if host is not supported.
    /// - Return [`ActionError::NoWayHome`] if shelf location is unknown.
    /// - Return [`ActionError::Publish`] if publishing fails.
    #[instrument(skip(self, env), level = "debug")]
    pub fn install(&self, env: &Environment) -> Result<InstallOutcome> {
        let settings = &self.config.berkshelf;

        if !env.provision {
            info!("skipping Berkshelf with --no-provision");
            return Ok(InstallOutcome::ProvisionDisabled);
        }

        if !settings.enabled {
            if settings.berksfile_path.exists() {
                warn!(
                    "Berkshelf is disabled but a Berksfile was found at your configured path: {}",
                    settings.berksfile_path.display()
                );
                warn!("enable Berkshelf by setting 'enabled = true' in the [berkshelf] section of your config");
            }
            return Ok(InstallOutcome::BerkshelfDisabled);
        }

        let vendor = BerksVendor::from_file(
            &settings.berksfile_path,
            VendorOptions::from(&self.config.vendor),
        )?
        .with_program(&self.config.vendor.program);

        if !env.chef_solo() {
            debug!("no chef solo provisioner, leaving shelf alone");
            return Ok(InstallOutcome::NotChefSolo);
        }

        self.precondition.check(env)?;

        let shelf = self.config.shelf_dir()?;
        info!("updating shelf: {:?}", shelf.display());
        let report = self
            .publisher()
            .publish(&shelf, |staging| vendor.vendor(staging))?;

        Ok(InstallOutcome::Published(report))
    }

    fn publisher(&self) -> Publisher<Box<dyn MirrorSync>> {
        let syncer: Box<dyn MirrorSync> = match self.config.sync.backend {
            SyncBackend::Rsync => Box::new(RsyncMirror::new(&self.config.sync.program)),
            SyncBackend::Native => Box::new(NativeMirror::new()),
        };

        Publisher::new(syncer).with_stale_policy(self.config.publish.stale_staging)
    }
}

/// Host capability error types.
#[derive(Debug, thiserror::Error)]
pub enum PreconditionError {
    /// Host version is below minimum requirement.
    #[error("shelfsync requires host version {minimum}, found {version}")]
    Unsupported {
        version: Version,
        minimum: VersionReq,
    },
}

/// Install action error types.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Berksfile could not be loaded.
    #[error(transparent)]
    Vendor(#[from] VendorError),

    /// Host failed capability check.
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// Shelf location could not be determined.
    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),

    /// Publishing into shelf failed.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Rest of provisioning chain failed.
    #[error("provisioning chain failed after install")]
    Chain(#[source] BoxError),
}

/// Friendly result alias :3
pub type Result<T, E = ActionError> = std::result::Result<T, E>;
