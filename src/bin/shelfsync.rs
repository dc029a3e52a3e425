// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use shelfsync::{
    action::{Environment, InstallAction, InstallOutcome, Provisioner},
    config::ShelfConfig,
    path::default_config_path,
    publish::{PublishReport, Publisher, StalePolicy},
    MirrorSync, NativeMirror, RsyncMirror,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use semver::Version;
use std::{ffi::OsString, path::PathBuf, process::exit, process::Command as Process, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  shelfsync [options] <shelfsync-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Install(opts) => run_install(opts),
            Command::Publish(opts) => run_publish(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Vendor cookbooks from Berksfile into the shelf.
    #[command(override_usage = "shelfsync install [options]")]
    Install(InstallOptions),

    /// Run any command into a staging directory, then publish it to target.
    #[command(override_usage = "shelfsync publish [options] <target> -- <command>...")]
    Publish(PublishOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InstallOptions {
    /// Path to configuration file.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Skip provisioning entirely.
    #[arg(long)]
    pub no_provision: bool,

    /// Provisioner configured for the machine, may be repeated.
    #[arg(
        short,
        long = "provisioner",
        value_name = "name",
        default_value = "chef_solo"
    )]
    pub provisioners: Vec<Provisioner>,

    /// Version of the host provisioning tool.
    #[arg(long, value_name = "version")]
    pub host_version: Option<Version>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PublishOptions {
    /// Directory to publish into.
    #[arg(required = true, value_name = "target")]
    pub target: PathBuf,

    /// Mirror backend to publish with.
    #[arg(short, long, value_enum, default_value_t = Backend::Rsync)]
    pub backend: Backend,

    /// Fail instead of removing a leftover staging directory.
    #[arg(long)]
    pub refuse_stale: bool,

    /// Command that populates the staging directory, which is passed as its
    /// last argument.
    #[arg(last = true, required = true, value_name = "command")]
    pub command: Vec<OsString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Rsync,
    Native,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn run_install(opts: InstallOptions) -> Result<()> {
    let config = load_config(opts.config)?;
    let env = Environment {
        provision: !opts.no_provision,
        provisioners: opts.provisioners,
        host_version: opts.host_version,
    };

    let bar = spinner("vendoring cookbooks")?;
    let outcome = InstallAction::new(config).install(&env);
    bar.finish_and_clear();

    if let InstallOutcome::Published(report) = outcome? {
        report_publish(&report);
    }

    Ok(())
}

fn run_publish(opts: PublishOptions) -> Result<()> {
    let syncer: Box<dyn MirrorSync> = match opts.backend {
        Backend::Rsync => Box::new(RsyncMirror::default()),
        Backend::Native => Box::new(NativeMirror::new()),
    };
    let stale = if opts.refuse_stale {
        StalePolicy::Refuse
    } else {
        StalePolicy::Reset
    };
    let (program, args) = opts
        .command
        .split_first()
        .ok_or_else(|| anyhow!("no populate command given"))?;

    let bar = spinner(format!("publishing {}", opts.target.display()))?;
    let result = Publisher::new(syncer)
        .with_stale_policy(stale)
        .publish(&opts.target, |staging| -> Result<()> {
            let status = bar.suspend(|| Process::new(program).args(args).arg(staging).status())
                .with_context(|| format!("failed to run {program:?}"))?;
            if !status.success() {
                return Err(anyhow!("command {program:?} failed with {status}"));
            }

            Ok(())
        });
    bar.finish_and_clear();

    report_publish(&result?);

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<ShelfConfig> {
    let path = match path {
        Some(path) => path,
        None => {
            let path = default_config_path()?;
            if !path.exists() {
                info!("no configuration at {:?}, using defaults", path.display());
                return Ok(ShelfConfig::default());
            }
            path
        }
    };

    Ok(ShelfConfig::from_file(path)?)
}

fn spinner(message: impl Into<String>) -> Result<ProgressBar> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{elapsed_precise:.green}  {spinner:.yellow} {msg}")?);
    bar.set_message(message.into());
    bar.enable_steady_tick(Duration::from_millis(100));

    Ok(bar)
}

fn report_publish(report: &PublishReport) {
    info!("published {:?}", report.target.display());
    if let Some(error) = &report.cleanup {
        warn!("leftover staging directory: {error}");
    }
}
