//! # Command line interface
//!
//! Parses arguments and dispatches to the installer.

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use osprov_utils::{CommandExecutor, HostExecutor};

use crate::config::InstallConfig;
use crate::deps::DependencyChecker;
use crate::install::{InstallOutcome, Installer};
use crate::progress::LogSink;
use crate::wizard::{ConsoleWizard, ProgressBarSink};

/// Options for installing an image template.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    /// Path to the image template (YAML)
    pub(crate) template: Utf8PathBuf,

    /// Local package repository to install from
    #[clap(long)]
    pub(crate) repo: Utf8PathBuf,

    /// Directory holding the `osv/<os>/<dist>/config.yml` build profiles
    #[clap(long)]
    pub(crate) config_root: Option<Utf8PathBuf>,

    /// Path to the install configuration file
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,

    /// Confirm interactively and show progress before installing
    #[clap(long)]
    pub(crate) attended: bool,
}

/// Options for printing a resolved build profile.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ResolveOpts {
    /// The OS family, e.g. `azure-linux`
    pub(crate) os: String,
    /// The distribution version, e.g. `3.0`
    pub(crate) dist: String,
    /// The architecture, e.g. `x86_64`
    pub(crate) arch: String,

    /// Directory holding the `osv/<os>/<dist>/config.yml` build profiles
    #[clap(long)]
    pub(crate) config_root: Option<Utf8PathBuf>,

    /// Path to the install configuration file
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,
}

/// Provision an operating system onto a disk from an image template.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "osprov", version)]
pub(crate) enum Opt {
    /// Install an image template onto its target disk.
    Install(InstallOpts),
    /// Check that this host has the tools needed to install an OS family.
    CheckDeps {
        /// The OS family, e.g. `azure-linux`
        os: String,
    },
    /// Print the build profile for a target as JSON.
    Resolve(ResolveOpts),
}

/// How the process should exit after a command that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The command did what was asked
    Success,
    /// The user backed out of an attended installation
    Cancelled,
}

impl Exit {
    /// The process exit code.
    pub fn code(self) -> i32 {
        match self {
            Exit::Success => 0,
            Exit::Cancelled => 130,
        }
    }
}

fn load_config(path: Option<&Utf8Path>, config_root: Option<Utf8PathBuf>) -> Result<InstallConfig> {
    let mut config = InstallConfig::load(path)?;
    if let Some(root) = config_root {
        config.config_root = root;
    }
    Ok(config)
}

async fn install(opts: InstallOpts, exec: Arc<dyn CommandExecutor>) -> Result<Exit> {
    let config = load_config(opts.config.as_deref(), opts.config_root)?;
    let outcome = if opts.attended {
        let bar = ProgressBarSink::new();
        let installer = Installer::new(exec, Arc::new(bar.clone()), config);
        let mut wizard = ConsoleWizard::new(bar);
        installer
            .attended_install(&opts.template, &opts.repo, &mut wizard)
            .await?
    } else {
        let installer = Installer::new(exec, Arc::new(LogSink), config);
        let _interrupt = installer.cancel_on_interrupt();
        installer
            .unattended_install(&opts.template, &opts.repo)
            .await?
    };
    match outcome {
        InstallOutcome::Completed(report) => {
            println!(
                "Installed {} to {} in {}",
                report.template.target,
                report.template.disk.path,
                indicatif::HumanDuration(report.elapsed)
            );
            Ok(Exit::Success)
        }
        InstallOutcome::Cancelled => {
            println!("Installation cancelled");
            Ok(Exit::Cancelled)
        }
    }
}

fn resolve(opts: ResolveOpts) -> Result<Exit> {
    let config = load_config(opts.config.as_deref(), opts.config_root)?;
    let builder = crate::profile::resolve(
        &config.config_root,
        Utf8Path::new(""),
        &opts.os,
        &opts.dist,
        &opts.arch,
    )?;
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, builder.profile())?;
    std::io::Write::write_all(&mut stdout, b"\n")?;
    Ok(Exit::Success)
}

async fn run_with_executor(opt: Opt, exec: Arc<dyn CommandExecutor>) -> Result<Exit> {
    match opt {
        Opt::Install(opts) => install(opts, exec).await,
        Opt::CheckDeps { os } => {
            DependencyChecker::new(exec).check(&os)?;
            println!("All host dependencies for {os} are present");
            Ok(Exit::Success)
        }
        Opt::Resolve(opts) => resolve(opts),
    }
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure to parse the arguments.
pub async fn run_from_iter<T>(args: impl IntoIterator<Item = T>) -> Result<Exit>
where
    T: Into<OsString> + Clone,
{
    run_with_executor(Opt::parse_from(args), Arc::new(HostExecutor)).await
}
