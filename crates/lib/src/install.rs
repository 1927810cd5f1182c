//! # Installing an image template onto a disk
//!
//! The pipeline runs in a fixed order: host dependency check, build profile
//! resolution, package installation into a chroot, disk partitioning and
//! population, and finally firmware boot entry registration. The first
//! failure stops the pipeline; nothing is retried or rolled back.
//!
//! The partition plan is checked against the target disk before any
//! package is installed.

use std::future::Future;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use osprov_utils::{CommandExecutor, ExecutorExt};

use crate::bootloader::BootManager;
use crate::chroot::{Chroot, ChrootBuilder};
use crate::config::InstallConfig;
use crate::deps::DependencyChecker;
use crate::disk::{DiskFinalizer, DiskPathIdMap};
use crate::progress::{progress_channel, ProgressSink};
use crate::template::ImageTemplate;
use crate::wizard::Wizard;

/// What a completed installation produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    /// The template with each partition's device filled in
    pub template: ImageTemplate,
    /// The device of each partition
    pub devices: DiskPathIdMap,
    /// The firmware boot entry created, if any
    pub boot_entry: Option<u16>,
    /// Wall time spent in the pipeline
    #[serde(skip)]
    pub elapsed: Duration,
}

/// How an installation attempt ended, other than by failing.
#[derive(Debug)]
pub enum InstallOutcome {
    /// Every stage ran
    Completed(Box<InstallReport>),
    /// The user backed out before the installation finished
    Cancelled,
}

/// Turn a task that panicked or was aborted into an ordinary error.
fn join_error(e: JoinError) -> anyhow::Error {
    if e.is_panic() {
        let payload = e.into_panic();
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        anyhow!("Installation task panicked: {msg}")
    } else {
        anyhow!("Installation task was cancelled")
    }
}

/// Cancels an installation when the process is interrupted, for as long as
/// it is alive.
#[derive(Debug)]
pub struct InterruptGuard(JoinHandle<()>);

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives an installation. Cloning is cheap; clones share the executor,
/// progress sink, configuration and cancellation token.
#[derive(Debug, Clone)]
pub struct Installer {
    exec: Arc<dyn CommandExecutor>,
    sink: Arc<dyn ProgressSink>,
    config: Arc<InstallConfig>,
    cancel: CancellationToken,
    block_device_check: fn(&Utf8Path) -> Result<()>,
}

impl Installer {
    /// An installer running commands with `exec` and reporting to `sink`.
    pub fn new(
        exec: Arc<dyn CommandExecutor>,
        sink: Arc<dyn ProgressSink>,
        config: InstallConfig,
    ) -> Self {
        Self {
            exec,
            sink,
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            block_device_check: crate::disk::ensure_block_device,
        }
    }

    /// The configuration this installer was created with.
    pub fn config(&self) -> &InstallConfig {
        &self.config
    }

    /// Cancelling this token stops the installation before its next stage.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Turn Ctrl-C into cancellation at the next stage boundary until the
    /// guard is dropped. Must be called within a tokio runtime.
    pub fn cancel_on_interrupt(&self) -> InterruptGuard {
        self.cancel_on(async { tokio::signal::ctrl_c().await })
    }

    fn cancel_on<F>(&self, signal: F) -> InterruptGuard
    where
        F: Future<Output = std::io::Result<()>> + Send + 'static,
    {
        let token = self.cancellation_token();
        InterruptGuard(tokio::spawn(async move {
            match signal.await {
                Ok(()) => {
                    tracing::warn!("Interrupted; stopping before the next stage");
                    token.cancel();
                }
                Err(e) => tracing::warn!("Cannot listen for interrupts: {e}"),
            }
        }))
    }

    /// Install from a template file with nobody watching.
    pub async fn unattended_install(
        &self,
        template_path: &Utf8Path,
        repo: &Utf8Path,
    ) -> Result<InstallOutcome> {
        let template = ImageTemplate::load(template_path)?;
        self.install(template, repo).await
    }

    /// Load a template and hand it to `wizard`, which decides whether and
    /// how to proceed.
    pub async fn attended_install<W: Wizard>(
        &self,
        template_path: &Utf8Path,
        repo: &Utf8Path,
        wizard: &mut W,
    ) -> Result<InstallOutcome> {
        let template = ImageTemplate::load(template_path)?;
        wizard.run(template, self, repo).await
    }

    /// Run the full pipeline for `template`, installing packages from the
    /// local repository at `repo`.
    pub async fn install(&self, template: ImageTemplate, repo: &Utf8Path) -> Result<InstallOutcome> {
        let this = self.clone();
        let repo = repo.to_owned();
        let started = Instant::now();
        let r = tokio::spawn(async move { this.pipeline(template, repo).await })
            .await
            .map_err(join_error)?;
        let Some(mut report) = r? else {
            tracing::info!("Installation cancelled");
            return Ok(InstallOutcome::Cancelled);
        };
        report.elapsed = started.elapsed();
        self.eject_media();
        tracing::info!(
            "Installation complete in {}",
            indicatif::HumanDuration(report.elapsed)
        );
        Ok(InstallOutcome::Completed(Box::new(report)))
    }

    fn cancelled(&self) -> bool {
        let r = self.cancel.is_cancelled();
        if r {
            self.sink.status("Cancelled");
        }
        r
    }

    /// The stages, in order. Returns `None` if cancelled between stages.
    async fn pipeline(
        &self,
        mut template: ImageTemplate,
        repo: Utf8PathBuf,
    ) -> Result<Option<InstallReport>> {
        if self.cancelled() {
            return Ok(None);
        }
        self.check_dependencies(&template)?;

        if self.cancelled() {
            return Ok(None);
        }
        let builder = crate::profile::resolve(
            &self.config.config_root,
            &repo,
            &template.target.os,
            &template.target.dist,
            &template.target.arch,
        )?;

        if self.cancelled() {
            return Ok(None);
        }
        self.disk_finalizer().check(&template)?;

        if self.cancelled() {
            return Ok(None);
        }
        let chroot = self.install_packages(builder, &template).await?;

        if self.cancelled() {
            return Ok(None);
        }
        let devices = self.finalize_disk(&mut template, &chroot)?;
        drop(chroot);

        if self.cancelled() {
            return Ok(None);
        }
        let boot_entry = self.register_boot_entry(&template, &devices)?;

        Ok(Some(InstallReport {
            template,
            devices,
            boot_entry,
            elapsed: Duration::ZERO,
        }))
    }

    #[context("Verifying host dependencies")]
    fn check_dependencies(&self, template: &ImageTemplate) -> Result<()> {
        self.sink.status("Checking host dependencies");
        DependencyChecker::new(Arc::clone(&self.exec)).check(&template.target.os)
    }

    /// Build the installation root on a blocking worker while its progress
    /// is forwarded to the sink.
    #[context("Installing packages")]
    async fn install_packages(
        &self,
        builder: ChrootBuilder,
        template: &ImageTemplate,
    ) -> Result<Chroot> {
        tracing::info!("Installing {} into {}", template.target, self.config.work_dir);
        let (reporter, receivers) = progress_channel();
        let drain = tokio::spawn(receivers.drain(Arc::clone(&self.sink)));
        let exec = Arc::clone(&self.exec);
        let work_dir = self.config.work_dir.clone();
        let template = template.clone();
        let worker = tokio::task::spawn_blocking(move || {
            // The reporter is dropped on return, closing both queues
            builder.build(exec.as_ref(), &template, &work_dir, &reporter)
        });
        let built = worker.await;
        let drained = drain.await;
        let chroot = built.map_err(join_error)??;
        drained.map_err(join_error)??;
        Ok(chroot)
    }

    fn disk_finalizer(&self) -> DiskFinalizer {
        DiskFinalizer::new(Arc::clone(&self.exec), self.config.work_dir.clone())
            .with_block_device_check(self.block_device_check)
    }

    #[context("Finalizing disk")]
    fn finalize_disk(&self, template: &mut ImageTemplate, chroot: &Chroot) -> Result<DiskPathIdMap> {
        self.sink
            .status(&format!("Partitioning {}", template.disk.path));
        let finalizer = self.disk_finalizer();
        let devices = finalizer.apply_partitions(template)?;
        self.sink
            .status(&format!("Copying system to {}", template.disk.path));
        finalizer.populate(template, &devices, chroot)?;
        Ok(devices)
    }

    #[context("Configuring firmware boot entry")]
    fn register_boot_entry(
        &self,
        template: &ImageTemplate,
        devices: &DiskPathIdMap,
    ) -> Result<Option<u16>> {
        self.sink.status("Configuring boot");
        let mut boot = BootManager::new(Arc::clone(&self.exec), template.system_config.bootloader)
            .with_label(self.config.boot_entry_label.clone())
            .with_loader(self.config.efi_loader.clone());
        boot.remove_old_boot_entries()?;
        boot.create_new_boot_entry(template, devices)?;
        boot.update_boot_order(template, devices)?;
        Ok(boot.created_entry())
    }

    /// Eject the installation media if configured. Failure is only logged.
    fn eject_media(&self) {
        let Some(dev) = self.config.eject_media.as_deref() else {
            return;
        };
        if let Err(e) = self
            .exec
            .run(Command::new("eject").arg(dev.as_str()))
            .with_context(|| format!("Ejecting {dev}"))
        {
            tracing::warn!("{e:#}");
        }
    }
}
