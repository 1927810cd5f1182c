//! # Attended installation
//!
//! A wizard stands between a loaded template and the installer: it may
//! complete the template, ask for confirmation, show progress, and decides
//! whether the installation goes ahead at all.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use indicatif::{ProgressBar, ProgressStyle};

use crate::install::{InstallOutcome, Installer};
use crate::progress::ProgressSink;
use crate::template::ImageTemplate;

/// Drives an attended installation.
#[allow(async_fn_in_trait)]
pub trait Wizard {
    /// Present `template` to the user and, if they agree, install it with
    /// `installer`. Declining yields [`InstallOutcome::Cancelled`].
    async fn run(
        &mut self,
        template: ImageTemplate,
        installer: &Installer,
        repo: &Utf8Path,
    ) -> Result<InstallOutcome>;
}

/// Shows installation progress on a terminal progress bar.
#[derive(Debug, Clone)]
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    /// A bar counting percent from 0 to 100.
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::with_template("{spinner} [{bar:40}] {pos:>3}% {wide_msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        Self { bar }
    }

    fn start(&self) {
        self.bar.enable_steady_tick(Duration::from_millis(100));
    }

    /// Remove the bar from the terminal.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressBarSink {
    fn progress(&self, percent: u8) {
        self.bar.set_position(percent.into());
    }

    fn status(&self, line: &str) {
        self.bar.set_message(line.to_owned());
    }
}

/// A line-oriented wizard for a plain terminal.
#[derive(Debug)]
pub struct ConsoleWizard {
    bar: ProgressBarSink,
}

impl ConsoleWizard {
    /// `bar` must be the sink the installer reports to.
    pub fn new(bar: ProgressBarSink) -> Self {
        Self { bar }
    }

    fn summarize(template: &ImageTemplate) {
        eprintln!("Installing {}", template.target);
        eprintln!("  Disk: {}", template.disk.path);
        for p in template.disk.partitions.iter() {
            let mp = p.mount_point.as_deref().unwrap_or("-");
            eprintln!("    {:<10} {:>8} {:<6} {mp}", p.id, p.size, p.fs_type);
        }
        if !template.system_config.hostname.is_empty() {
            eprintln!("  Hostname: {}", template.system_config.hostname);
        }
        for u in template.system_config.users.iter() {
            eprintln!("  User: {}{}", u.name, if u.sudo { " (admin)" } else { "" });
        }
    }
}

impl Wizard for ConsoleWizard {
    async fn run(
        &mut self,
        mut template: ImageTemplate,
        installer: &Installer,
        repo: &Utf8Path,
    ) -> Result<InstallOutcome> {
        if template.disk.path.as_str().is_empty() {
            let path: String = dialoguer::Input::new()
                .with_prompt("Target disk")
                .interact_text()
                .context("Reading target disk")?;
            template.disk.path = path.trim().into();
        }
        Self::summarize(&template);
        let prompt = format!(
            "All data on {} will be erased. Continue?",
            template.disk.path
        );
        let proceed = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Reading confirmation")?;
        if !proceed {
            installer.cancellation_token().cancel();
            return Ok(InstallOutcome::Cancelled);
        }
        self.bar.start();
        let _interrupt = installer.cancel_on_interrupt();
        let r = installer.install(template, repo).await;
        self.bar.finish();
        r
    }
}
