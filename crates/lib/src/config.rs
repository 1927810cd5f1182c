//! # Installation configuration
//!
//! Host-local settings that are not part of an image template, read from a
//! TOML file. Every key is optional:
//!
//! ```toml
//! config-root = "/usr/share/osprov"
//! work-dir = "/var/tmp/osprov"
//! boot-entry-label = "osprov"
//! efi-loader = '\EFI\BOOT\BOOTX64.EFI'
//! eject-media = "/dev/sr0"
//! ```

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::bootloader::DEFAULT_BOOT_ENTRY_LABEL;

/// Where the configuration is read from when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/osprov/config.toml";
const DEFAULT_CONFIG_ROOT: &str = "/usr/share/osprov";
const DEFAULT_WORK_DIR: &str = "/var/tmp/osprov";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
    config_root: Option<Utf8PathBuf>,
    work_dir: Option<Utf8PathBuf>,
    boot_entry_label: Option<String>,
    efi_loader: Option<String>,
    eject_media: Option<Utf8PathBuf>,
}

/// Resolved installation settings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct InstallConfig {
    /// The directory holding `osv/<os>/<dist>/config.yml` build profiles
    pub config_root: Utf8PathBuf,
    /// Scratch space for the installation root and staging mounts
    pub work_dir: Utf8PathBuf,
    /// The label of the firmware boot entry we create and replace
    pub boot_entry_label: String,
    /// Overrides the architecture's default EFI loader path
    pub efi_loader: Option<String>,
    /// A device to eject once installation completes
    pub eject_media: Option<Utf8PathBuf>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        ConfigFile::default().into()
    }
}

impl From<ConfigFile> for InstallConfig {
    fn from(c: ConfigFile) -> Self {
        Self {
            config_root: c.config_root.unwrap_or_else(|| DEFAULT_CONFIG_ROOT.into()),
            work_dir: c.work_dir.unwrap_or_else(|| DEFAULT_WORK_DIR.into()),
            boot_entry_label: c
                .boot_entry_label
                .unwrap_or_else(|| DEFAULT_BOOT_ENTRY_LABEL.into()),
            efi_loader: c.efi_loader,
            eject_media: c.eject_media,
        }
    }
}

impl InstallConfig {
    /// Parse a configuration document.
    pub fn parse(buf: &str) -> Result<Self> {
        let c: ConfigFile = toml::from_str(buf)?;
        if let Some(label) = c.boot_entry_label.as_deref() {
            anyhow::ensure!(!label.is_empty(), "boot-entry-label must not be empty");
        }
        Ok(c.into())
    }

    /// Load the configuration from `path`, which must exist, or from
    /// [`DEFAULT_CONFIG_PATH`] if present.
    #[context("Loading install configuration")]
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p, true),
            None => (Utf8Path::new(DEFAULT_CONFIG_PATH), false),
        };
        let buf = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration at {path}; using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        Self::parse(&buf).with_context(|| format!("Parsing {path}"))
    }
}
