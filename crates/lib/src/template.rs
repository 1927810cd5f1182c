//! # The image template
//!
//! An image template is the complete description of what gets installed where:
//! the target distribution, the partition plan for the target disk, and the
//! system configuration of the installed OS.

use std::collections::HashSet;
use std::fmt::Display;

use anyhow::{ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// Architectures we know how to boot.
pub(crate) const SUPPORTED_ARCHES: &[&str] = &["x86_64", "aarch64"];
/// GPT partition names hold at most this many UTF-16 code units.
const MAX_PARTITION_ID_LEN: usize = 36;

/// Partition ids become GPT partition names in an `sfdisk` script.
fn valid_partition_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_PARTITION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// The toplevel provisioning intent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageTemplate {
    /// What to install
    pub target: Target,
    /// Where to install it
    pub disk: DiskConfig,
    /// How the installed system is configured
    pub system_config: SystemConfig,
}

/// The OS family, distribution version and architecture to install.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Target {
    /// The OS family, e.g. `azure-linux`
    pub os: String,
    /// The distribution version, e.g. `3.0`
    pub dist: String,
    /// The CPU architecture, e.g. `x86_64`
    pub arch: String,
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.os, self.dist, self.arch)
    }
}

/// The target disk and its partition plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiskConfig {
    /// The target block device; may be left empty for the wizard to fill in.
    #[serde(default)]
    pub path: Utf8PathBuf,
    /// Partitions, in on-disk order
    pub partitions: Vec<PartitionSpec>,
}

/// The role a partition plays.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionKind {
    /// The EFI system partition
    Esp,
    /// Anything else
    #[default]
    Linux,
}

/// Filesystem formats we know how to create.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FsType {
    /// ext4
    Ext4,
    /// XFS
    Xfs,
    /// Btrfs
    Btrfs,
    /// FAT32, for the ESP
    Fat32,
    /// Swap space; never mounted
    Swap,
}

impl Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
            FsType::Btrfs => "btrfs",
            FsType::Fat32 => "fat32",
            FsType::Swap => "swap",
        };
        f.write_str(s)
    }
}

/// One planned partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartitionSpec {
    /// Identifier, unique within the template
    pub id: String,
    /// The partition's role; `linux` unless given
    #[serde(rename = "type", default)]
    pub kind: PartitionKind,
    /// Where this partition is mounted in the installed system, if anywhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    /// A size such as `512MiB`, or `max` for the rest of the disk
    pub size: String,
    /// The filesystem created on it
    pub fs_type: FsType,
    /// The device node assigned after partitioning; never read from input.
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub device: Option<Utf8PathBuf>,
}

impl PartitionSpec {
    pub(crate) fn is_root(&self) -> bool {
        self.mount_point.as_deref() == Some("/")
    }
}

/// How the installed system boots.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderType {
    /// UEFI, with a firmware boot entry
    #[default]
    Efi,
    /// BIOS boot; firmware boot entries are not touched
    Legacy,
}

/// A user account to create in the installed system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct User {
    /// The login name
    pub name: String,
    /// A crypt(3) hash, passed through to `useradd -p`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Supplementary groups
    #[serde(default)]
    pub groups: Vec<String>,
    /// Add the user to the administrative group of the distribution
    #[serde(default)]
    pub sudo: bool,
}

/// Configuration of the installed system.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SystemConfig {
    /// Written to `/etc/hostname` unless empty
    #[serde(default)]
    pub hostname: String,
    /// How the installed system boots
    #[serde(default)]
    pub bootloader: BootloaderType,
    /// Packages installed on top of the distribution's essential set
    #[serde(default)]
    pub packages: Vec<String>,
    /// Accounts to create
    #[serde(default)]
    pub users: Vec<User>,
}

impl ImageTemplate {
    /// Load and validate a template document.
    #[context("Loading image template {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
        let template: Self = serde_yaml::from_str(&buf).context("Parsing template")?;
        template.validate()?;
        Ok(template)
    }

    /// Check the invariants that do not depend on the target disk.
    #[context("Validating image template")]
    pub fn validate(&self) -> Result<()> {
        let target = &self.target;
        for (name, v) in [("os", &target.os), ("dist", &target.dist), ("arch", &target.arch)] {
            ensure!(!v.is_empty(), "target.{name} must not be empty");
        }
        ensure!(
            SUPPORTED_ARCHES.contains(&target.arch.as_str()),
            "unsupported architecture {}; expected one of {}",
            target.arch,
            SUPPORTED_ARCHES.join(", ")
        );
        ensure!(
            !self.disk.partitions.is_empty(),
            "the disk configuration has no partitions"
        );

        let mut ids = HashSet::new();
        let mut mount_points = HashSet::new();
        for p in self.disk.partitions.iter() {
            ensure!(!p.id.is_empty(), "partition identifiers must not be empty");
            ensure!(
                valid_partition_id(&p.id),
                "invalid partition id {:?}; use at most {MAX_PARTITION_ID_LEN} of A-Z a-z 0-9 . _ -",
                p.id
            );
            ensure!(ids.insert(p.id.as_str()), "duplicate partition id {}", p.id);
            if let Some(mp) = p.mount_point.as_deref() {
                ensure!(
                    mp.starts_with('/'),
                    "mount point {mp} of partition {} must begin with '/'",
                    p.id
                );
                ensure!(mount_points.insert(mp), "duplicate mount point {mp}");
                ensure!(
                    p.fs_type != FsType::Swap,
                    "swap partition {} cannot have a mount point",
                    p.id
                );
            }
        }

        let mut users = HashSet::new();
        for u in self.system_config.users.iter() {
            ensure!(!u.name.is_empty(), "user names must not be empty");
            ensure!(users.insert(u.name.as_str()), "duplicate user {}", u.name);
        }
        Ok(())
    }

    pub(crate) fn is_efi(&self) -> bool {
        self.system_config.bootloader == BootloaderType::Efi
    }

    /// The first partition marked as the EFI system partition.
    pub(crate) fn esp_partition(&self) -> Option<&PartitionSpec> {
        self.disk
            .partitions
            .iter()
            .find(|p| p.kind == PartitionKind::Esp)
    }

    pub(crate) fn root_partition(&self) -> Option<&PartitionSpec> {
        self.disk.partitions.iter().find(|p| p.is_root())
    }
}
