//! # Partitioning and populating the target disk
//!
//! The partition plan in the image template is checked in full before the
//! disk is touched. Partitioning writes a fresh GPT label and then appends
//! one partition at a time in declaration order; there is no rollback of a
//! partially partitioned disk.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Serialize;

use osprov_blockdev::{PartitionType, ESP_GUID, LINUX_DATA_GUID, LINUX_SWAP_GUID};
use osprov_utils::{CommandExecutor, ExecutorExt};

use crate::chroot::Chroot;
use crate::template::{FsType, ImageTemplate, PartitionKind, PartitionSpec};

const MIB: u64 = 1024 * 1024;
/// Space left free before the first partition for alignment.
const HEAD_RESERVED: u64 = MIB;
/// Space left free after the last partition for the backup GPT.
const TAIL_RESERVED: u64 = MIB;

/// A partition plan that cannot be applied to the target disk.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    /// The template names no disk
    #[error("no target disk path specified in the template")]
    NoDiskPath,
    /// An EFI template does not start with its ESP
    #[error("invalid boot partition: the first partition must be of type esp")]
    InvalidBootPartition,
    /// An EFI template has more than one ESP
    #[error("only one partition may be of type esp")]
    MultipleEsp,
    /// Nothing is mounted at `/`
    #[error("must specify a partition to have the mount point '/'")]
    NoRootPartition,
    /// The root filesystem cannot hold a root filesystem
    #[error("root partition cannot be {0}")]
    InvalidRootFs(FsType),
    /// A size that does not parse, or is zero
    #[error("unexpected partition size '{0}'")]
    InvalidSize(String),
    /// `max` on a partition other than the last, by index
    #[error("only the last partition may use the remaining space ({0})")]
    MaxNotLast(usize),
    /// The partition at this index does not fit on the disk
    #[error("device space exceeded by partition ({0})")]
    SpaceExceeded(usize),
}

/// The size a partition asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlannedSize {
    Bytes(u64),
    /// Everything left on the disk
    Max,
}

/// The device backing one template partition.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDevice {
    /// The device node, e.g. `/dev/vda1`
    pub node: Utf8PathBuf,
    /// The 1-based partition number
    pub number: u32,
    /// The partition UUID, lowercase
    pub partuuid: Option<String>,
}

/// Maps each template partition id to its device. Filled once partitioning
/// succeeds.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct DiskPathIdMap(BTreeMap<String, PartitionDevice>);

impl DiskPathIdMap {
    /// The device of partition `id`.
    pub fn get(&self, id: &str) -> Option<&PartitionDevice> {
        self.0.get(id)
    }

    /// All partitions, ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PartitionDevice)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The number of partitions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no partition has been recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn insert(&mut self, id: impl Into<String>, dev: PartitionDevice) {
        self.0.insert(id.into(), dev);
    }
}

/// Check everything about the plan that does not depend on the disk itself.
fn check_plan(template: &ImageTemplate) -> Result<Vec<PlannedSize>, PlanError> {
    let disk = &template.disk;
    if disk.path.as_str().is_empty() {
        return Err(PlanError::NoDiskPath);
    }
    if template.is_efi()
        && disk.partitions.first().map(|p| p.kind) != Some(PartitionKind::Esp)
    {
        return Err(PlanError::InvalidBootPartition);
    }
    if template.is_efi()
        && disk
            .partitions
            .iter()
            .filter(|p| p.kind == PartitionKind::Esp)
            .count()
            > 1
    {
        return Err(PlanError::MultipleEsp);
    }
    let root = template
        .root_partition()
        .ok_or(PlanError::NoRootPartition)?;
    if matches!(root.fs_type, FsType::Fat32 | FsType::Swap) {
        return Err(PlanError::InvalidRootFs(root.fs_type));
    }
    let last = disk.partitions.len().saturating_sub(1);
    disk.partitions
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let size = parse_planned_size(&p.size)?;
            if size == PlannedSize::Max && i != last {
                return Err(PlanError::MaxNotLast(i));
            }
            Ok(size)
        })
        .collect()
}

fn parse_planned_size(s: &str) -> Result<PlannedSize, PlanError> {
    if s == "max" {
        return Ok(PlannedSize::Max);
    }
    match osprov_blockdev::parse_size_bytes(s) {
        Ok(0) | Err(_) => Err(PlanError::InvalidSize(s.to_owned())),
        Ok(v) => Ok(PlannedSize::Bytes(v)),
    }
}

/// Check that the planned sizes fit on a disk of `disk_size` bytes.
fn check_capacity(sizes: &[PlannedSize], disk_size: u64) -> Result<(), PlanError> {
    let usable = disk_size.saturating_sub(HEAD_RESERVED + TAIL_RESERVED);
    let mut used: u64 = 0;
    for (i, size) in sizes.iter().enumerate() {
        let fits = match size {
            PlannedSize::Bytes(n) => {
                used = used.saturating_add(*n);
                used <= usable
            }
            PlannedSize::Max => used < usable,
        };
        if !fits {
            return Err(PlanError::SpaceExceeded(i));
        }
    }
    Ok(())
}

fn gpt_type(p: &PartitionSpec) -> &'static str {
    match (p.kind, p.fs_type) {
        (PartitionKind::Esp, _) => ESP_GUID,
        (_, FsType::Swap) => LINUX_SWAP_GUID,
        _ => LINUX_DATA_GUID,
    }
}

/// The `sfdisk` script line creating one partition.
fn sfdisk_line(p: &PartitionSpec, size: PlannedSize) -> String {
    let mut line = String::new();
    if let PlannedSize::Bytes(n) = size {
        // All accepted sizes are a multiple of 1KiB
        let _ = write!(line, "size={}KiB, ", n / 1024);
    }
    let _ = writeln!(line, "type={}, name=\"{}\"", gpt_type(p), p.id);
    line
}

fn mkfs_command(fs: FsType, node: &Utf8Path) -> Command {
    let mut cmd = match fs {
        FsType::Ext4 => {
            let mut c = Command::new("mkfs.ext4");
            c.args(["-F", "-q"]);
            c
        }
        FsType::Xfs => {
            let mut c = Command::new("mkfs.xfs");
            c.arg("-f");
            c
        }
        FsType::Btrfs => {
            let mut c = Command::new("mkfs.btrfs");
            c.arg("-f");
            c
        }
        FsType::Fat32 => {
            let mut c = Command::new("mkfs.vfat");
            c.args(["-F", "32"]);
            c
        }
        FsType::Swap => Command::new("mkswap"),
    };
    cmd.arg(node.as_str());
    cmd
}

/// The type name `mount` and fstab use for a filesystem.
fn mount_fstype(fs: FsType) -> &'static str {
    match fs {
        FsType::Ext4 => "ext4",
        FsType::Xfs => "xfs",
        FsType::Btrfs => "btrfs",
        FsType::Fat32 => "vfat",
        FsType::Swap => "swap",
    }
}

#[context("Checking {path} is a block device")]
pub(crate) fn ensure_block_device(path: &Utf8Path) -> Result<()> {
    let st = rustix::fs::stat(path.as_std_path())?;
    let ft = rustix::fs::FileType::from_raw_mode(st.st_mode);
    anyhow::ensure!(
        ft == rustix::fs::FileType::BlockDevice,
        "{path} is not a block device"
    );
    Ok(())
}

/// One line of `/etc/fstab`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FstabEntry {
    source: String,
    target: String,
    fstype: &'static str,
    pass: u8,
}

impl FstabEntry {
    fn to_fstab(&self) -> String {
        format!(
            "{} {} {} defaults 0 {}",
            self.source, self.target, self.fstype, self.pass
        )
    }
}

/// Render `/etc/fstab` for the installed system. Partitions are referenced
/// by PARTUUID where known.
pub(crate) fn fstab_contents(template: &ImageTemplate, map: &DiskPathIdMap) -> Result<String> {
    let mut out = String::new();
    for p in template.disk.partitions.iter() {
        let dev = map
            .get(&p.id)
            .with_context(|| format!("no device recorded for partition {}", p.id))?;
        let source = match dev.partuuid.as_deref() {
            Some(u) => format!("PARTUUID={u}"),
            None => dev.node.to_string(),
        };
        let entry = match (p.fs_type, p.mount_point.as_deref()) {
            (FsType::Swap, _) => FstabEntry {
                source,
                target: "none".into(),
                fstype: "swap",
                pass: 0,
            },
            (fs, Some(mp)) => FstabEntry {
                source,
                target: mp.to_owned(),
                fstype: mount_fstype(fs),
                pass: if p.is_root() { 1 } else { 2 },
            },
            (_, None) => continue,
        };
        writeln!(out, "{}", entry.to_fstab())?;
    }
    Ok(out)
}

fn mount_depth(mp: &str) -> usize {
    mp.trim_end_matches('/').matches('/').count()
}

/// Partitions and populates the target disk.
#[derive(Debug, Clone)]
pub struct DiskFinalizer {
    exec: Arc<dyn CommandExecutor>,
    work_dir: Utf8PathBuf,
    block_device_check: fn(&Utf8Path) -> Result<()>,
}

impl DiskFinalizer {
    /// Run commands with `exec`, staging mounts below `work_dir`.
    pub fn new(exec: Arc<dyn CommandExecutor>, work_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            exec,
            work_dir: work_dir.into(),
            block_device_check: ensure_block_device,
        }
    }

    /// Replace the check that the target disk is a block device.
    pub(crate) fn with_block_device_check(mut self, f: fn(&Utf8Path) -> Result<()>) -> Self {
        self.block_device_check = f;
        self
    }

    /// Check the partition plan against the target disk without changing
    /// anything.
    #[context("Checking target disk")]
    pub fn check(&self, template: &ImageTemplate) -> Result<()> {
        self.checked_sizes(template).map(drop)
    }

    fn checked_sizes(&self, template: &ImageTemplate) -> Result<Vec<PlannedSize>> {
        let sizes = check_plan(template)?;
        let disk = &template.disk.path;
        let dev = osprov_blockdev::list_dev(self.exec.as_ref(), disk)?;
        tracing::debug!("{} has {} bytes", dev.path(), dev.size);
        check_capacity(&sizes, dev.size)?;
        (self.block_device_check)(disk)?;
        Ok(sizes)
    }

    /// Partition and format the template's disk, recording each partition's
    /// device in the template and in the returned map.
    #[context("Partitioning target disk")]
    pub fn apply_partitions(&self, template: &mut ImageTemplate) -> Result<DiskPathIdMap> {
        let sizes = self.checked_sizes(template)?;
        let disk = template.disk.path.clone();
        tracing::info!("Writing partition table to {disk}");
        self.exec
            .run_with_stdin(
                Command::new("sfdisk").args(["--wipe=always", disk.as_str()]),
                b"label: gpt\n",
            )
            .context("Writing GPT label")?;
        for (p, size) in template.disk.partitions.iter().zip(sizes.iter()) {
            self.exec
                .run_with_stdin(
                    Command::new("sfdisk").args(["--append", disk.as_str()]),
                    sfdisk_line(p, *size).as_bytes(),
                )
                .with_context(|| format!("Creating partition {}", p.id))?;
        }
        osprov_blockdev::udev_settle(self.exec.as_ref())?;

        let table = osprov_blockdev::partitions_of(self.exec.as_ref(), &disk)?;
        anyhow::ensure!(
            table.label == PartitionType::Gpt,
            "expected a GPT partition table on {disk}, found {:?}",
            table.label
        );
        anyhow::ensure!(
            table.partitions.len() == template.disk.partitions.len(),
            "expected {} partitions on {disk}, found {}",
            template.disk.partitions.len(),
            table.partitions.len()
        );
        let mut map = DiskPathIdMap::default();
        for (i, p) in template.disk.partitions.iter_mut().enumerate() {
            let number = u32::try_from(i + 1)?;
            let part = table.find_partno(number)?;
            let node = part.path().to_owned();
            tracing::debug!("Partition {} is {node}", p.id);
            self.exec
                .run(&mut mkfs_command(p.fs_type, &node))
                .with_context(|| format!("Formatting {node} as {}", p.fs_type))?;
            p.device = Some(node.clone());
            map.insert(
                p.id.clone(),
                PartitionDevice {
                    node,
                    number,
                    partuuid: part.uuid.as_deref().map(str::to_ascii_lowercase),
                },
            );
        }
        Ok(map)
    }

    /// Copy the installation root onto the partitioned disk and write its
    /// fstab.
    #[context("Populating target disk")]
    pub fn populate(
        &self,
        template: &ImageTemplate,
        map: &DiskPathIdMap,
        chroot: &Chroot,
    ) -> Result<()> {
        let mut mounts: Vec<(&str, &PartitionDevice)> = Vec::new();
        for p in template.disk.partitions.iter() {
            if let Some(mp) = p.mount_point.as_deref() {
                let dev = map
                    .get(&p.id)
                    .with_context(|| format!("no device recorded for partition {}", p.id))?;
                mounts.push((mp, dev));
            }
        }
        mounts.sort_by_key(|(mp, _)| mount_depth(mp));
        let fstab = fstab_contents(template, map)?;

        std::fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("Creating {}", self.work_dir))?;
        let staging_dir = tempfile::Builder::new()
            .prefix("target-")
            .tempdir_in(&self.work_dir)?;
        let staging = Utf8Path::from_path(staging_dir.path())
            .context("Non-UTF8 work directory")?
            .to_owned();

        let mut mounted = Vec::new();
        let r = self.mount_all(&staging, &mounts, &mut mounted).and_then(|()| {
            tracing::info!("Copying installation root to {}", template.disk.path);
            self.exec
                .run(
                    Command::new("rsync")
                        .arg("-aHAX")
                        .arg(format!("{}/", chroot.path()))
                        .arg(format!("{staging}/")),
                )
                .context("Copying installation root")?;
            let etc = staging.join("etc");
            std::fs::create_dir_all(&etc)?;
            std::fs::write(etc.join("fstab"), &fstab).context("Writing /etc/fstab")?;
            Ok(())
        });
        let unmounted = self.unmount_all(&mounted);
        if unmounted.is_err() {
            // Removing the staging directory would recurse into the target disk
            let kept = staging_dir.keep();
            tracing::warn!("Leaving {} in place", kept.display());
        }
        match r {
            Ok(()) => unmounted,
            Err(e) => {
                if let Err(ue) = unmounted {
                    tracing::warn!("{ue:#}");
                }
                Err(e)
            }
        }
    }

    fn mount_all(
        &self,
        staging: &Utf8Path,
        mounts: &[(&str, &PartitionDevice)],
        mounted: &mut Vec<Utf8PathBuf>,
    ) -> Result<()> {
        for (mp, dev) in mounts {
            let target = match mp.trim_start_matches('/') {
                "" => staging.to_owned(),
                rel => staging.join(rel),
            };
            std::fs::create_dir_all(&target).with_context(|| format!("Creating {target}"))?;
            self.exec
                .run(Command::new("mount").args([dev.node.as_str(), target.as_str()]))
                .with_context(|| format!("Mounting {} at {mp}", dev.node))?;
            mounted.push(target);
        }
        Ok(())
    }

    /// Unmount in reverse order. Every unmount is attempted; the first
    /// failure is returned.
    fn unmount_all(&self, mounted: &[Utf8PathBuf]) -> Result<()> {
        let mut first_err = None;
        for target in mounted.iter().rev() {
            if let Err(e) = self.exec.run(Command::new("umount").arg(target.as_str())) {
                tracing::warn!("Failed to unmount {target}: {e:#}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
