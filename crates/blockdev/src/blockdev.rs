//! Querying block devices and partition tables through `lsblk` and `sfdisk`.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

use osprov_utils::{CommandExecutor, ExecutorExt};

/// GPT partition type for the EFI system partition.
pub const ESP_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
/// GPT partition type for generic Linux filesystem data.
pub const LINUX_DATA_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
/// GPT partition type for Linux swap.
pub const LINUX_SWAP_GUID: &str = "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device as reported by `lsblk -J -b -O`.
#[derive(Debug, Deserialize)]
pub struct Device {
    /// Kernel name, e.g. `vda`
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// The device node, when lsblk reports it
    pub path: Option<String>,
}

impl Device {
    /// The device node.
    // RHEL8's lsblk doesn't have PATH, so we do it
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }
}

/// Query a single block device.
#[context("Listing device {dev}")]
pub fn list_dev(exec: &dyn CommandExecutor, dev: &Utf8Path) -> Result<Device> {
    let devs: DevicesOutput = exec.run_and_parse_json(Command::new("lsblk").args([
        "-J",
        "-b",
        "-O",
        dev.as_str(),
    ]))?;
    devs.blockdevices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

/// One entry of an `sfdisk -J` partition table.
#[derive(Debug, Deserialize)]
pub struct Partition {
    /// The device node, e.g. `/dev/vda1`
    pub node: String,
    /// The partition UUID (PARTUUID)
    pub uuid: Option<String>,
}

/// The kind of partition table on a disk.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    /// MBR
    Dos,
    /// GUID partition table
    Gpt,
    /// Anything else sfdisk reports
    #[serde(untagged)]
    Unknown(String),
}

/// A partition table as reported by `sfdisk -J`.
#[derive(Debug, Deserialize)]
pub struct PartitionTable {
    /// The table format
    pub label: PartitionType,
    /// Partitions in table order
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Find the partition with the given offset (starting at 1)
    pub fn find_partno(&self, partno: u32) -> Result<&Partition> {
        let idx = partno
            .checked_sub(1)
            .ok_or_else(|| anyhow!("Partition numbers start at 1"))?;
        self.partitions
            .get(idx as usize)
            .ok_or_else(|| anyhow!("Missing partition for index {partno}"))
    }
}

impl Partition {
    /// The device node.
    pub fn path(&self) -> &Utf8Path {
        self.node.as_str().into()
    }
}

/// Read the partition table of `dev`.
#[context("Listing partitions of {dev}")]
pub fn partitions_of(exec: &dyn CommandExecutor, dev: &Utf8Path) -> Result<PartitionTable> {
    let o: SfDiskOutput = exec.run_and_parse_json(Command::new("sfdisk").args(["-J", dev.as_str()]))?;
    Ok(o.partitiontable)
}

/// Wait for udev to finish processing events, so that new partition nodes exist.
#[context("Waiting for udev")]
pub fn udev_settle(exec: &dyn CommandExecutor) -> Result<()> {
    exec.run(Command::new("udevadm").arg("settle"))
}

/// Parse a size such as `512MiB` or `2G` into bytes. A bare number is
/// interpreted as mebibytes.
pub fn parse_size_bytes(s: &str) -> Result<u64> {
    // Longest suffixes first so that e.g. `MiB` is not read as `M` + junk
    const SUFFIXES: &[(&str, u64)] = &[
        ("KiB", 1024),
        ("MiB", MIB),
        ("GiB", 1024 * MIB),
        ("TiB", 1024 * 1024 * MIB),
        ("K", 1024),
        ("M", MIB),
        ("G", 1024 * MIB),
        ("T", 1024 * 1024 * MIB),
    ];
    let s = s.trim();
    let (digits, mul) = SUFFIXES
        .iter()
        .find_map(|(suffix, mul)| s.strip_suffix(suffix).map(|v| (v, *mul)))
        .unwrap_or((s, MIB));
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        anyhow::bail!("Invalid size: {s}");
    }
    let v: u64 = digits.parse().with_context(|| format!("Parsing {s}"))?;
    v.checked_mul(mul)
        .ok_or_else(|| anyhow!("Size overflows: {s}"))
}
