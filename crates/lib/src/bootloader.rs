//! # Firmware boot entries
//!
//! On EFI systems the installed OS is registered with the firmware through
//! `efibootmgr`. Entries are identified by their label; any stale entries
//! carrying our label are removed before a new one is created, and the new
//! entry is moved to the front of the boot order.

use std::process::Command;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use fn_error_context::context;
use regex::Regex;

use osprov_utils::{CommandExecutor, ExecutorExt};

use crate::disk::DiskPathIdMap;
use crate::template::{BootloaderType, ImageTemplate};

/// The label given to our boot entries unless configured otherwise.
pub const DEFAULT_BOOT_ENTRY_LABEL: &str = "osprov";

/// The removable-media loader path for `arch`, relative to the ESP.
fn default_loader(arch: &str) -> Result<&'static str> {
    match arch {
        "x86_64" => Ok(r"\EFI\BOOT\BOOTX64.EFI"),
        "aarch64" => Ok(r"\EFI\BOOT\BOOTAA64.EFI"),
        o => anyhow::bail!("No EFI loader known for architecture {o}"),
    }
}

/// One `BootXXXX` variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BootEntry {
    pub(crate) num: u16,
    pub(crate) label: String,
    pub(crate) active: bool,
}

/// The parsed output of `efibootmgr`.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct BootEntries {
    pub(crate) order: Vec<u16>,
    pub(crate) entries: Vec<BootEntry>,
}

fn entry_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Boot([0-9A-Fa-f]{4})(\*?)\s+(.*)$").unwrap())
}

impl BootEntries {
    pub(crate) fn parse(output: &str) -> Result<Self> {
        let mut r = Self::default();
        for line in output.lines() {
            if let Some(order) = line.strip_prefix("BootOrder:") {
                r.order = order
                    .trim()
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|n| u16::from_str_radix(n.trim(), 16))
                    .collect::<std::result::Result<_, _>>()
                    .with_context(|| format!("Parsing {line}"))?;
            } else if let Some(caps) = entry_regex().captures(line) {
                let num = u16::from_str_radix(&caps[1], 16)?;
                // Newer versions print the device path after a tab
                let label = caps[3].split('\t').next().unwrap_or_default().trim();
                r.entries.push(BootEntry {
                    num,
                    label: label.to_owned(),
                    active: &caps[2] == "*",
                });
            }
        }
        Ok(r)
    }

    fn with_label<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a BootEntry> + 'a {
        self.entries.iter().filter(move |e| e.label == label)
    }
}

/// Manages the firmware boot entry for the installed system. Every phase is
/// a no-op for legacy boot.
#[derive(Debug)]
pub struct BootManager {
    exec: Arc<dyn CommandExecutor>,
    bootloader: BootloaderType,
    label: String,
    loader: Option<String>,
    created: Option<u16>,
}

impl BootManager {
    /// A manager using the default label and the architecture's loader.
    pub fn new(exec: Arc<dyn CommandExecutor>, bootloader: BootloaderType) -> Self {
        Self {
            exec,
            bootloader,
            label: DEFAULT_BOOT_ENTRY_LABEL.to_owned(),
            loader: None,
            created: None,
        }
    }

    /// Use `label` for the boot entries we create and remove.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Override the loader path passed to the firmware.
    pub fn with_loader(mut self, loader: Option<String>) -> Self {
        self.loader = loader;
        self
    }

    /// The number of the entry created by [`Self::create_new_boot_entry`].
    pub fn created_entry(&self) -> Option<u16> {
        self.created
    }

    fn is_efi(&self) -> bool {
        self.bootloader == BootloaderType::Efi
    }

    fn list(&self) -> Result<BootEntries> {
        let out = self
            .exec
            .run_get_string(&mut Command::new("efibootmgr"))
            .context("listing firmware boot entries")?;
        BootEntries::parse(&out).context("listing firmware boot entries")
    }

    /// Delete every boot entry carrying our label.
    #[context("Removing old boot entries")]
    pub fn remove_old_boot_entries(&self) -> Result<()> {
        if !self.is_efi() {
            return Ok(());
        }
        let entries = self.list()?;
        for e in entries.with_label(&self.label) {
            tracing::debug!("Deleting boot entry {:04X} ({})", e.num, e.label);
            self.exec
                .run(Command::new("efibootmgr").args(["-b", &format!("{:04X}", e.num), "-B"]))
                .with_context(|| format!("Deleting boot entry {:04X}", e.num))?;
        }
        Ok(())
    }

    /// Register the template's EFI system partition with the firmware.
    #[context("Creating boot entry")]
    pub fn create_new_boot_entry(
        &mut self,
        template: &ImageTemplate,
        map: &DiskPathIdMap,
    ) -> Result<()> {
        if !self.is_efi() {
            return Ok(());
        }
        let disk = &template.disk.path;
        anyhow::ensure!(
            !disk.as_str().is_empty(),
            "no target disk path specified in the template"
        );
        let esp = template
            .esp_partition()
            .context("no EFI boot partition found in the disk partitions")?;
        let dev = map
            .get(&esp.id)
            .with_context(|| format!("no device recorded for partition {}", esp.id))?;
        let loader = match self.loader.as_deref() {
            Some(l) => l,
            None => default_loader(&template.target.arch)?,
        };
        let out = self.exec.run_get_string(Command::new("efibootmgr").args([
            "-c",
            "-d",
            disk.as_str(),
            "-p",
            &dev.number.to_string(),
            "-L",
            &self.label,
            "-l",
            loader,
        ]))?;
        let entries = BootEntries::parse(&out)?;
        // efibootmgr prepends new entries to the boot order
        let created = entries
            .order
            .iter()
            .copied()
            .find(|n| entries.with_label(&self.label).any(|e| e.num == *n))
            .or_else(|| entries.with_label(&self.label).map(|e| e.num).last())
            .with_context(|| format!("no boot entry labelled {} after creation", self.label))?;
        tracing::info!("Created boot entry {created:04X} ({})", self.label);
        self.created = Some(created);
        Ok(())
    }

    /// Make the created entry the first in the firmware boot order.
    #[context("Updating boot order")]
    pub fn update_boot_order(&self, template: &ImageTemplate, map: &DiskPathIdMap) -> Result<()> {
        if !self.is_efi() || !template.is_efi() {
            return Ok(());
        }
        tracing::trace!("Updating boot order for {} partitions", map.len());
        let entries = self.list()?;
        let target = match self.created {
            Some(n) => n,
            None => entries
                .with_label(&self.label)
                .map(|e| e.num)
                .next()
                .with_context(|| format!("no boot entry labelled {}", self.label))?,
        };
        if entries.order.first() == Some(&target) {
            return Ok(());
        }
        let order = std::iter::once(target)
            .chain(entries.order.iter().copied().filter(|n| *n != target))
            .map(|n| format!("{n:04X}"))
            .collect::<Vec<_>>()
            .join(",");
        self.exec
            .run(Command::new("efibootmgr").args(["-o", &order]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::PartitionDevice;
    use crate::testutils::{FakeExecutor, FakeFirmware};

    const LISTING: &str = indoc::indoc! { "
        BootCurrent: 0001
        Timeout: 1 seconds
        BootOrder: 0001,0000,0003
        Boot0000* UiApp\tFvVol(7cb8bdc9-f8eb-4f34-aaea-3ee4af6516a1)/FvFile(462caa21-7614-4503-836e-8ab6f4662331)
        Boot0001* Fedora\tHD(1,GPT,58a4c5f0-bd12-424c-b563-195ac65a25dd,0x800,0x100000)/File(\\EFI\\fedora\\shimx64.efi)
        Boot0003  osprov
    " };

    #[test]
    fn parse() -> Result<()> {
        let e = BootEntries::parse(LISTING)?;
        assert_eq!(e.order, [1, 0, 3]);
        assert_eq!(
            e.entries,
            [
                BootEntry {
                    num: 0,
                    label: "UiApp".into(),
                    active: true
                },
                BootEntry {
                    num: 1,
                    label: "Fedora".into(),
                    active: true
                },
                BootEntry {
                    num: 3,
                    label: "osprov".into(),
                    active: false
                },
            ]
        );
        assert_eq!(BootEntries::parse("")?, BootEntries::default());
        assert!(BootEntries::parse("BootOrder: 0001,zz\n").is_err());
        Ok(())
    }

    fn efi_map() -> DiskPathIdMap {
        let mut map = DiskPathIdMap::default();
        map.insert(
            "boot",
            PartitionDevice {
                node: "/dev/vda1".into(),
                number: 1,
                partuuid: None,
            },
        );
        map
    }

    #[test]
    fn remove_is_idempotent() -> Result<()> {
        let exec = FakeExecutor::new_arc();
        let fw = FakeFirmware::with_entries(&[(0, "Fedora"), (3, "osprov"), (7, "osprov")]);
        FakeFirmware::install(&fw, &exec);
        let mgr = BootManager::new(exec.clone(), BootloaderType::Efi);
        mgr.remove_old_boot_entries()?;
        assert_eq!(fw.lock().unwrap().entries, [(0, "Fedora".to_string())]);
        assert_eq!(
            exec.commands(),
            ["efibootmgr", "efibootmgr -b 0003 -B", "efibootmgr -b 0007 -B"]
        );
        mgr.remove_old_boot_entries()?;
        assert_eq!(fw.lock().unwrap().entries, [(0, "Fedora".to_string())]);
        assert_eq!(exec.commands().len(), 4);
        Ok(())
    }

    #[test]
    fn remove_empty_and_listing_failure() {
        let exec = FakeExecutor::new_arc();
        let mgr = BootManager::new(exec.clone(), BootloaderType::Efi);
        // No entries at all
        mgr.remove_old_boot_entries().unwrap();
        exec.fail("efibootmgr", "EFI variables are not supported on this system.");
        let e = format!("{:#}", mgr.remove_old_boot_entries().unwrap_err());
        assert!(e.contains("listing firmware boot entries"), "{e}");
        assert!(e.contains("EFI variables are not supported"), "{e}");
        assert!(exec.commands_matching("efibootmgr -b").is_empty());
    }

    #[test]
    fn create_and_reorder() -> Result<()> {
        let exec = FakeExecutor::new_arc();
        let fw = FakeFirmware::with_entries(&[(0, "Fedora"), (1, "UiApp")]);
        FakeFirmware::install(&fw, &exec);
        let template = crate::template::tests::example();
        let map = efi_map();
        let mut mgr = BootManager::new(exec.clone(), BootloaderType::Efi).with_label("edge");
        mgr.remove_old_boot_entries()?;
        mgr.create_new_boot_entry(&template, &map)?;
        assert_eq!(mgr.created_entry(), Some(2));
        assert_eq!(
            exec.commands_matching("efibootmgr -c"),
            [r"efibootmgr -c -d /dev/vda -p 1 -L edge -l \EFI\BOOT\BOOTX64.EFI"]
        );
        // Someone else got in first
        fw.lock().unwrap().order = vec![1, 0, 2];
        mgr.update_boot_order(&template, &map)?;
        assert_eq!(fw.lock().unwrap().order, [2, 1, 0]);
        assert_eq!(
            exec.commands_matching("efibootmgr -o"),
            ["efibootmgr -o 0002,0001,0000"]
        );
        // Already first; nothing to do
        mgr.update_boot_order(&template, &map)?;
        assert_eq!(exec.commands_matching("efibootmgr -o").len(), 1);
        Ok(())
    }

    #[test]
    fn aarch64_and_override() -> Result<()> {
        let exec = FakeExecutor::new_arc();
        let fw = FakeFirmware::with_entries(&[]);
        FakeFirmware::install(&fw, &exec);
        let mut template = crate::template::tests::example();
        template.target.arch = "aarch64".into();
        let mut mgr = BootManager::new(exec.clone(), BootloaderType::Efi);
        mgr.create_new_boot_entry(&template, &efi_map())?;
        let mut mgr = BootManager::new(exec.clone(), BootloaderType::Efi)
            .with_loader(Some(r"\EFI\osprov\grubaa64.efi".into()));
        mgr.create_new_boot_entry(&template, &efi_map())?;
        let created = exec.commands_matching("efibootmgr -c");
        assert!(created[0].ends_with(r"-l \EFI\BOOT\BOOTAA64.EFI"), "{created:?}");
        assert!(created[1].ends_with(r"-l \EFI\osprov\grubaa64.efi"), "{created:?}");
        Ok(())
    }

    #[test]
    fn create_preconditions() {
        let cases: &[(fn(&mut ImageTemplate, &mut DiskPathIdMap), &str)] = &[
            (
                |t, _| t.disk.path = "".into(),
                "no target disk path specified in the template",
            ),
            (
                |t, _| t.disk.partitions.retain(|p| p.id != "boot"),
                "no EFI boot partition found in the disk partitions",
            ),
            (
                |_, m| *m = DiskPathIdMap::default(),
                "no device recorded for partition boot",
            ),
        ];
        for (mutate, expected) in cases {
            let exec = FakeExecutor::new_arc();
            let mut template = crate::template::tests::example();
            let mut map = efi_map();
            mutate(&mut template, &mut map);
            let mut mgr = BootManager::new(exec.clone(), BootloaderType::Efi);
            let e = mgr.create_new_boot_entry(&template, &map).unwrap_err();
            assert_eq!(e.root_cause().to_string(), *expected);
            assert!(exec.commands().is_empty());
            assert_eq!(mgr.created_entry(), None);
        }
    }

    #[test]
    fn legacy_is_noop() -> Result<()> {
        let exec = FakeExecutor::new_arc();
        let mut template = crate::template::tests::example();
        template.system_config.bootloader = BootloaderType::Legacy;
        template.disk.path = "".into();
        let mut mgr = BootManager::new(exec.clone(), BootloaderType::Legacy);
        mgr.remove_old_boot_entries()?;
        mgr.create_new_boot_entry(&template, &DiskPathIdMap::default())?;
        mgr.update_boot_order(&template, &DiskPathIdMap::default())?;
        assert!(exec.commands().is_empty());
        Ok(())
    }
}
