//! Verifying that the host has the tools an installation needs.

use std::sync::Arc;

use anyhow::Result;
use fn_error_context::context;

use osprov_utils::CommandExecutor;

/// Tools needed regardless of the target distribution.
const COMMON: &[&str] = &[
    "sfdisk",
    "lsblk",
    "udevadm",
    "mkfs.ext4",
    "mkfs.vfat",
    "mkfs.xfs",
    "mkfs.btrfs",
    "mkswap",
    "mount",
    "umount",
    "rsync",
    "useradd",
    "efibootmgr",
];

const RPM_TOOLS: &[&str] = &["dnf", "rpm"];
const DEB_TOOLS: &[&str] = &["mmdebstrap", "dpkg"];

/// The family-specific tools for `os`, if we know it.
fn family_tools(os: &str) -> Option<&'static [&'static str]> {
    match os {
        "azure-linux" | "fedora" | "centos-stream" => Some(RPM_TOOLS),
        "ubuntu" | "debian" => Some(DEB_TOOLS),
        _ => None,
    }
}

/// Checks the host for the commands needed to install a given OS family.
#[derive(Debug, Clone)]
pub struct DependencyChecker {
    exec: Arc<dyn CommandExecutor>,
}

impl DependencyChecker {
    /// Look up tools with `exec`.
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }

    /// Fail unless every tool needed for `os` is present on the host. All
    /// missing tools are reported at once.
    #[context("Checking host dependencies")]
    pub fn check(&self, os: &str) -> Result<()> {
        let Some(family) = family_tools(os) else {
            anyhow::bail!("unsupported target OS for dependency check: {os}");
        };
        let missing: Vec<&str> = family
            .iter()
            .chain(COMMON)
            .copied()
            .filter(|tool| self.exec.find_program(tool).is_none())
            .collect();
        if !missing.is_empty() {
            anyhow::bail!(
                "missing host dependencies for {os}: {}",
                missing.join(", ")
            );
        }
        tracing::debug!("All {} host dependencies for {os} found", family.len() + COMMON.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeExecutor;

    #[test]
    fn all_present() -> Result<()> {
        let exec = FakeExecutor::new_arc();
        let checker = DependencyChecker::new(exec.clone());
        checker.check("azure-linux")?;
        let probes = exec.probes();
        assert_eq!(probes.len(), 15);
        assert_eq!(&probes[..2], ["dnf", "rpm"]);
        checker.check("debian")?;
        assert!(exec.probes().contains(&"mmdebstrap".to_string()));
        // Only lookups; nothing is run
        assert!(exec.commands().is_empty());
        Ok(())
    }

    #[test]
    fn unknown_family_not_probed() {
        let exec = FakeExecutor::new_arc();
        let checker = DependencyChecker::new(exec.clone());
        let err = checker.check("plan9").unwrap_err();
        assert_eq!(
            err.root_cause().to_string(),
            "unsupported target OS for dependency check: plan9"
        );
        assert!(exec.probes().is_empty());
    }

    #[test]
    fn missing_aggregated() {
        let exec = FakeExecutor::new_arc();
        exec.set_missing(&["mmdebstrap", "efibootmgr"]);
        let checker = DependencyChecker::new(exec.clone());
        let err = checker.check("ubuntu").unwrap_err();
        assert_eq!(
            err.root_cause().to_string(),
            "missing host dependencies for ubuntu: mmdebstrap, efibootmgr"
        );
        let err = checker.check("fedora").unwrap_err();
        assert_eq!(
            err.root_cause().to_string(),
            "missing host dependencies for fedora: efibootmgr"
        );
    }
}
