//! # Build profiles
//!
//! A build profile describes how to construct the installation chroot for
//! one (OS family, distribution version, architecture) combination. Profiles
//! live under the config root at `osv/<os>/<dist>/config.yml`, keyed by
//! architecture:
//!
//! ```yaml
//! x86_64:
//!   dist: azl3
//!   arch: x86_64
//!   pkgType: rpm
//!   chrootEnvConfigFile: chrootenv_x86_64.yml
//!   releaseVersion: "3.0"
//! ```

use std::collections::BTreeMap;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::chroot::{ChrootBuilder, PackageInstaller};

/// The directory below the config root holding per-OS profiles.
const OSV_DIR: &str = "osv";
/// The profile document inside each `<os>/<dist>` directory.
const PROFILE_FILE: &str = "config.yml";

/// The kind of native package manager a distribution uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PkgType {
    /// dnf and rpm
    Rpm,
    /// mmdebstrap, dpkg and apt
    Deb,
}

/// The resolved per-architecture build environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BuildProfile {
    /// Distribution codename, e.g. `azl3` or `noble`
    pub dist: String,
    /// The architecture this entry is for
    pub arch: String,
    /// Selects the package installer
    pub pkg_type: PkgType,
    /// Path to the chroot environment document, relative to the profile directory
    pub chroot_env_config_file: Utf8PathBuf,
    /// Passed to the package manager as the release version
    pub release_version: String,
}

/// Failures resolving a build profile.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// No `<os>/<dist>` directory below the config root
    #[error("target OS config directory does not exist: {0}")]
    ConfigDirMissing(Utf8PathBuf),
    /// The directory has no profile document
    #[error("target OS config file does not exist: {0}")]
    ConfigFileMissing(Utf8PathBuf),
    /// The profile document could not be read
    #[error("reading {path}")]
    Io {
        /// The profile document
        path: Utf8PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
    /// The profile document is not YAML
    #[error("parsing {path}")]
    Parse {
        /// The profile document
        path: Utf8PathBuf,
        /// The underlying error
        #[source]
        source: serde_yaml::Error,
    },
    /// The profile document does not match the schema
    #[error("validation of {path} failed: {detail}")]
    Validation {
        /// The profile document
        path: Utf8PathBuf,
        /// What is wrong with it
        detail: String,
    },
    /// The profile has no entry for the requested architecture
    #[error("architecture {arch} not found in {path}")]
    MissingArch {
        /// The requested architecture
        arch: String,
        /// The profile document
        path: Utf8PathBuf,
    },
}

/// The directory holding the profile for `os`/`dist`.
pub(crate) fn profile_dir(config_root: &Utf8Path, os: &str, dist: &str) -> Utf8PathBuf {
    config_root.join(OSV_DIR).join(os).join(dist)
}

/// Load the profile for `arch` from the profile directory.
pub(crate) fn load_profile(dir: &Utf8Path, arch: &str) -> Result<BuildProfile, ProfileError> {
    if !dir.is_dir() {
        return Err(ProfileError::ConfigDirMissing(dir.to_owned()));
    }
    let path = dir.join(PROFILE_FILE);
    if !path.is_file() {
        return Err(ProfileError::ConfigFileMissing(path));
    }
    let buf = std::fs::read_to_string(&path).map_err(|source| ProfileError::Io {
        path: path.clone(),
        source,
    })?;
    // Syntax first, so that a malformed document is not reported as a schema problem
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&buf).map_err(|source| ProfileError::Parse {
            path: path.clone(),
            source,
        })?;
    let validation = |detail: String| ProfileError::Validation {
        path: path.clone(),
        detail,
    };
    let mut profiles: BTreeMap<String, BuildProfile> =
        serde_yaml::from_value(doc).map_err(|e| validation(e.to_string()))?;
    for (key, profile) in profiles.iter() {
        if &profile.arch != key {
            return Err(validation(format!(
                "profile keyed {key} declares arch {}",
                profile.arch
            )));
        }
        for (field, v) in [
            ("dist", &profile.dist),
            ("releaseVersion", &profile.release_version),
        ] {
            if v.is_empty() {
                return Err(validation(format!("{key}.{field} must not be empty")));
            }
        }
        if profile.chroot_env_config_file.as_str().is_empty() {
            return Err(validation(format!(
                "{key}.chrootEnvConfigFile must not be empty"
            )));
        }
    }
    profiles
        .remove(arch)
        .ok_or_else(|| ProfileError::MissingArch {
            arch: arch.to_owned(),
            path,
        })
}

/// Resolve the build environment for a target and bind the package installer
/// matching its package manager kind.
#[context("Resolving build profile for {os} {dist} ({arch})")]
pub fn resolve(
    config_root: &Utf8Path,
    repo_path: &Utf8Path,
    os: &str,
    dist: &str,
    arch: &str,
) -> Result<ChrootBuilder> {
    let dir = profile_dir(config_root, os, dist);
    let profile = load_profile(&dir, arch)?;
    let installer = PackageInstaller::from(profile.pkg_type);
    tracing::debug!("Resolved {os} {dist} ({arch}): {profile:?}");
    Ok(ChrootBuilder::new(profile, dir, repo_path.to_owned(), installer))
}
