//! # OS provisioning
//!
//! This crate installs an operating system onto a disk from a declarative
//! image template: it resolves the build profile for the target
//! distribution, populates an installation root with the native package
//! manager, partitions and populates the target disk, and registers the
//! result with the firmware.

pub mod bootloader;
pub mod chroot;
pub mod cli;
pub mod config;
pub mod deps;
pub mod disk;
pub mod install;
pub mod profile;
pub mod progress;
pub mod template;
pub mod wizard;

#[cfg(test)]
mod testutils;
