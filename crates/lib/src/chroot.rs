//! # Building the installation root
//!
//! The installed system is first assembled in a chroot directory by the
//! distribution's own package manager, and later copied onto the target disk.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use osprov_utils::{CommandExecutor, ExecutorExt};

use crate::profile::{BuildProfile, PkgType};
use crate::progress::ProgressReporter;
use crate::template::ImageTemplate;

/// The name under which the local package repository is configured.
const LOCAL_REPO: &str = "osprov-local";

/// The secondary document a build profile points at.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ChrootEnvConfig {
    /// Packages making up the minimal installable system
    pub(crate) essential_packages: Vec<String>,
    /// Package manager configuration file, relative to the profile directory
    #[serde(default)]
    pub(crate) package_manager_config: Option<Utf8PathBuf>,
}

impl ChrootEnvConfig {
    #[context("Loading chroot environment config {path}")]
    pub(crate) fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
        Ok(serde_yaml::from_str(&buf)?)
    }
}

/// Installs packages into a chroot with the distribution's package manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageInstaller {
    /// `dnf --installroot`
    Rpm,
    /// `mmdebstrap`
    Deb,
}

impl From<PkgType> for PackageInstaller {
    fn from(value: PkgType) -> Self {
        match value {
            PkgType::Rpm => Self::Rpm,
            PkgType::Deb => Self::Deb,
        }
    }
}

/// Everything a package installer needs to know about one chroot.
#[derive(Debug)]
pub(crate) struct InstallContext<'a> {
    pub(crate) exec: &'a dyn CommandExecutor,
    pub(crate) root: &'a Utf8Path,
    pub(crate) profile: &'a BuildProfile,
    pub(crate) repo: &'a Utf8Path,
    pub(crate) package_manager_config: Option<&'a Utf8Path>,
}

impl PackageInstaller {
    /// Bootstrap the chroot with the distribution's essential packages.
    #[context("Installing essential packages into {}", ctx.root)]
    pub(crate) fn install_essential(&self, ctx: &InstallContext, packages: &[String]) -> Result<()> {
        match self {
            Self::Rpm => ctx.exec.run(Self::dnf(ctx).arg("install").args(packages)),
            Self::Deb => {
                let arch = debian_arch(&ctx.profile.arch)?;
                let codename = &ctx.profile.dist;
                let mut cmd = Command::new("mmdebstrap");
                cmd.arg("--variant=minbase")
                    .arg(format!("--arch={arch}"))
                    .arg(format!("--include={}", packages.join(",")))
                    .arg(codename)
                    .arg(ctx.root.as_str())
                    .arg(format!("deb [trusted=yes] file://{} {codename} main", ctx.repo));
                ctx.exec.run(&mut cmd)
            }
        }
    }

    /// Install additional packages into an already bootstrapped chroot.
    #[context("Installing packages into {}", ctx.root)]
    pub(crate) fn install(&self, ctx: &InstallContext, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        match self {
            Self::Rpm => ctx.exec.run(Self::dnf(ctx).arg("install").args(packages)),
            Self::Deb => ctx.exec.run(
                Command::new("chroot")
                    .arg(ctx.root.as_str())
                    .args(["apt-get", "install", "-y"])
                    .args(packages),
            ),
        }
    }

    fn dnf(ctx: &InstallContext) -> Command {
        let mut cmd = Command::new("dnf");
        cmd.arg(format!("--installroot={}", ctx.root))
            .arg(format!("--releasever={}", ctx.profile.release_version))
            .arg(format!("--forcearch={}", ctx.profile.arch))
            .arg("--disablerepo=*")
            .arg(format!("--repofrompath={LOCAL_REPO},{}", ctx.repo))
            .arg(format!("--enablerepo={LOCAL_REPO}"))
            .args(["--nogpgcheck", "--setopt=install_weak_deps=False"]);
        if let Some(config) = ctx.package_manager_config {
            cmd.arg(format!("--config={config}"));
        }
        cmd.arg("-y");
        cmd
    }

    /// The group granting administrative rights on this family of distributions.
    pub(crate) fn admin_group(&self) -> &'static str {
        match self {
            Self::Rpm => "wheel",
            Self::Deb => "sudo",
        }
    }
}

fn debian_arch(arch: &str) -> Result<&'static str> {
    match arch {
        "x86_64" => Ok("amd64"),
        "aarch64" => Ok("arm64"),
        o => anyhow::bail!("No Debian architecture for {o}"),
    }
}

/// A populated installation root; removed from disk when dropped.
#[derive(Debug)]
pub struct Chroot {
    path: Utf8PathBuf,
    _tempdir: tempfile::TempDir,
}

impl Chroot {
    /// The root directory of the installation.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// Builds one installation root for a resolved build profile.
#[derive(Debug)]
pub struct ChrootBuilder {
    profile: BuildProfile,
    profile_dir: Utf8PathBuf,
    cache_dir: Utf8PathBuf,
    installer: PackageInstaller,
}

impl ChrootBuilder {
    pub(crate) fn new(
        profile: BuildProfile,
        profile_dir: Utf8PathBuf,
        cache_dir: Utf8PathBuf,
        installer: PackageInstaller,
    ) -> Self {
        Self {
            profile,
            profile_dir,
            cache_dir,
            installer,
        }
    }

    /// The profile this builder was resolved from.
    pub fn profile(&self) -> &BuildProfile {
        &self.profile
    }

    /// The package installer bound to the profile's package type.
    pub fn installer(&self) -> PackageInstaller {
        self.installer
    }

    /// The local package repository packages are installed from.
    pub fn cache_dir(&self) -> &Utf8Path {
        &self.cache_dir
    }

    /// Populate a new chroot below `work_dir` with the essential packages,
    /// the template's packages, its hostname and its users.
    #[context("Building installation root")]
    pub fn build(
        &self,
        exec: &dyn CommandExecutor,
        template: &ImageTemplate,
        work_dir: &Utf8Path,
        reporter: &ProgressReporter,
    ) -> Result<Chroot> {
        reporter.progress(0);
        reporter.status(format!("Preparing installation root for {}", template.target));
        let env_path = self.profile_dir.join(&self.profile.chroot_env_config_file);
        let env = ChrootEnvConfig::load(&env_path)?;
        let package_manager_config = env
            .package_manager_config
            .as_ref()
            .map(|p| self.profile_dir.join(p));

        std::fs::create_dir_all(work_dir).with_context(|| format!("Creating {work_dir}"))?;
        let tempdir = tempfile::Builder::new()
            .prefix("chroot-")
            .tempdir_in(work_dir)
            .with_context(|| format!("Creating chroot below {work_dir}"))?;
        let root = Utf8Path::from_path(tempdir.path())
            .context("Non-UTF8 work directory")?
            .to_owned();
        reporter.progress(5);

        reporter.status(format!(
            "Installing {} essential packages from {}",
            env.essential_packages.len(),
            self.cache_dir
        ));
        let ctx = InstallContext {
            exec,
            root: &root,
            profile: &self.profile,
            repo: &self.cache_dir,
            package_manager_config: package_manager_config.as_deref(),
        };
        self.installer
            .install_essential(&ctx, &env.essential_packages)?;
        reporter.progress(50);

        let packages = &template.system_config.packages;
        if !packages.is_empty() {
            reporter.status(format!("Installing {} additional packages", packages.len()));
            self.installer.install(&ctx, packages)?;
        }
        reporter.progress(80);

        let hostname = template.system_config.hostname.as_str();
        if !hostname.is_empty() {
            reporter.status(format!("Setting hostname to {hostname}"));
            let etc = root.join("etc");
            std::fs::create_dir_all(&etc)?;
            std::fs::write(etc.join("hostname"), format!("{hostname}\n"))
                .context("Writing /etc/hostname")?;
        }
        reporter.progress(85);

        for user in template.system_config.users.iter() {
            reporter.status(format!("Creating user {}", user.name));
            let mut groups = user.groups.clone();
            if user.sudo {
                groups.push(self.installer.admin_group().to_owned());
            }
            let mut cmd = Command::new("useradd");
            cmd.args(["--root", root.as_str(), "-m"]);
            if !groups.is_empty() {
                cmd.args(["-G", groups.join(",").as_str()]);
            }
            if let Some(hash) = user.password_hash.as_deref() {
                cmd.args(["-p", hash]);
            }
            cmd.arg(&user.name);
            exec.run(&mut cmd)
                .with_context(|| format!("Creating user {}", user.name))?;
        }
        reporter.progress(100);
        reporter.status("Installation root complete");

        Ok(Chroot {
            path: root,
            _tempdir: tempdir,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::profile::tests::{write_config_root, AZL3_PROFILE};
    use crate::progress::progress_channel;
    use crate::progress::tests::RecordingSink;
    use crate::testutils::FakeExecutor;

    fn builder(profile: &str) -> (tempfile::TempDir, ChrootBuilder) {
        let (td, root) = write_config_root(profile);
        let b = crate::profile::resolve(&root, "/srv/repo".into(), "azure-linux", "3.0", "x86_64")
            .unwrap();
        (td, b)
    }

    /// A chroot with nothing in it, below `work_dir`.
    pub(crate) fn empty_chroot(work_dir: &Utf8Path) -> Result<Chroot> {
        let tempdir = tempfile::tempdir_in(work_dir)?;
        let path = Utf8Path::from_path(tempdir.path()).unwrap().to_owned();
        Ok(Chroot {
            path,
            _tempdir: tempdir,
        })
    }

    const DNF: &str = "dnf --installroot={root} --releasever=3.0 --forcearch=x86_64 \
        --disablerepo=* --repofrompath=osprov-local,/srv/repo --enablerepo=osprov-local \
        --nogpgcheck --setopt=install_weak_deps=False -y install";

    #[tokio::test]
    async fn build_rpm() -> Result<()> {
        let (td, builder) = builder(AZL3_PROFILE);
        let work = Utf8Path::from_path(td.path()).unwrap().join("work");
        let exec = FakeExecutor::default();
        let template = crate::template::tests::example();
        let (reporter, receivers) = progress_channel();
        let sink = Arc::new(RecordingSink::default());
        let drain = tokio::spawn(receivers.drain(sink.clone()));

        let chroot = builder.build(&exec, &template, &work, &reporter)?;
        drop(reporter);
        drain.await??;

        let root = chroot.path().to_owned();
        assert!(root.starts_with(&work));
        assert_eq!(
            std::fs::read_to_string(root.join("etc/hostname"))?,
            "edge-01\n"
        );
        let dnf = DNF.replace("{root}", root.as_str());
        let cmds = exec.commands();
        similar_asserts::assert_eq!(
            cmds,
            [
                format!("{dnf} filesystem bash systemd"),
                format!("{dnf} openssh-server"),
                format!("useradd --root {root} -m -G wheel -p $6$salt$hash admin"),
            ]
        );
        let progress = sink.progress.lock().unwrap().clone();
        assert_eq!(progress.first(), Some(&0));
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(!sink.status.lock().unwrap().is_empty());

        drop(chroot);
        assert!(!root.exists());
        Ok(())
    }

    #[test]
    fn deb_bootstrap() -> Result<()> {
        let doc = AZL3_PROFILE
            .replace("pkgType: rpm", "pkgType: deb")
            .replace("dist: azl3", "dist: noble");
        let (td, builder) = builder(&doc);
        let installer = builder.installer();
        assert_eq!(installer.admin_group(), "sudo");
        let exec = FakeExecutor::default();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let ctx = InstallContext {
            exec: &exec,
            root,
            profile: builder.profile(),
            repo: builder.cache_dir(),
            package_manager_config: None,
        };
        installer.install_essential(&ctx, &["bash".into(), "systemd".into()])?;
        installer.install(&ctx, &["openssh-server".into()])?;
        installer.install(&ctx, &[])?;
        similar_asserts::assert_eq!(
            exec.commands(),
            [
                format!(
                    "mmdebstrap --variant=minbase --arch=amd64 --include=bash,systemd \
                     noble {root} deb [trusted=yes] file:///srv/repo noble main"
                ),
                format!("chroot {root} apt-get install -y openssh-server"),
            ]
        );
        Ok(())
    }

    #[test]
    fn package_manager_config() -> Result<()> {
        let (td, root) = write_config_root(AZL3_PROFILE);
        let dir = crate::profile::profile_dir(&root, "azure-linux", "3.0");
        std::fs::write(
            dir.join("chrootenv_x86_64.yml"),
            "essentialPackages: [bash]\npackageManagerConfig: dnf.conf\n",
        )?;
        let builder = crate::profile::resolve(&root, "/srv/repo".into(), "azure-linux", "3.0", "x86_64")?;
        let exec = FakeExecutor::default();
        let (reporter, _receivers) = progress_channel();
        let mut template = crate::template::tests::example();
        template.system_config.packages.clear();
        template.system_config.users.clear();
        let work = Utf8Path::from_path(td.path()).unwrap().join("work");
        let _chroot = builder.build(&exec, &template, &work, &reporter)?;
        let cmds = exec.commands();
        assert_eq!(cmds.len(), 1, "{cmds:?}");
        assert!(cmds[0].contains(&format!("--config={dir}/dnf.conf -y install bash")));
        Ok(())
    }

    #[test]
    fn install_failure_propagates() {
        let (td, builder) = builder(AZL3_PROFILE);
        let work = Utf8Path::from_path(td.path()).unwrap().join("work");
        let exec = FakeExecutor::default();
        exec.fail("dnf", "No match for argument: openssh-server");
        let (reporter, _receivers) = progress_channel();
        let template = crate::template::tests::example();
        let err = builder
            .build(&exec, &template, &work, &reporter)
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("Building installation root"), "{msg}");
        assert!(msg.contains("No match for argument"), "{msg}");
        // Nothing runs after the first failure
        assert_eq!(exec.commands().len(), 1);
    }
}
