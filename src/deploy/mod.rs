//! Deployment pipelines
//!
//! Both pipelines follow the same shape: boot the master image, stage
//! artifacts in a fresh [`TempWorkspace`], then reformat and refill test
//! partitions from the master shell. The workspace is removed and every
//! mount taken along the way is released however the pipeline ends.

pub mod android;
pub mod linux;
pub mod ramdisk;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::{self, ArtifactStore, TempWorkspace};
use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::host::HostOps;
use crate::image::BuildLock;
use crate::shell::{CommandRunner, ShellCommand};

pub use android::{AndroidDeployer, AndroidImage};
pub use linux::{KernelPackage, LinuxDeployer, LinuxImage};

/// Shared collaborators of one deploy call
#[derive(Clone, Copy)]
pub struct DeployContext<'a> {
    pub config: &'a DispatcherConfig,
    pub host: &'a dyn HostOps,
    pub store: &'a dyn ArtifactStore,
    pub build_lock: &'a BuildLock,
    pub use_cache: bool,
}

impl<'a> DeployContext<'a> {
    pub fn new(
        config: &'a DispatcherConfig,
        host: &'a dyn HostOps,
        store: &'a dyn ArtifactStore,
        build_lock: &'a BuildLock,
    ) -> Self {
        Self {
            config,
            host,
            store,
            build_lock,
            use_cache: true,
        }
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// New workspace under the image temp root
    pub fn workspace(&self) -> Result<TempWorkspace> {
        TempWorkspace::create(&self.config.lava_image_tmpdir)
    }

    /// Fetch `url` into the workspace, through the cache when enabled
    pub async fn stage(&self, url: &str, workspace: &TempWorkspace) -> Result<PathBuf> {
        let cache = self.use_cache.then_some(self.config.lava_cachedir.as_path());
        Ok(artifact::stage(self.store, url, workspace, cache).await?.local_path)
    }

    /// URL the board uses to fetch a workspace file
    pub fn public_url(&self, path: &Path) -> Result<String> {
        artifact::public_url(path, &self.config.lava_image_tmpdir, &self.config.lava_image_url)
    }
}

/// Compression of a tarball streamed onto the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
}

impl Compression {
    fn tar_flag(self) -> &'static str {
        match self {
            Compression::Gzip => "-xzf",
            Compression::Bzip2 => "-xjf",
        }
    }
}

pub(crate) fn label_device(label: &str) -> String {
    format!("/dev/disk/by-label/{}", label)
}

/// `wget -qO- URL | tar --numeric-owner -C DIR -x?f -`
pub fn stream_extract_command(url: &str, dir: &str, compression: Compression) -> ShellCommand {
    ShellCommand::new("wget").args(["-qO-", url]).pipe(
        ShellCommand::new("tar").args(["--numeric-owner", "-C", dir, compression.tar_flag(), "-"]),
    )
}

/// Refresh `/dev/disk/by-label` after filesystems were recreated
pub(crate) async fn udev_trigger(runner: &mut CommandRunner<'_>) -> Result<()> {
    runner.run(&ShellCommand::new("udevadm").arg("trigger")).await?;
    Ok(())
}

/// Filesystem types the test partitions are created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    Ext3,
    Ext4,
    Vfat,
}

/// Unmount a labelled partition, then recreate its filesystem
///
/// The unmount status is ignored since the partition is usually not
/// mounted; a failing mkfs is an error.
pub(crate) async fn reformat(runner: &mut CommandRunner<'_>, label: &str, fs: Filesystem) -> Result<()> {
    let device = label_device(label);
    runner
        .run(&ShellCommand::new("umount").arg(device.clone()))
        .await?;

    let mkfs = match fs {
        Filesystem::Ext3 => ShellCommand::new("mkfs.ext3").args(["-q", device.as_str(), "-L", label]),
        Filesystem::Ext4 => ShellCommand::new("mkfs.ext4").args(["-q", device.as_str(), "-L", label]),
        Filesystem::Vfat => ShellCommand::new("mkfs.vfat").args([device.as_str(), "-n", label]),
    };
    let timeout = runner.default_timeout();
    runner.run_checked(&mkfs, timeout).await
}

/// A partition mounted from the master shell for the length of one step
#[must_use = "mounted partitions must be unmounted"]
pub(crate) struct MountPoint {
    target: String,
    released: bool,
}

impl MountPoint {
    /// `mkdir -p TARGET && mount /dev/disk/by-label/LABEL TARGET`
    pub(crate) async fn mount(runner: &mut CommandRunner<'_>, label: &str, target: &str) -> Result<Self> {
        runner
            .run(&ShellCommand::new("mkdir").args(["-p", target]))
            .await?;
        let mount = ShellCommand::new("mount").arg(label_device(label)).arg(target);
        let timeout = runner.default_timeout();
        runner.run_checked(&mount, timeout).await?;
        Ok(Self {
            target: target.to_string(),
            released: false,
        })
    }

    pub(crate) async fn unmount(mut self, runner: &mut CommandRunner<'_>) -> Result<()> {
        self.released = true;
        let timeout = runner.default_timeout();
        runner
            .run_checked(&ShellCommand::new("umount").arg(self.target.clone()), timeout)
            .await
    }
}

impl Drop for MountPoint {
    fn drop(&mut self) {
        if !self.released {
            warn!("{} left mounted", self.target);
        }
    }
}

/// Run a tarball stream and fail when it does not exit cleanly
pub(crate) async fn extract_tarball(
    runner: &mut CommandRunner<'_>,
    url: &str,
    dir: &str,
    compression: Compression,
    timeout: Duration,
) -> Result<()> {
    info!("Extracting {} into {}", url, dir);
    let cmd = stream_extract_command(url, dir, compression);
    let rc = runner.run_with_timeout(&cmd, timeout).await?;
    if rc != 0 {
        return Err(Error::CommandFailed {
            command: format!("download of {}", url),
            rc,
        });
    }
    Ok(())
}
