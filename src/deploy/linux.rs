//! Linaro (Linux) image deployment
//!
//! The image is built on the dispatcher from a hardware pack and a root
//! filesystem, cut into boot and root tarballs, and streamed onto the
//! board's `testboot` and `testrootfs` partitions from the master shell.

use crate::config::{DeviceConfig, TimeoutConfig};
use crate::error::{Error, Result};
use crate::image::{ImageBuilder, PartitionTarballs, MEDIA_CREATE_VERSION_KEY};
use crate::job::{escalate, MetadataSink};
use crate::session::{settle, SessionManager};
use crate::shell::{CommandRunner, ShellCommand};
use crate::artifact::TempWorkspace;

use super::{extract_tarball, reformat, udev_trigger, Compression, DeployContext, Filesystem, MountPoint};

pub const TEST_BOOT_LABEL: &str = "testboot";
pub const TEST_ROOT_LABEL: &str = "testrootfs";
pub const ROOTFS_MOUNT: &str = "/mnt/root";
pub const BOOTFS_MOUNT: &str = "/mnt/boot";

/// Replacement kernel for the hardware pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPackage {
    pub url: String,
    /// Package name prefix of the kernel being replaced
    pub prefix: String,
}

impl KernelPackage {
    /// Only Debian packages can be swapped into a hwpack
    pub fn new(url: impl Into<String>, prefix: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if url.rsplit('.').next() != Some("deb") {
            return Err(Error::UnsupportedKernelPackage { url });
        }
        Ok(Self {
            url,
            prefix: prefix.into(),
        })
    }
}

/// What to deploy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxImage {
    pub hwpack: String,
    pub rootfs: String,
    pub kernel: Option<KernelPackage>,
}

pub struct LinuxDeployer<'a> {
    ctx: DeployContext<'a>,
}

impl<'a> LinuxDeployer<'a> {
    pub fn new(ctx: DeployContext<'a>) -> Self {
        Self { ctx }
    }

    /// Deploy `image` onto the board's test partitions
    ///
    /// The workspace is removed on every path. Failures past booting are
    /// escalated to fatal errors with their trace written to `sink`.
    pub async fn deploy(
        &self,
        sessions: &mut SessionManager,
        sink: &mut dyn MetadataSink,
        image: &LinuxImage,
    ) -> Result<()> {
        info!("Deploying {} with hwpack {}", image.rootfs, image.hwpack);
        sessions.boot_master_image().await?;

        let workspace = self.ctx.workspace()?;
        let outcome = self.deploy_in(sessions, sink, image, &workspace).await;
        settle(outcome, workspace.close())
    }

    async fn deploy_in(
        &self,
        sessions: &mut SessionManager,
        sink: &mut dyn MetadataSink,
        image: &LinuxImage,
        workspace: &TempWorkspace,
    ) -> Result<()> {
        let device = sessions.device().clone();
        let timeouts = sessions.timeouts().clone();
        let mut master = sessions.master_session().await?;

        format_test_partitions(&mut master)
            .await
            .map_err(|e| escalate(sink, "Formatting test partitions failed", e))?;

        master
            .wait_network_up(&self.ctx.config.lava_server_ip, timeouts.network_up(), timeouts.ping())
            .await
            .map_err(|e| escalate(sink, "Unable to reach LAVA server, check network", e))?;

        let tarballs = self
            .prepare_tarballs(&device, sink, image, workspace)
            .await
            .map_err(|e| escalate(sink, "Deployment tarballs preparation failed", e))?;

        let deployed = async {
            let boot_url = self.ctx.public_url(&tarballs.boot)?;
            let root_url = self.ctx.public_url(&tarballs.root)?;
            deploy_rootfs(&mut master, &root_url, &device, &timeouts).await?;
            deploy_bootfs(&mut master, &boot_url, &timeouts).await
        }
        .await;
        deployed.map_err(|e| escalate(sink, "Deployment failed", e))
    }

    /// Stage inputs, build the image and cut the partition tarballs
    async fn prepare_tarballs(
        &self,
        device: &DeviceConfig,
        sink: &mut dyn MetadataSink,
        image: &LinuxImage,
        workspace: &TempWorkspace,
    ) -> Result<PartitionTarballs> {
        let builder = ImageBuilder::new(self.ctx.host, &self.ctx.config.tools, self.ctx.build_lock);

        // The kernel swap looks for the only hwpack in the workspace, so it
        // runs before the root filesystem is staged
        let hwpack = match &image.kernel {
            Some(kernel) => {
                let deb = self.ctx.stage(&kernel.url, workspace).await?;
                let original = self.ctx.stage(&image.hwpack, workspace).await?;
                builder.replace_kernel(&original, &deb, &kernel.prefix).await?
            }
            None => self.ctx.stage(&image.hwpack, workspace).await?,
        };
        let rootfs = self.ctx.stage(&image.rootfs, workspace).await?;

        match builder.tool_version().await {
            Ok(version) => sink.add_metadata(MEDIA_CREATE_VERSION_KEY, &version),
            Err(e) => warn!("Could not read the image tool version: {}", e),
        }

        builder
            .strip_packages(&hwpack, &device.hwpack_packages_to_strip())
            .await?;
        let raw = builder
            .build(workspace.path(), &hwpack, &rootfs, &device.media_create_dev)
            .await?;
        builder
            .partition_tarballs(&raw, workspace.path(), device.boot_part, device.root_part)
            .await
    }
}

/// Recreate the Linux test filesystems
pub async fn format_test_partitions(runner: &mut CommandRunner<'_>) -> Result<()> {
    info!("Formatting test partitions");
    reformat(runner, TEST_ROOT_LABEL, Filesystem::Ext3).await?;
    reformat(runner, TEST_BOOT_LABEL, Filesystem::Vfat).await
}

/// Fill `testrootfs` and keep the deployed image from touching firmware
pub async fn deploy_rootfs(
    runner: &mut CommandRunner<'_>,
    url: &str,
    device: &DeviceConfig,
    timeouts: &TimeoutConfig,
) -> Result<()> {
    info!("Deploying root filesystem");
    udev_trigger(runner).await?;
    let mount = MountPoint::mount(runner, TEST_ROOT_LABEL, ROOTFS_MOUNT).await?;
    let outcome = populate_rootfs(runner, url, device, timeouts).await;
    settle(outcome, mount.unmount(runner).await)
}

async fn populate_rootfs(
    runner: &mut CommandRunner<'_>,
    url: &str,
    device: &DeviceConfig,
    timeouts: &TimeoutConfig,
) -> Result<()> {
    extract_tarball(runner, url, ROOTFS_MOUNT, Compression::Gzip, timeouts.rootfs_extract()).await?;

    let hostname = ShellCommand::new("echo")
        .arg(device.tester_hostname.as_str())
        .write_to(format!("{}/etc/hostname", ROOTFS_MOUNT));
    runner.run(&hostname).await?;

    // Kernel upgrades inside the test image must not reflash the master's
    // boot firmware
    let mut chroot = runner.chrooted(ROOTFS_MOUNT);
    chroot
        .run(&ShellCommand::new("dpkg-divert").args(["--local", "/usr/sbin/flash-kernel"]))
        .await?;
    let timeout = chroot.default_timeout();
    chroot
        .run_checked(
            &ShellCommand::new("ln").args(["-sf", "/bin/true", "/usr/sbin/flash-kernel"]),
            timeout,
        )
        .await
}

/// Fill `testboot`
pub async fn deploy_bootfs(runner: &mut CommandRunner<'_>, url: &str, timeouts: &TimeoutConfig) -> Result<()> {
    info!("Deploying boot filesystem");
    udev_trigger(runner).await?;
    let mount = MountPoint::mount(runner, TEST_BOOT_LABEL, BOOTFS_MOUNT).await?;
    let outcome = extract_tarball(runner, url, BOOTFS_MOUNT, Compression::Gzip, timeouts.rootfs_extract()).await;
    settle(outcome, mount.unmount(runner).await)
}
