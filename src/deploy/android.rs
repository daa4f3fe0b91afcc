//! Linaro Android deployment
//!
//! Android builds arrive as ready-made tarballs, so nothing is built on the
//! dispatcher: the tarballs are published from the workspace and the board
//! unpacks them onto its partitions. The boot ramdisk and `vold.fstab` are
//! then patched for the lab's partition layout.

use std::path::Path;

use crate::artifact::TempWorkspace;
use crate::config::{AndroidLayout, TimeoutConfig};
use crate::error::{Error, Result};
use crate::job::{escalate, MetadataSink};
use crate::session::{settle, SessionManager};
use crate::shell::CommandRunner;

use super::ramdisk::{vold_fstab_script, RamdiskRepack, ANDROID_BOOT_MOUNT};
use super::{extract_tarball, reformat, udev_trigger, Compression, DeployContext, Filesystem, MountPoint};

pub const ANDROID_ROOT: &str = "/mnt/lava";
pub const SYSTEM_MOUNT: &str = "/mnt/lava/system";
pub const DATA_MOUNT: &str = "/mnt/lava/data";

const TEST_BOOT_LABEL: &str = "testboot";
const TEST_ROOT_LABEL: &str = "testrootfs";
const SDCARD_LABEL: &str = "sdcard";
const DATA_LABEL: &str = "data";
const SYSTEM_LABEL: &str = "system";

/// Tarballs of one Android build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndroidImage {
    pub boot: String,
    pub system: String,
    pub data: String,
    /// Extra tarball unpacked over the boot partition
    pub pkg: Option<String>,
    /// Also refill the `data` partition
    pub install_data: bool,
    /// Also refill the separate `system` partition
    pub install_system: bool,
}

impl AndroidImage {
    pub fn new(boot: impl Into<String>, system: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            boot: boot.into(),
            system: system.into(),
            data: data.into(),
            pkg: None,
            install_data: false,
            install_system: false,
        }
    }
}

/// Board-side URLs of the staged tarballs
struct Published {
    boot: String,
    system: String,
    data: String,
    pkg: Option<String>,
}

pub struct AndroidDeployer<'a> {
    ctx: DeployContext<'a>,
}

impl<'a> AndroidDeployer<'a> {
    pub fn new(ctx: DeployContext<'a>) -> Self {
        Self { ctx }
    }

    pub async fn deploy(
        &self,
        sessions: &mut SessionManager,
        sink: &mut dyn MetadataSink,
        image: &AndroidImage,
    ) -> Result<()> {
        let layout = sessions.device().android_layout()?.clone();
        info!("Deploying Android build {}", image.boot);
        sessions.boot_master_image().await?;

        let workspace = self.ctx.workspace()?;
        let outcome = self
            .deploy_in(sessions, sink, image, &layout, &workspace)
            .await;
        let closed = settle(outcome, workspace.close());
        info!("Android image deployment exiting");
        closed
    }

    async fn deploy_in(
        &self,
        sessions: &mut SessionManager,
        sink: &mut dyn MetadataSink,
        image: &AndroidImage,
        layout: &AndroidLayout,
        workspace: &TempWorkspace,
    ) -> Result<()> {
        let timeouts = sessions.timeouts().clone();
        let mut master = sessions.master_session().await?;

        master
            .wait_network_up(&self.ctx.config.lava_server_ip, timeouts.network_up(), timeouts.ping())
            .await
            .map_err(|e| escalate(sink, "Unable to reach LAVA server, check network", e))?;

        let urls = self
            .publish(image, workspace)
            .await
            .map_err(|e| escalate(sink, "Unable to download artifacts for deployment", e))?;

        let deployed = async {
            deploy_testboot(&mut master, &urls.boot, urls.pkg.as_deref(), layout, &timeouts).await?;
            deploy_testrootfs(&mut master, &urls.system, layout, &timeouts).await?;
            purge_sdcard(&mut master).await?;
            if image.install_data {
                deploy_data_partition(&mut master, &urls.data, &timeouts).await?;
            }
            if image.install_system {
                deploy_system_partition(&mut master, &urls.system, &timeouts).await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        deployed.map_err(|e| escalate(sink, "Android deployment failed", e))
    }

    async fn publish(&self, image: &AndroidImage, workspace: &TempWorkspace) -> Result<Published> {
        let boot = self.ctx.stage(&image.boot, workspace).await?;
        let system = self.ctx.stage(&image.system, workspace).await?;
        let data = self.ctx.stage(&image.data, workspace).await?;
        let pkg = match &image.pkg {
            Some(url) => Some(self.ctx.stage(url, workspace).await?),
            None => None,
        };

        let url = |path: &Path| self.ctx.public_url(path);
        Ok(Published {
            boot: url(&boot)?,
            system: url(&system)?,
            data: url(&data)?,
            pkg: pkg.as_deref().map(url).transpose()?,
        })
    }
}

/// Refill `testboot` and patch its ramdisk
pub async fn deploy_testboot(
    runner: &mut CommandRunner<'_>,
    boot_url: &str,
    pkg_url: Option<&str>,
    layout: &AndroidLayout,
    timeouts: &TimeoutConfig,
) -> Result<()> {
    info!("Deploying test boot filesystem");
    reformat(runner, TEST_BOOT_LABEL, Filesystem::Vfat).await?;
    udev_trigger(runner).await?;
    let mount = MountPoint::mount(runner, TEST_BOOT_LABEL, ANDROID_BOOT_MOUNT).await?;

    let outcome = async {
        extract_tarball(runner, boot_url, ANDROID_ROOT, Compression::Bzip2, timeouts.android_extract()).await?;
        if let Some(pkg) = pkg_url {
            extract_tarball(runner, pkg, ANDROID_ROOT, Compression::Bzip2, timeouts.android_extract()).await?;
        }
        recreate_uinitrd(runner, layout).await
    }
    .await;
    settle(outcome, mount.unmount(runner).await)
}

/// Unpack, patch and rewrap the ramdisk on the mounted boot partition
///
/// The scratch directory is removed whether or not the repack worked.
pub async fn recreate_uinitrd(runner: &mut CommandRunner<'_>, layout: &AndroidLayout) -> Result<()> {
    let repack = RamdiskRepack::new(layout);
    let timeout = runner.default_timeout();

    let mut outcome = Ok(());
    for step in repack.steps() {
        if let Err(e) = runner.run_checked(&step, timeout).await {
            outcome = Err(e);
            break;
        }
    }
    let cleaned = runner.run(&repack.cleanup()).await.map(|_| ());
    settle(outcome, cleaned)
}

/// Refill `testrootfs` with the system tarball and fix up `vold.fstab`
pub async fn deploy_testrootfs(
    runner: &mut CommandRunner<'_>,
    system_url: &str,
    layout: &AndroidLayout,
    timeouts: &TimeoutConfig,
) -> Result<()> {
    info!("Deploying test root filesystem");
    reformat(runner, TEST_ROOT_LABEL, Filesystem::Ext4).await?;
    udev_trigger(runner).await?;
    let mount = MountPoint::mount(runner, TEST_ROOT_LABEL, SYSTEM_MOUNT).await?;

    let outcome = async {
        extract_tarball(runner, system_url, ANDROID_ROOT, Compression::Bzip2, timeouts.android_extract()).await?;
        let fstab = format!("{}/etc/vold.fstab", SYSTEM_MOUNT);
        // Images without vold.fstab keep whatever sdcard handling they ship
        for cmd in vold_fstab_script(layout).commands(&fstab) {
            let rc = runner.run(&cmd).await?;
            if rc != 0 {
                warn!("Could not patch {} (rc={}), leaving it as shipped", fstab, rc);
            }
        }
        Ok::<(), Error>(())
    }
    .await;
    settle(outcome, mount.unmount(runner).await)
}

/// Wipe the sdcard partition
pub async fn purge_sdcard(runner: &mut CommandRunner<'_>) -> Result<()> {
    info!("Reformatting sdcard partition");
    reformat(runner, SDCARD_LABEL, Filesystem::Vfat).await?;
    udev_trigger(runner).await
}

/// Refill the `data` partition
pub async fn deploy_data_partition(runner: &mut CommandRunner<'_>, data_url: &str, timeouts: &TimeoutConfig) -> Result<()> {
    info!("Deploying data partition");
    deploy_ext4_partition(runner, DATA_LABEL, DATA_MOUNT, data_url, timeouts).await
}

/// Refill the separate `system` partition
pub async fn deploy_system_partition(
    runner: &mut CommandRunner<'_>,
    system_url: &str,
    timeouts: &TimeoutConfig,
) -> Result<()> {
    info!("Deploying system partition");
    deploy_ext4_partition(runner, SYSTEM_LABEL, SYSTEM_MOUNT, system_url, timeouts).await
}

async fn deploy_ext4_partition(
    runner: &mut CommandRunner<'_>,
    label: &str,
    target: &str,
    url: &str,
    timeouts: &TimeoutConfig,
) -> Result<()> {
    reformat(runner, label, Filesystem::Ext4).await?;
    udev_trigger(runner).await?;
    let mount = MountPoint::mount(runner, label, target).await?;
    let outcome = extract_tarball(runner, url, ANDROID_ROOT, Compression::Bzip2, timeouts.android_extract()).await;
    settle(outcome, mount.unmount(runner).await)
}
