//! Disk image building
//!
//! The external image tool turns a hardware pack and a root filesystem
//! into a raw disk image. Individual partitions are then loop-mounted at
//! their byte offset and archived so the board can stream them onto its
//! test partitions.

pub mod lock;

use std::path::{Path, PathBuf};

use crate::config::ToolConfig;
use crate::error::{Error, Result};
use crate::host::{HostCommand, HostOps};

pub use lock::{BuildLock, BuildLockGuard};

/// Raw image written into the workspace by the image tool
pub const IMAGE_FILE: &str = "lava.img";
pub const BOOT_TARBALL: &str = "boot.tgz";
pub const ROOT_TARBALL: &str = "root.tgz";

/// Metadata key for the image tool's version output
pub const MEDIA_CREATE_VERSION_KEY: &str = "target.linaro-media-create-version";

/// Boot and root tarballs cut from one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTarballs {
    pub boot: PathBuf,
    pub root: PathBuf,
}

/// Drives the host-side image tools
pub struct ImageBuilder<'a> {
    host: &'a dyn HostOps,
    tools: &'a ToolConfig,
    lock: &'a BuildLock,
}

impl<'a> ImageBuilder<'a> {
    /// `lock` is the host-wide build lock shared by every builder
    pub fn new(host: &'a dyn HostOps, tools: &'a ToolConfig, lock: &'a BuildLock) -> Self {
        Self { host, tools, lock }
    }

    fn tool(&self, program: &str) -> HostCommand {
        HostCommand::new(program).sudo(self.tools.use_sudo)
    }

    /// Version banner of the image tool, for the job record
    pub async fn tool_version(&self) -> Result<String> {
        let output = self
            .host
            .run(&self.tool(&self.tools.media_create).arg("-v"))
            .await?;
        Ok(output.output.trim().to_string())
    }

    /// Remove packages from a hardware pack in place
    ///
    /// The hwpack is first given its own inode so a hard-linked cache
    /// entry is not edited along with it.
    pub async fn strip_packages(&self, hwpack: &Path, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        detach(hwpack).await?;
        for package in packages {
            info!("Removing {} from {}", package, hwpack.display());
            let cmd = self
                .tool(&self.tools.hwpack_replace)
                .args(["-r", package.as_str(), "-t"])
                .path_arg(hwpack)
                .arg("-i");
            self.host.run_checked(&cmd).await?;
        }
        Ok(())
    }

    /// Swap the kernel package inside a hardware pack
    ///
    /// The replace tool writes a new hwpack next to the old one without
    /// letting us name it, so the old file is removed and the one remaining
    /// `.gz` in the directory is the result.
    pub async fn replace_kernel(&self, hwpack: &Path, kernel_deb: &Path, prefix: &str) -> Result<PathBuf> {
        let dir = hwpack
            .parent()
            .ok_or_else(|| Error::Other(format!("{} has no parent directory", hwpack.display())))?;

        info!("Replacing {} kernel in {}", prefix, hwpack.display());
        let cmd = self
            .tool(&self.tools.hwpack_replace)
            .arg("-t")
            .path_arg(hwpack)
            .arg("-p")
            .path_arg(kernel_deb)
            .args(["-r", prefix])
            .current_dir(dir);
        self.host.run_checked(&cmd).await?;

        tokio::fs::remove_file(hwpack).await?;
        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "gz") {
                candidates.push(path);
            }
        }
        candidates.sort();
        candidates.into_iter().next().ok_or_else(|| Error::ToolFailed {
            tool: self.tools.hwpack_replace.clone(),
            status: 0,
            output: format!("no new hwpack in {}", dir.display()),
        })
    }

    /// Build `lava.img` in `workspace` under the cross-process build lock
    pub async fn build(&self, workspace: &Path, hwpack: &Path, rootfs: &Path, device: &str) -> Result<PathBuf> {
        let image = workspace.join(IMAGE_FILE);
        let _guard = self.lock.acquire().await?;

        let cmd = self
            .tool(&self.tools.media_create)
            .args(["--hwpack-force-yes", "--dev", device])
            .arg("--image-file")
            .path_arg(&image)
            .arg("--binary")
            .path_arg(rootfs)
            .arg("--hwpack")
            .path_arg(hwpack)
            .args(["--image-size", self.tools.image_size.as_str()]);
        info!("Executing the image tool: {}", cmd);
        self.host.run_checked(&cmd).await?;
        Ok(image)
    }

    /// Byte offset of a 1-based partition inside `image`
    pub async fn partition_offset(&self, image: &Path, index: u32) -> Result<String> {
        let cmd = HostCommand::new(&self.tools.parted)
            .path_arg(image)
            .args(["-m", "-s", "unit", "b", "print"]);
        let dump = self.host.run_checked(&cmd).await?;
        parse_partition_offset(&dump.output, index).ok_or_else(|| Error::PartitionNotFound {
            image: image.to_path_buf(),
            index,
        })
    }

    /// Archive one partition of `image` into `tarball`
    ///
    /// The loop mount is always undone, even when tar fails; the tar error
    /// is the one reported.
    pub async fn extract_partition(&self, image: &Path, offset: &str, tarball: &Path) -> Result<()> {
        let mount_dir = tempfile::Builder::new().prefix("lava-mnt-").tempdir()?.keep();

        let mount = self
            .tool("mount")
            .arg("-o")
            .arg(format!("loop,offset={}", offset))
            .path_arg(image)
            .path_arg(&mount_dir);
        if let Err(e) = self.host.run_checked(&mount).await {
            remove_mount_dir(&mount_dir);
            return Err(e);
        }

        let tar = self
            .tool("tar")
            .arg("--numeric-owner")
            .arg("-C")
            .path_arg(&mount_dir)
            .arg("-czf")
            .path_arg(tarball)
            .arg(".");
        let archived = self.host.run_checked(&tar).await;

        let unmounted = self
            .host
            .run_checked(&self.tool("umount").path_arg(&mount_dir))
            .await;
        remove_mount_dir(&mount_dir);

        archived?;
        unmounted?;
        debug!("Archived partition at offset {} into {}", offset, tarball.display());
        Ok(())
    }

    /// Cut the boot and root partitions of a built image into tarballs
    pub async fn partition_tarballs(
        &self,
        image: &Path,
        workspace: &Path,
        boot_part: u32,
        root_part: u32,
    ) -> Result<PartitionTarballs> {
        let boot_offset = self.partition_offset(image, boot_part).await?;
        let root_offset = self.partition_offset(image, root_part).await?;

        let tarballs = PartitionTarballs {
            boot: workspace.join(BOOT_TARBALL),
            root: workspace.join(ROOT_TARBALL),
        };
        self.extract_partition(image, &boot_offset, &tarballs.boot).await?;
        self.extract_partition(image, &root_offset, &tarballs.root).await?;
        Ok(tarballs)
    }
}

/// Replace `path` with a private copy of itself
async fn detach(path: &Path) -> Result<()> {
    let copy = path.with_extension("detached");
    tokio::fs::copy(path, &copy).await?;
    tokio::fs::rename(&copy, path).await?;
    Ok(())
}

// Only ever removes an empty directory, so a mount left behind survives
fn remove_mount_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir(dir) {
        warn!("Could not remove mount point {}: {}", dir.display(), e);
    }
}

/// Offset of partition `index` from a `parted -m unit b print` dump
///
/// Partition lines look like `2:1048576B:...`; the offset comes back
/// without its `B` suffix.
pub fn parse_partition_offset(dump: &str, index: u32) -> Option<String> {
    let prefix = format!("{}:", index);
    dump.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix(&prefix)?;
        let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits_end == 0 || !rest[digits_end..].starts_with("B:") {
            return None;
        }
        Some(rest[..digits_end].to_string())
    })
}
