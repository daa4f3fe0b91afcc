//! Configuration management for lava-deploy
//!
//! Two documents drive a deployment: the dispatcher configuration (where
//! images are staged, how they are published, which host tools to run) and
//! one device configuration per board. Both are parsed from TOML and
//! validated once at load time, so deploy code reads plain typed fields.

pub mod device;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use device::{AndroidLayout, DeviceConfig, HardReset};
pub use loader::ConfigLoader;

use crate::error::{Error, Result};

/// Dispatcher-wide configuration shared by every device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Address the devices ping to prove their network is up
    pub lava_server_ip: String,

    /// Root under which per-deployment workspaces are created
    pub lava_image_tmpdir: PathBuf,

    /// Public URL serving `lava_image_tmpdir`
    pub lava_image_url: String,

    /// Download cache shared across deployments
    pub lava_cachedir: PathBuf,

    /// Host-side image tools
    pub tools: ToolConfig,

    /// Console and deployment timeouts
    pub timeouts: TimeoutConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lava_server_ip: "192.168.1.10".to_string(),
            lava_image_tmpdir: PathBuf::from("/srv/lava/images/tmp"),
            lava_image_url: "http://192.168.1.10/images/tmp".to_string(),
            lava_cachedir: PathBuf::from("/linaro/images/cache"),
            tools: ToolConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lava_server_ip.trim().is_empty() {
            return Err(Error::ConfigValidationFailed {
                field: "lava_server_ip".to_string(),
                reason: "Server IP cannot be empty".to_string(),
            });
        }

        if !self.lava_image_tmpdir.is_absolute() {
            return Err(Error::ConfigValidationFailed {
                field: "lava_image_tmpdir".to_string(),
                reason: "Image temp root must be an absolute path".to_string(),
            });
        }

        if !(self.lava_image_url.starts_with("http://")
            || self.lava_image_url.starts_with("https://"))
        {
            return Err(Error::ConfigValidationFailed {
                field: "lava_image_url".to_string(),
                reason: "Image URL must be http(s)".to_string(),
            });
        }

        if self.tools.image_size.trim().is_empty() {
            return Err(Error::ConfigValidationFailed {
                field: "tools.image_size".to_string(),
                reason: "Image size cannot be empty".to_string(),
            });
        }

        self.timeouts.validate()
    }
}

/// External tools run on the dispatcher host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Prefix privileged tools with `sudo`
    pub use_sudo: bool,

    /// Disk-image builder
    pub media_create: String,

    /// Hwpack package replacement tool
    pub hwpack_replace: String,

    /// Partition table dumper
    pub parted: String,

    /// Lock file serializing image builds across processes
    pub build_lock: PathBuf,

    /// Size of the generated raw image
    pub image_size: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            use_sudo: true,
            media_create: "linaro-media-create".to_string(),
            hwpack_replace: "linaro-hwpack-replace".to_string(),
            parted: "parted".to_string(),
            build_lock: PathBuf::from("/var/lock/lava-lmc.lck"),
            image_size: "3G".to_string(),
        }
    }
}

/// Timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Blank-line probe for an existing shell
    pub shell_probe_secs: u64,
    /// Kernel banner after a soft reboot
    pub kernel_banner_secs: u64,
    /// Shell prompt after the kernel banner
    pub soft_boot_shell_secs: u64,
    /// Shell prompt after a hard reset
    pub hard_boot_shell_secs: u64,
    /// Prompt re-confirmation after reconfiguring PS1
    pub prompt_confirm_secs: u64,
    /// Default per-command timeout
    pub command_secs: u64,
    /// Total time allowed for the device network to come up
    pub network_up_secs: u64,
    /// Single ping probe
    pub ping_secs: u64,
    /// Streaming a root filesystem tarball onto the device
    pub rootfs_extract_secs: u64,
    /// Streaming an Android system/data tarball onto the device
    pub android_extract_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            shell_probe_secs: 10,
            kernel_banner_secs: 30,
            soft_boot_shell_secs: 120,
            hard_boot_shell_secs: 300,
            prompt_confirm_secs: 10,
            command_secs: 30,
            network_up_secs: 300,
            ping_secs: 5,
            rootfs_extract_secs: 3600,
            android_extract_secs: 600,
        }
    }
}

impl TimeoutConfig {
    pub fn shell_probe(&self) -> Duration {
        Duration::from_secs(self.shell_probe_secs)
    }

    pub fn kernel_banner(&self) -> Duration {
        Duration::from_secs(self.kernel_banner_secs)
    }

    pub fn soft_boot_shell(&self) -> Duration {
        Duration::from_secs(self.soft_boot_shell_secs)
    }

    pub fn hard_boot_shell(&self) -> Duration {
        Duration::from_secs(self.hard_boot_shell_secs)
    }

    pub fn prompt_confirm(&self) -> Duration {
        Duration::from_secs(self.prompt_confirm_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn network_up(&self) -> Duration {
        Duration::from_secs(self.network_up_secs)
    }

    pub fn ping(&self) -> Duration {
        Duration::from_secs(self.ping_secs)
    }

    pub fn rootfs_extract(&self) -> Duration {
        Duration::from_secs(self.rootfs_extract_secs)
    }

    pub fn android_extract(&self) -> Duration {
        Duration::from_secs(self.android_extract_secs)
    }

    fn validate(&self) -> Result<()> {
        // The hard-reset path must be the longer one, otherwise escalation
        // cannot recover a board that is merely slow to boot.
        if self.hard_boot_shell_secs < self.soft_boot_shell_secs {
            return Err(Error::ConfigValidationFailed {
                field: "timeouts.hard_boot_shell_secs".to_string(),
                reason: "Hard-reset timeout cannot be shorter than the soft-reboot timeout"
                    .to_string(),
            });
        }

        let all = [
            ("shell_probe_secs", self.shell_probe_secs),
            ("kernel_banner_secs", self.kernel_banner_secs),
            ("prompt_confirm_secs", self.prompt_confirm_secs),
            ("command_secs", self.command_secs),
            ("ping_secs", self.ping_secs),
        ];
        for (field, value) in all {
            if value == 0 {
                return Err(Error::ConfigValidationFailed {
                    field: format!("timeouts.{}", field),
                    reason: "Timeout must be greater than 0".to_string(),
                });
            }
        }

        Ok(())
    }
}
