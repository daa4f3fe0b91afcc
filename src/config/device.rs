//! Per-board device configuration

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hwpack packages stripped by default for a device type
const DEFAULT_STRIPPED_PACKAGES: &[(&str, &[&str])] = &[("snowball_sd", &["startupfiles-v3"])];

/// Static description of one board, supplied by lab configuration
///
/// Read-only once loaded; deployments never mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Board hostname, also used to name its console
    pub hostname: String,

    /// Device type tag (e.g. `panda`, `beagle`, `snowball_sd`)
    pub device_type: String,

    /// Host command that attaches to the board's serial console
    pub connection_command: String,

    /// Regex matching the master image's shell prompt
    pub master_prompt: String,

    /// Network interface on the master image
    #[serde(default = "default_interface")]
    pub network_interface: String,

    /// `--dev` profile passed to the image builder
    pub media_create_dev: String,

    /// 1-based index of the boot partition in the generated image
    #[serde(default = "default_boot_part")]
    pub boot_part: u32,

    /// 1-based index of the root partition in the generated image
    #[serde(default = "default_root_part")]
    pub root_part: u32,

    /// Line typed on the console to reboot the board
    #[serde(default = "default_soft_reboot")]
    pub soft_reboot_command: String,

    /// How to power-cycle the board
    #[serde(default)]
    pub hard_reset: HardReset,

    /// Hostname written into deployed test root filesystems
    #[serde(default = "default_tester_hostname")]
    pub tester_hostname: String,

    /// Hwpack packages removed before building; defaults per device type
    #[serde(default)]
    pub hwpack_strip_packages: Option<Vec<String>>,

    /// Android partition layout, required for Android deployments
    #[serde(default)]
    pub android: Option<AndroidLayout>,
}

/// Power-cycle method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardReset {
    /// Escape sequence understood by the console server
    ConsoleLine(String),
    /// Host command, e.g. a PDU client; argv form
    HostCommand(Vec<String>),
}

impl Default for HardReset {
    fn default() -> Self {
        HardReset::ConsoleLine("~$hardreset".to_string())
    }
}

/// Partition numbers for Android boards
///
/// The `*_org` fields describe the layout the stock boot image expects; the
/// rest describe where the lab's master image actually put things.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AndroidLayout {
    pub sys_part_org: u32,
    pub cache_part_org: u32,
    pub data_part_org: u32,
    pub sys_part: u32,
    pub sdcard_part: u32,
    #[serde(default = "default_sdcard_sysfs")]
    pub sdcard_sysfs_path: String,
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_boot_part() -> u32 {
    1
}

fn default_root_part() -> u32 {
    2
}

fn default_soft_reboot() -> String {
    "reboot".to_string()
}

fn default_tester_hostname() -> String {
    "linaro".to_string()
}

fn default_sdcard_sysfs() -> String {
    "/devices/platform/omap/omap_hsmmc.0/mmc_host/mmc0".to_string()
}

impl DeviceConfig {
    /// Validate every field a deployment will read
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("hostname", &self.hostname),
            ("device_type", &self.device_type),
            ("connection_command", &self.connection_command),
            ("master_prompt", &self.master_prompt),
            ("media_create_dev", &self.media_create_dev),
            ("network_interface", &self.network_interface),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(field, "cannot be empty"));
            }
        }

        Regex::new(&self.master_prompt)
            .map_err(|e| invalid("master_prompt", &format!("invalid regex: {}", e)))?;

        if self.boot_part == 0 || self.root_part == 0 {
            return Err(invalid("boot_part/root_part", "partition indices are 1-based"));
        }
        if self.boot_part == self.root_part {
            return Err(invalid("root_part", "must differ from boot_part"));
        }

        if let HardReset::HostCommand(argv) = &self.hard_reset {
            if argv.is_empty() {
                return Err(invalid("hard_reset.host_command", "argv cannot be empty"));
            }
        }

        if let Some(android) = &self.android {
            let parts = [
                ("android.sys_part_org", android.sys_part_org),
                ("android.cache_part_org", android.cache_part_org),
                ("android.data_part_org", android.data_part_org),
                ("android.sys_part", android.sys_part),
                ("android.sdcard_part", android.sdcard_part),
            ];
            for (field, value) in parts {
                if value == 0 {
                    return Err(invalid(field, "partition numbers are 1-based"));
                }
            }
        }

        Ok(())
    }

    /// Android layout, or a configuration error for non-Android boards
    pub fn android_layout(&self) -> Result<&AndroidLayout> {
        self.android
            .as_ref()
            .ok_or_else(|| invalid("android", "device has no Android partition layout"))
    }

    /// Hwpack packages to strip before building an image for this board
    pub fn hwpack_packages_to_strip(&self) -> Vec<String> {
        if let Some(packages) = &self.hwpack_strip_packages {
            return packages.clone();
        }
        DEFAULT_STRIPPED_PACKAGES
            .iter()
            .find(|(device_type, _)| *device_type == self.device_type)
            .map(|(_, packages)| packages.iter().map(|p| p.to_string()).collect())
            .unwrap_or_default()
    }
}

fn invalid(field: &str, reason: &str) -> Error {
    Error::ConfigValidationFailed {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
