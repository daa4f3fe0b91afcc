//! Integration tests for artifact caching across deployments

#[path = "../test_utils/mod.rs"]
mod test_utils;

use lava_deploy::host::HostOutput;
use lava_deploy::LinuxImage;
use test_utils::Harness;

const HWPACK: &str = "http://snapshots.linaro.org/hwpacks/hwpack_linaro-panda_20120101.tar.gz";
const ROOTFS: &str = "http://snapshots.linaro.org/images/nano-20120101.tgz";

fn image() -> LinuxImage {
    LinuxImage {
        hwpack: HWPACK.to_string(),
        rootfs: ROOTFS.to_string(),
        kernel: None,
    }
}

#[tokio::test]
async fn test_second_deploy_uses_cache() {
    let mut h = Harness::new();
    h.client.deploy_linaro(&image(), true).await.unwrap();
    h.client.deploy_linaro(&image(), true).await.unwrap();

    assert_eq!(h.downloads.count(HWPACK), 1);
    assert_eq!(h.downloads.count(ROOTFS), 1);

    let cached = h
        .root
        .path()
        .join("cache/snapshots.linaro.org/hwpacks/hwpack_linaro-panda_20120101.tar.gz");
    assert_eq!(std::fs::read_to_string(cached).unwrap(), format!("contents of {}", HWPACK));
    assert_eq!(h.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_no_cache_always_downloads() {
    let mut h = Harness::new();
    h.client.deploy_linaro(&image(), false).await.unwrap();
    h.client.deploy_linaro(&image(), false).await.unwrap();

    assert_eq!(h.downloads.count(HWPACK), 2);
    assert!(!h.root.path().join("cache").exists());
}

#[tokio::test]
async fn test_failed_deploy_still_populates_cache() {
    let mut h = Harness::new();
    h.host.respond("linaro-media-create", HostOutput::failed(1, "out of loop devices"));
    assert!(h.client.deploy_linaro(&image(), true).await.is_err());

    h.host.respond("linaro-media-create", HostOutput::ok("linaro-media-create 2012.01\n"));
    h.client.deploy_linaro(&image(), true).await.unwrap();

    assert_eq!(h.downloads.total(), 2);
}

#[tokio::test]
async fn test_stripping_leaves_cached_hwpack_intact() {
    let mut h = Harness::with(|_, device| device.device_type = "snowball_sd".to_string());
    h.client.deploy_linaro(&image(), true).await.unwrap();

    let cached = h
        .root
        .path()
        .join("cache/snapshots.linaro.org/hwpacks/hwpack_linaro-panda_20120101.tar.gz");
    assert_eq!(std::fs::read_to_string(&cached).unwrap(), format!("contents of {}", HWPACK));

    use std::os::unix::fs::MetadataExt;
    assert_eq!(std::fs::metadata(&cached).unwrap().nlink(), 1);
}
