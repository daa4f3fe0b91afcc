//! Integration tests for the Android deployment pipeline

#[path = "../test_utils/mod.rs"]
mod test_utils;

use lava_deploy::testing::Responder;
use lava_deploy::{AndroidImage, Error};
use test_utils::Harness;

const BUILD: &str = "http://snapshots.linaro.org/android/panda-ics/42";

fn image() -> AndroidImage {
    AndroidImage::new(
        format!("{}/boot.tar.bz2", BUILD),
        format!("{}/system.tar.bz2", BUILD),
        format!("{}/userdata.tar.bz2", BUILD),
    )
}

/// Harness whose boot tarball carries a ramdisk
fn harness() -> Harness {
    let h = Harness::new();
    h.console.set_file("/mnt/lava/boot/uInitrd", "ramdisk");
    h
}

#[tokio::test]
async fn test_deploy_formats_android_partitions_in_order() {
    let mut h = harness();
    h.client.deploy_linaro_android(&image(), true).await.unwrap();

    assert_eq!(h.console.formatted(), vec!["testboot", "testrootfs", "sdcard"]);
    assert!(h.console.mounts().is_empty());
    assert_eq!(h.leftover_workspaces(), 0);

    let extracts = h.console.sent_matching("wget -qO-");
    assert_eq!(extracts.len(), 2);
    assert!(extracts[0].contains("/boot.tar.bz2 | tar --numeric-owner -C /mnt/lava -xjf -"));
    assert!(extracts[1].contains("/system.tar.bz2 | tar --numeric-owner -C /mnt/lava -xjf -"));
}

#[tokio::test]
async fn test_network_checked_before_any_partition_is_touched() {
    let mut h = harness();
    h.client.deploy_linaro_android(&image(), true).await.unwrap();

    let ping = h.position_of("ping").unwrap();
    let first_mkfs = h.position_of("mkfs.").unwrap();
    assert!(ping < first_mkfs);
}

#[tokio::test]
async fn test_ramdisk_rewrapped_for_lab_layout() {
    let mut h = harness();
    h.client.deploy_linaro_android(&image(), true).await.unwrap();

    let dd = h.console.sent_matching("dd if=uInitrd");
    assert_eq!(dd.len(), 1);
    assert!(dd[0].contains("ibs=64 skip=1"));

    let renumber = h.console.sent_matching("s/mmcblk0p2/mmcblk0p5/g");
    assert_eq!(renumber.len(), 1);
    assert!(renumber[0].ends_with("init.rc"));

    // The rewrapped image lands back on the boot partition
    assert_eq!(h.console.file("/mnt/lava/boot/uInitrd").as_deref(), Some("ramdisk"));
    assert_eq!(h.console.sent_matching("rm -rf /tmp/lava-ramdisk").len(), 2);
}

#[tokio::test]
async fn test_vold_fstab_points_at_lab_sdcard() {
    let mut h = harness();
    h.client.deploy_linaro_android(&image(), true).await.unwrap();

    let sed = h.console.sent_matching("vold.fstab");
    assert_eq!(sed.len(), 1);
    assert!(sed[0].contains("/mnt/sdcard 6 /devices/platform/omap/omap_hsmmc.0/mmc_host/mmc0"));
    assert!(sed[0].ends_with("/mnt/lava/system/etc/vold.fstab"));
}

#[tokio::test]
async fn test_missing_vold_fstab_does_not_fail_deploy() {
    let mut h = harness();
    h.console.respond("vold.fstab", Responder::Rc(2));
    h.client.deploy_linaro_android(&image(), true).await.unwrap();

    assert_eq!(h.console.formatted(), vec!["testboot", "testrootfs", "sdcard"]);
    assert!(h.console.mounts().is_empty());
    assert_eq!(h.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_optional_partitions_and_pkg() {
    let mut h = harness();
    let image = AndroidImage {
        pkg: Some(format!("{}/extras.tar.bz2", BUILD)),
        install_data: true,
        install_system: true,
        ..image()
    };
    h.client.deploy_linaro_android(&image, true).await.unwrap();

    assert_eq!(
        h.console.formatted(),
        vec!["testboot", "testrootfs", "sdcard", "data", "system"]
    );
    assert_eq!(h.console.sent_matching("extras.tar.bz2").len(), 1);
    assert_eq!(h.console.sent_matching("userdata.tar.bz2").len(), 1);
    assert!(h.console.mounts().is_empty());
}

#[tokio::test]
async fn test_missing_ramdisk_fails_and_cleans_up() {
    let mut h = Harness::new();

    let err = h.client.deploy_linaro_android(&image(), true).await.unwrap_err();

    assert!(matches!(err, Error::Fatal { ref context, .. } if context == "Android deployment failed"));
    assert!(err.trace().contains("mv /mnt/lava/boot/uInitrd /tmp/lava-ramdisk"));
    assert_eq!(h.console.formatted(), vec!["testboot"]);
    assert!(h.console.mounts().is_empty());
    assert!(h.console.sent().last().unwrap().starts_with("umount /mnt/lava/boot"));
    assert_eq!(h.console.sent_matching("rm -rf /tmp/lava-ramdisk").len(), 2);
    assert_eq!(h.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_download_failure_touches_nothing() {
    let mut h = harness();
    h.downloads.fail(&format!("{}/system.tar.bz2", BUILD));

    let err = h.client.deploy_linaro_android(&image(), true).await.unwrap_err();

    assert_eq!(err.to_string(), "Unable to download artifacts for deployment");
    assert!(err.trace().contains("404"));
    assert!(h.console.formatted().is_empty());
    assert_eq!(h.leftover_workspaces(), 0);
    assert!(h
        .client
        .job_record()
        .diagnostics
        .starts_with("Unable to download artifacts for deployment"));
}

#[tokio::test]
async fn test_console_dropping_mid_extract_is_fatal() {
    let mut h = harness();
    h.console.respond("system.tar.bz2", Responder::Close);

    let err = h.client.deploy_linaro_android(&image(), true).await.unwrap_err();

    assert!(err.is_fatal());
    assert!(err.trace().contains("console closed"));
    assert_eq!(h.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_board_without_android_layout_rejected() {
    let mut h = Harness::with(|_, device| device.android = None);

    let err = h.client.deploy_linaro_android(&image(), true).await.unwrap_err();

    assert!(matches!(err, Error::ConfigValidationFailed { ref field, .. } if field == "android"));
    assert!(h.console.sent().is_empty());
}
