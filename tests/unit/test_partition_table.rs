//! Unit tests for partition table parsing and partition extraction

use std::path::Path;

use lava_deploy::config::DispatcherConfig;
use lava_deploy::host::HostOutput;
use lava_deploy::image::{parse_partition_offset, BuildLock, ImageBuilder, BOOT_TARBALL, ROOT_TARBALL};
use lava_deploy::testing::{RecordingHost, PARTED_DUMP};
use lava_deploy::Error;
use tempfile::TempDir;

/// A vexpress-style image with the root filesystem on the third partition
const THREE_PARTITIONS: &str = "BYT;\n\
    /srv/lava/images/tmp/lava-x/lava.img:4294967296B:file:512:512:msdos::;\n\
    1:32256B:67107839B:67075584B:fat16::boot;\n\
    2:67107840B:134215679B:67107840B:linux-swap(v1)::;\n\
    3:134215680B:4294967295B:4160751616B:ext4::;\n";

fn config(dir: &Path) -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.tools.use_sudo = false;
    config.tools.build_lock = dir.join("lmc.lck");
    config
}

#[test]
fn test_offsets_from_default_dump() {
    assert_eq!(parse_partition_offset(PARTED_DUMP, 1).as_deref(), Some("4194304"));
    assert_eq!(parse_partition_offset(PARTED_DUMP, 2).as_deref(), Some("58720256"));
}

#[test]
fn test_header_lines_never_match() {
    // The disk line starts with the image path, not an index
    assert_eq!(parse_partition_offset("BYT;\n", 1), None);
    assert_eq!(parse_partition_offset("/tmp/1:512B:file;\n", 1), None);
    assert_eq!(parse_partition_offset("", 1), None);
}

#[test]
fn test_third_partition() {
    assert_eq!(parse_partition_offset(THREE_PARTITIONS, 3).as_deref(), Some("134215680"));
    assert_eq!(parse_partition_offset(THREE_PARTITIONS, 4), None);
}

#[test]
fn test_two_digit_indices_are_distinct() {
    let dump = "1:512B:1023B:512B:fat32::;\n11:4096B:8191B:4096B:ext4::;\n";
    assert_eq!(parse_partition_offset(dump, 1).as_deref(), Some("512"));
    assert_eq!(parse_partition_offset(dump, 11).as_deref(), Some("4096"));
}

#[tokio::test]
async fn test_tarballs_cut_at_configured_partitions() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let host = RecordingHost::new();
    host.respond("parted", HostOutput::ok(THREE_PARTITIONS));
    let lock = BuildLock::new(&config.tools.build_lock);
    let builder = ImageBuilder::new(&host, &config.tools, &lock);

    let tarballs = builder
        .partition_tarballs(&dir.path().join("lava.img"), dir.path(), 1, 3)
        .await
        .unwrap();

    assert_eq!(tarballs.boot, dir.path().join(BOOT_TARBALL));
    assert_eq!(tarballs.root, dir.path().join(ROOT_TARBALL));

    let mounts: Vec<_> = host
        .commands()
        .into_iter()
        .filter(|c| c.program == "mount")
        .collect();
    assert_eq!(mounts.len(), 2);
    assert_eq!(mounts[0].args[1], "loop,offset=32256");
    assert_eq!(mounts[1].args[1], "loop,offset=134215680");
}

#[tokio::test]
async fn test_missing_root_partition_extracts_nothing() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let host = RecordingHost::new();
    let lock = BuildLock::new(&config.tools.build_lock);
    let builder = ImageBuilder::new(&host, &config.tools, &lock);

    let err = builder
        .partition_tarballs(&dir.path().join("lava.img"), dir.path(), 1, 5)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PartitionNotFound { index: 5, .. }));
    assert!(!host.ran("mount"));
}

#[tokio::test]
async fn test_parted_failure_reported_as_tool_error() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let host = RecordingHost::new();
    host.respond("parted", HostOutput::failed(1, "Error: Could not stat device"));
    let lock = BuildLock::new(&config.tools.build_lock);
    let builder = ImageBuilder::new(&host, &config.tools, &lock);

    let err = builder
        .partition_offset(&dir.path().join("lava.img"), 1)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ToolFailed { ref tool, status: 1, .. } if tool == "parted"));
}
