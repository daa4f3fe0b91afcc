//! Unit tests for Android ramdisk and vold.fstab patching

use std::time::Duration;

use lava_deploy::config::AndroidLayout;
use lava_deploy::deploy::android::recreate_uinitrd;
use lava_deploy::deploy::ramdisk::{init_rc_script, vold_fstab_script, EditScript, RamdiskRepack, TextEdit};
use lava_deploy::shell::{CommandRunner, MasterPrompt};
use lava_deploy::testing::{Responder, ScriptedConsole};
use lava_deploy::Error;

const INIT_RC: &str = "\
on init
    export PATH /sbin:/vendor/bin:/system/sbin:/system/bin:/system/xbin
    export LD_LIBRARY_PATH /vendor/lib:/system/lib

on fs
    mount ext4 /dev/block/mmcblk0p2 /system wait ro
    mount ext4 /dev/block/mmcblk0p3 /cache nosuid nodev
    mount ext4 /dev/block/mmcblk0p5 /data nosuid nodev

service console /system/bin/sh
    console
";

fn layout() -> AndroidLayout {
    AndroidLayout {
        sys_part_org: 2,
        cache_part_org: 3,
        data_part_org: 5,
        sys_part: 5,
        sdcard_part: 6,
        sdcard_sysfs_path: "/devices/platform/omap/omap_hsmmc.0/mmc_host/mmc0".to_string(),
    }
}

#[test]
fn test_init_rc_mounts_rewritten() {
    let patched = init_rc_script(&layout()).apply(INIT_RC);

    assert!(patched.contains("    mount ext4 /dev/block/mmcblk0p5 /system wait ro\n"));
    assert!(!patched.contains("/cache"));
    assert!(!patched.contains("/data nosuid"));
    assert!(patched.contains("service console /system/bin/sh\n"));
}

#[test]
fn test_prompt_added_after_path() {
    let patched = init_rc_script(&layout()).apply(INIT_RC);
    let lines: Vec<&str> = patched.lines().collect();
    let path = lines.iter().position(|l| l.contains("export PATH")).unwrap();
    assert_eq!(lines[path + 1], "    export PS1 root@linaro: ");
}

#[test]
fn test_data_partition_deleted_before_renumbering() {
    // With the system partition moved onto the old data number, the data
    // mount must be gone before renumbering or it would be mistaken for it
    let patched = init_rc_script(&layout()).apply(INIT_RC);
    assert_eq!(patched.matches("mmcblk0p5").count(), 1);
}

#[test]
fn test_vold_fstab_sdcard_line() {
    let fstab = "## vold.fstab\ndev_mount sdcard /mnt/sdcard auto /devices/platform/mmci-omap-hs.0/mmc_host\n";
    let patched = vold_fstab_script(&layout()).apply(fstab);
    assert_eq!(
        patched,
        "## vold.fstab\ndev_mount sdcard /mnt/sdcard 6 /devices/platform/omap/omap_hsmmc.0/mmc_host/mmc0\n"
    );
}

#[test]
fn test_sed_commands_target_file() {
    let commands = vold_fstab_script(&layout()).commands("/mnt/lava/system/etc/vold.fstab");
    assert_eq!(commands.len(), 1);
    let line = commands[0].render().unwrap();
    assert!(line.starts_with("sed -i '/dev_mount sdcard \\/mnt\\/sdcard/c "));
    assert!(line.ends_with(" /mnt/lava/system/etc/vold.fstab"));
}

#[test]
fn test_edits_apply_in_order() {
    let script = EditScript::new(vec![
        TextEdit::ReplaceAll {
            from: "a".to_string(),
            to: "b".to_string(),
        },
        TextEdit::DeleteLines {
            containing: "b".to_string(),
        },
    ]);
    assert_eq!(script.apply("a\nc\n"), "c\n");
}

#[test]
fn test_custom_workdir() {
    let repack = RamdiskRepack::new(&layout()).with_workdir("/data/tmp/rd");
    let first = repack.steps()[0].render().unwrap();
    assert_eq!(first, "rm -rf /data/tmp/rd");
    assert_eq!(repack.cleanup().render().unwrap(), "rm -rf /data/tmp/rd");
}

#[tokio::test]
async fn test_repack_on_board() {
    let console = ScriptedConsole::ready("root@master:~# ");
    console.set_file("/mnt/lava/boot/uInitrd", "wrapped ramdisk");
    let mut handle = console.clone();
    let prompt = MasterPrompt::new("root@master:").unwrap();
    let mut runner = CommandRunner::new(&mut handle, prompt, Duration::from_secs(30));

    recreate_uinitrd(&mut runner, &layout()).await.unwrap();
    drop(runner);

    assert_eq!(
        console.file("/mnt/lava/boot/uInitrd").as_deref(),
        Some("wrapped ramdisk")
    );
    assert_eq!(console.file("/tmp/lava-ramdisk/uInitrd"), None);
    assert_eq!(console.sent().last().unwrap(), "rm -rf /tmp/lava-ramdisk");
}

#[tokio::test]
async fn test_failed_mkimage_still_cleans_up() {
    let console = ScriptedConsole::ready("root@master:~# ");
    console.set_file("/mnt/lava/boot/uInitrd", "wrapped ramdisk");
    console.respond("mkimage", Responder::Rc(1));
    let mut handle = console.clone();
    let prompt = MasterPrompt::new("root@master:").unwrap();
    let mut runner = CommandRunner::new(&mut handle, prompt, Duration::from_secs(30));

    let err = recreate_uinitrd(&mut runner, &layout()).await.unwrap_err();
    drop(runner);

    assert!(matches!(err, Error::CommandFailed { rc: 1, .. }));
    assert!(console.sent_matching("mv /tmp/lava-ramdisk/uInitrd").is_empty());
    assert_eq!(console.sent().last().unwrap(), "rm -rf /tmp/lava-ramdisk");
}
