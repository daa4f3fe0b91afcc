//! Android boot image patching
//!
//! The Android boot partition carries a u-boot wrapped ramdisk whose
//! `init.rc` mounts partitions by their factory numbers. The lab lays the
//! card out differently, so the ramdisk is unpacked on the board, `init.rc`
//! is edited with sed, and the result is rewrapped with mkimage.
//!
//! Edits are kept as data ([`TextEdit`]) so the same script can be rendered
//! to sed commands for the board and applied locally in tests.

use crate::config::AndroidLayout;
use crate::shell::ShellCommand;

/// Size of the legacy u-boot image header in front of the ramdisk
///
/// This is specific to `mkimage -T ramdisk` images and is not read from the
/// header itself; other wrappers need a different skip.
pub const UBOOT_HEADER_LEN: usize = 64;

/// Scratch directory on the master image
pub const RAMDISK_WORKDIR: &str = "/tmp/lava-ramdisk";

/// Where the test boot partition is mounted during Android deploys
pub const ANDROID_BOOT_MOUNT: &str = "/mnt/lava/boot";

const UINITRD: &str = "uInitrd";
const INIT_RC: &str = "init.rc";

/// One line-oriented edit, equivalent to a single sed expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEdit {
    /// Drop every line containing the text
    DeleteLines { containing: String },
    /// Replace every occurrence of `from`
    ReplaceAll { from: String, to: String },
    /// Insert `line` after every line containing the text
    AppendAfter { containing: String, line: String },
    /// Replace every line containing the text with `line`
    ChangeLines { containing: String, line: String },
}

impl TextEdit {
    /// The sed expression performing this edit
    pub fn sed_expression(&self) -> String {
        match self {
            TextEdit::DeleteLines { containing } => format!("/{}/d", escape_pattern(containing)),
            TextEdit::ReplaceAll { from, to } => format!(
                "s/{}/{}/g",
                escape_pattern(from),
                escape_replacement(to)
            ),
            TextEdit::AppendAfter { containing, line } => {
                format!("/{}/a {}", escape_pattern(containing), escape_text(line))
            }
            TextEdit::ChangeLines { containing, line } => {
                format!("/{}/c {}", escape_pattern(containing), escape_text(line))
            }
        }
    }

    /// Apply the edit to `text` the way sed would
    pub fn apply(&self, text: &str) -> String {
        if let TextEdit::ReplaceAll { from, to } = self {
            return text.replace(from.as_str(), to);
        }

        let mut out = String::with_capacity(text.len());
        for raw in text.split_inclusive('\n') {
            let line = raw.strip_suffix('\n').unwrap_or(raw);
            match self {
                TextEdit::DeleteLines { containing } if line.contains(containing.as_str()) => {}
                TextEdit::AppendAfter { containing, line: added } if line.contains(containing.as_str()) => {
                    out.push_str(line);
                    out.push('\n');
                    out.push_str(added);
                    out.push('\n');
                }
                TextEdit::ChangeLines { containing, line: replacement }
                    if line.contains(containing.as_str()) =>
                {
                    out.push_str(replacement);
                    out.push('\n');
                }
                _ => out.push_str(raw),
            }
        }
        out
    }
}

/// Ordered edits applied to one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditScript {
    edits: Vec<TextEdit>,
}

impl EditScript {
    pub fn new(edits: Vec<TextEdit>) -> Self {
        Self { edits }
    }

    pub fn edits(&self) -> &[TextEdit] {
        &self.edits
    }

    pub fn apply(&self, text: &str) -> String {
        self.edits
            .iter()
            .fold(text.to_string(), |acc, edit| edit.apply(&acc))
    }

    /// One in-place sed invocation per edit
    pub fn commands(&self, file: &str) -> Vec<ShellCommand> {
        self.edits
            .iter()
            .map(|edit| {
                ShellCommand::new("sed")
                    .arg("-i")
                    .arg(edit.sed_expression())
                    .arg(file)
            })
            .collect()
    }
}

/// `init.rc` edits for the lab partition layout
///
/// Cache and data mounts by factory number are dropped, the system
/// partition is renumbered, and the shell gets a recognisable prompt.
pub fn init_rc_script(layout: &AndroidLayout) -> EditScript {
    EditScript::new(vec![
        TextEdit::DeleteLines {
            containing: format!("mount ext4 /dev/block/mmcblk0p{}", layout.cache_part_org),
        },
        TextEdit::DeleteLines {
            containing: format!("mount ext4 /dev/block/mmcblk0p{}", layout.data_part_org),
        },
        TextEdit::ReplaceAll {
            from: format!("mmcblk0p{}", layout.sys_part_org),
            to: format!("mmcblk0p{}", layout.sys_part),
        },
        TextEdit::AppendAfter {
            containing: "export PATH".to_string(),
            line: "    export PS1 root@linaro: ".to_string(),
        },
    ])
}

/// `vold.fstab` edit pointing the sdcard at the lab partition
pub fn vold_fstab_script(layout: &AndroidLayout) -> EditScript {
    EditScript::new(vec![TextEdit::ChangeLines {
        containing: "dev_mount sdcard /mnt/sdcard".to_string(),
        line: format!(
            "dev_mount sdcard /mnt/sdcard {} {}",
            layout.sdcard_part, layout.sdcard_sysfs_path
        ),
    }])
}

/// Unpack, patch and rewrap the boot partition's `uInitrd`
#[derive(Debug, Clone)]
pub struct RamdiskRepack {
    workdir: String,
    boot_dir: String,
    script: EditScript,
}

impl RamdiskRepack {
    pub fn new(layout: &AndroidLayout) -> Self {
        Self {
            workdir: RAMDISK_WORKDIR.to_string(),
            boot_dir: ANDROID_BOOT_MOUNT.to_string(),
            script: init_rc_script(layout),
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn script(&self) -> &EditScript {
        &self.script
    }

    /// Commands run in order on the master image; each must succeed
    pub fn steps(&self) -> Vec<ShellCommand> {
        let w = self.workdir.as_str();
        let in_work = |cmd: ShellCommand| cmd.in_dir(w);

        let mut steps = vec![
            ShellCommand::new("rm").args(["-rf", w]),
            ShellCommand::new("mkdir").args(["-p", w]),
            ShellCommand::new("mv").arg(format!("{}/{}", self.boot_dir, UINITRD)).arg(w),
            in_work(ShellCommand::new("dd").args([
                format!("if={}", UINITRD),
                format!("of={}.data", UINITRD),
                format!("ibs={}", UBOOT_HEADER_LEN),
                "skip=1".to_string(),
            ])),
            in_work(ShellCommand::new("mv").args([format!("{}.data", UINITRD), "ramdisk.cpio.gz".to_string()])),
            in_work(ShellCommand::new("gzip").args(["-d", "ramdisk.cpio.gz"])),
            in_work(ShellCommand::new("cpio").args(["-i", "-F", "ramdisk.cpio"])),
        ];
        steps.extend(self.script.commands(INIT_RC).into_iter().map(in_work));
        steps.push(in_work(
            ShellCommand::new("cpio")
                .args(["-i", "-t", "-F", "ramdisk.cpio"])
                .pipe(ShellCommand::new("cpio").args(["-o", "-H", "newc"]))
                .pipe(ShellCommand::new("gzip").write_to("ramdisk_new.cpio.gz")),
        ));
        steps.push(in_work(ShellCommand::new("mkimage").args([
            "-A",
            "arm",
            "-O",
            "linux",
            "-T",
            "ramdisk",
            "-n",
            "Android Ramdisk Image",
            "-d",
            "ramdisk_new.cpio.gz",
            UINITRD,
        ])));
        steps.push(
            ShellCommand::new("mv")
                .arg(format!("{}/{}", w, UINITRD))
                .arg(format!("{}/{}", self.boot_dir, UINITRD)),
        );
        steps
    }

    /// Removes the scratch directory; run whether or not the steps worked
    pub fn cleanup(&self) -> ShellCommand {
        ShellCommand::new("rm").args(["-rf", self.workdir.as_str()])
    }
}

/// Escape text for use inside a sed basic regular expression
fn escape_pattern(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '/' | '.' | '*' | '[' | ']' | '^' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_replacement(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '/' | '&') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Text for one-line `a`/`c` commands; sed strips unescaped leading blanks
fn escape_text(text: &str) -> String {
    let body = text.trim_start_matches(' ');
    let indent = text.len() - body.len();
    let mut out = "\\ ".repeat(indent);
    out.push_str(&body.replace('\\', "\\\\"));
    out
}
