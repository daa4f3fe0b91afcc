//! Scoped device sessions
//!
//! A master session is a command runner on the master image shell. A
//! partition session additionally mounts one test partition, makes it
//! usable as a chroot (working DNS, a populated `/dev`) and prefixes every
//! command with `chroot`.
//!
//! Sessions borrow the [`SessionManager`] mutably, so only one can issue
//! commands at a time. Partition sessions must be ended with
//! [`PartitionSession::release`]; [`settle`] combines the work's outcome
//! with the release outcome, keeping the original error.

use std::sync::Arc;
use std::time::Duration;

use crate::boot::{BootSequencer, BootState};
use crate::config::{DeviceConfig, TimeoutConfig};
use crate::console::{Connection, ExpectOutcome};
use crate::error::{Error, Result};
use crate::host::HostOps;
use crate::shell::{CommandRunner, MasterPrompt, ShellCommand};

/// Filesystem label of the deployed test root filesystem
pub const TEST_ROOTFS_LABEL: &str = "testrootfs";

/// Owns the console of one device and hands out sessions on it
pub struct SessionManager {
    conn: Box<dyn Connection>,
    device: DeviceConfig,
    timeouts: TimeoutConfig,
    host: Arc<dyn HostOps>,
    prompt: MasterPrompt,
    use_sudo: bool,
}

impl SessionManager {
    pub fn new(
        conn: Box<dyn Connection>,
        device: DeviceConfig,
        timeouts: TimeoutConfig,
        host: Arc<dyn HostOps>,
    ) -> Result<Self> {
        let prompt = MasterPrompt::new(&device.master_prompt)?;
        Ok(Self {
            conn,
            device,
            timeouts,
            host,
            prompt,
            use_sudo: false,
        })
    }

    /// Run host-side hard reset commands through sudo
    pub fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Reboot into the master image unconditionally
    pub async fn boot_master_image(&mut self) -> Result<Vec<BootState>> {
        let sequencer = BootSequencer::new(&self.device, &self.timeouts, &self.prompt, &*self.host)
            .with_sudo(self.use_sudo);
        sequencer.boot(&mut *self.conn).await
    }

    /// Check for a master shell by sending a blank line
    ///
    /// This is a heuristic: a stale prompt still sitting in the console
    /// output satisfies it even if the board has since gone away.
    pub async fn probe_master_shell(&mut self, timeout: Duration) -> Result<()> {
        self.conn.send_line("").await?;
        let outcome = self
            .conn
            .expect(std::slice::from_ref(self.prompt.plain()), timeout)
            .await?;
        match outcome {
            ExpectOutcome::Matched(_) => {
                info!("{} is in the master image", self.device.hostname);
                Ok(())
            }
            ExpectOutcome::Timeout | ExpectOutcome::Eof => Err(Error::ShellNotReady { timeout }),
        }
    }

    /// A runner on the master image shell, booting it if needed
    pub async fn master_session(&mut self) -> Result<CommandRunner<'_>> {
        let probe_timeout = self.timeouts.shell_probe();
        match self.probe_master_shell(probe_timeout).await {
            Ok(()) => {}
            Err(e) if matches!(e, Error::ShellNotReady { .. }) || e.is_connection_error() => {
                info!("No master shell on {} ({}), booting it", self.device.hostname, e);
                self.boot_master_image().await?;
            }
            Err(e) => return Err(e),
        }

        Ok(CommandRunner::new(
            &mut *self.conn,
            self.prompt.clone(),
            self.timeouts.command(),
        ))
    }

    /// A chroot session inside the partition labelled `label`
    pub async fn partition_session(&mut self, label: &str) -> Result<PartitionSession<'_>> {
        let master = self.master_session().await?;
        let mut session = PartitionSession::new(master, label);
        if let Err(e) = session.setup().await {
            let released = session.release().await;
            return settle(Err(e), released);
        }
        Ok(session)
    }

    /// Session inside the deployed test root filesystem
    pub async fn reliable_session(&mut self) -> Result<PartitionSession<'_>> {
        self.partition_session(TEST_ROOTFS_LABEL).await
    }
}

/// What happened to the partition's resolv.conf during setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvBackup {
    Untouched,
    Saved,
    /// There was no resolv.conf to save; ours is removed on release
    Absent,
}

/// A mounted test partition usable as a chroot
pub struct PartitionSession<'s> {
    master: CommandRunner<'s>,
    label: String,
    root: String,
    mounted: bool,
    resolv: ResolvBackup,
    dev_bound: bool,
    released: bool,
}

impl<'s> PartitionSession<'s> {
    fn new(master: CommandRunner<'s>, label: &str) -> Self {
        Self {
            master,
            label: label.to_string(),
            root: format!("/mnt/{}", label),
            mounted: false,
            resolv: ResolvBackup::Untouched,
            dev_bound: false,
            released: false,
        }
    }

    async fn setup(&mut self) -> Result<()> {
        info!("Opening session in partition {}", self.label);
        let resolv = format!("{}/etc/resolv.conf", self.root);
        let backup = format!("{}.bak", resolv);

        self.master
            .run(&ShellCommand::new("mkdir").args(["-p", self.root.as_str()]))
            .await?;

        let device = format!("/dev/disk/by-label/{}", self.label);
        let mount = ShellCommand::new("mount").arg(device).arg(self.root.clone());
        let timeout = self.master.default_timeout();
        self.master.run_checked(&mount, timeout).await?;
        self.mounted = true;

        let rc = self
            .master
            .run(&ShellCommand::new("cp").args(["-f", resolv.as_str(), backup.as_str()]))
            .await?;
        self.resolv = if rc == 0 {
            ResolvBackup::Saved
        } else {
            debug!("{} has no resolv.conf to back up", self.root);
            ResolvBackup::Absent
        };

        let etc = format!("{}/etc", self.root);
        self.master
            .run(&ShellCommand::new("cp").args(["-L", "/etc/resolv.conf", etc.as_str()]))
            .await?;

        // Without /dev/pts nothing in the chroot can open a terminal
        self.dev_bound = true;
        let dev = format!("{}/dev", self.root);
        self.master
            .run_checked(
                &ShellCommand::new("mount").args(["--rbind", "/dev", dev.as_str()]),
                timeout,
            )
            .await?;
        Ok(())
    }

    /// Runner whose commands execute inside the partition
    pub fn runner(&mut self) -> CommandRunner<'_> {
        self.master.chrooted(&self.root)
    }

    /// Runner on the master image itself, outside the chroot
    pub fn master(&mut self) -> &mut CommandRunner<'s> {
        &mut self.master
    }

    /// Mount point of the partition on the master image
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Undo setup: restore resolv.conf, unmount `/dev` binds deepest
    /// first, then unmount the partition
    ///
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        info!("Closing session in partition {}", self.label);

        let resolv = format!("{}/etc/resolv.conf", self.root);
        let backup = format!("{}.bak", resolv);
        let mut first_error: Option<Error> = None;
        let mut record = |result: Result<()>| {
            if let Err(e) = result {
                warn!("Partition session cleanup step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        match self.resolv {
            ResolvBackup::Saved => {
                let restore = ShellCommand::new("mv").args(["-f", backup.as_str(), resolv.as_str()]);
                record(self.master.run(&restore).await.map(|_| ()));
            }
            ResolvBackup::Absent => {
                let remove = ShellCommand::new("rm").args(["-f", resolv.as_str()]);
                record(self.master.run(&remove).await.map(|_| ()));
            }
            ResolvBackup::Untouched => {}
        }

        if self.dev_bound {
            record(self.master.run(&dev_unmount_command(&self.root)).await.map(|_| ()));
        }

        if self.mounted {
            let umount = ShellCommand::new("umount").arg(self.root.clone());
            let timeout = self.master.default_timeout();
            record(self.master.run_checked(&umount, timeout).await);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for PartitionSession<'_> {
    fn drop(&mut self) {
        if !self.released && self.mounted {
            warn!(
                "Partition session on {} dropped without release; {} is still mounted",
                self.label, self.root
            );
        }
    }
}

/// Unmount everything under `<root>/dev`, deepest mount first
pub fn dev_unmount_command(root: &str) -> ShellCommand {
    ShellCommand::new("cat")
        .arg("/proc/mounts")
        .pipe(ShellCommand::new("awk").arg("{print $2}"))
        .pipe(ShellCommand::new("grep").arg(format!("^{}/dev", root)))
        .pipe(ShellCommand::new("sort").arg("-r"))
        .pipe(ShellCommand::new("xargs").arg("umount"))
}

/// Combine the outcome of scoped work with the outcome of its cleanup
///
/// A work error always wins; a cleanup error after successful work is
/// returned instead of the value.
pub fn settle<T>(outcome: Result<T>, released: Result<()>) -> Result<T> {
    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => {
            warn!("Cleanup after failure also failed: {}", cleanup);
            Err(e)
        }
    }
}
