//! Boot recovery
//!
//! Drives a board from an unknown state into the master image shell. The
//! recovery policy lives in [`transition`], a pure function over
//! [`BootState`] and [`BootEvent`]; [`BootSequencer`] only performs the
//! action each state calls for and reports what it observed.
//!
//! ```text
//! Unknown -> SoftRebooting -> AwaitingKernelBanner -> AwaitingShellPrompt
//!                                  |                        |
//!                                  +------ failure ---------+
//!                                             v
//!                         HardRebooting -> AwaitingShellPrompt (long)
//!                                             |
//!                 ConfiguringPrompt <---------+----> Fatal
//!                        |
//!                 MasterShellReady
//! ```

use std::fmt;

use crate::config::{DeviceConfig, HardReset, TimeoutConfig};
use crate::console::{Connection, ExpectOutcome};
use crate::error::{Error, Result};
use crate::host::{HostCommand, HostOps};
use crate::shell::MasterPrompt;

/// Banner the kernel prints once the bootloader hands over
pub const KERNEL_BANNER: &str = "Starting kernel";

/// Where the board is on its way to the master shell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Unknown,
    SoftRebooting,
    AwaitingKernelBanner,
    /// `escalated` is set once a hard reset has been spent
    AwaitingShellPrompt { escalated: bool },
    HardRebooting,
    ConfiguringPrompt,
    MasterShellReady,
    Fatal,
}

/// What performing a state's action produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootEvent {
    /// Start from scratch
    Begin,
    /// The reset request went out
    ResetIssued,
    /// The awaited output showed up
    Observed,
    /// Timeout, end of stream, or the reset could not be issued
    Failed,
}

impl BootState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BootState::MasterShellReady | BootState::Fatal)
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootState::Unknown => write!(f, "unknown"),
            BootState::SoftRebooting => write!(f, "soft rebooting"),
            BootState::AwaitingKernelBanner => write!(f, "awaiting kernel banner"),
            BootState::AwaitingShellPrompt { escalated: false } => write!(f, "awaiting shell prompt"),
            BootState::AwaitingShellPrompt { escalated: true } => {
                write!(f, "awaiting shell prompt after hard reset")
            }
            BootState::HardRebooting => write!(f, "hard rebooting"),
            BootState::ConfiguringPrompt => write!(f, "configuring prompt"),
            BootState::MasterShellReady => write!(f, "master shell ready"),
            BootState::Fatal => write!(f, "fatal"),
        }
    }
}

/// Recovery policy: the next state after `event` happened in `state`
///
/// Any failure before the first prompt escalates to a hard reset exactly
/// once. A failure after the hard reset, or while confirming the
/// reconfigured prompt, is fatal.
pub fn transition(state: BootState, event: BootEvent) -> BootState {
    use BootEvent::*;
    use BootState::*;

    match (state, event) {
        (Unknown, Begin) => SoftRebooting,

        (SoftRebooting, ResetIssued) => AwaitingKernelBanner,
        (SoftRebooting, Failed) => HardRebooting,

        (AwaitingKernelBanner, Observed) => AwaitingShellPrompt { escalated: false },
        (AwaitingKernelBanner, Failed) => HardRebooting,

        (AwaitingShellPrompt { .. }, Observed) => ConfiguringPrompt,
        (AwaitingShellPrompt { escalated: false }, Failed) => HardRebooting,
        (AwaitingShellPrompt { escalated: true }, Failed) => Fatal,

        (HardRebooting, ResetIssued) => AwaitingShellPrompt { escalated: true },
        (HardRebooting, Failed) => Fatal,

        (ConfiguringPrompt, Observed) => MasterShellReady,
        (ConfiguringPrompt, Failed) => Fatal,

        (MasterShellReady, _) => MasterShellReady,
        _ => Fatal,
    }
}

/// Reboots a board into its master image
pub struct BootSequencer<'a> {
    device: &'a DeviceConfig,
    timeouts: &'a TimeoutConfig,
    prompt: &'a MasterPrompt,
    host: &'a dyn HostOps,
    use_sudo: bool,
}

impl<'a> BootSequencer<'a> {
    pub fn new(
        device: &'a DeviceConfig,
        timeouts: &'a TimeoutConfig,
        prompt: &'a MasterPrompt,
        host: &'a dyn HostOps,
    ) -> Self {
        Self {
            device,
            timeouts,
            prompt,
            host,
            use_sudo: false,
        }
    }

    /// Run host-side reset commands through sudo
    pub fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    /// Boot into the master shell, returning the states visited
    pub async fn boot(&self, conn: &mut dyn Connection) -> Result<Vec<BootState>> {
        info!("Booting {} into the master image", self.device.hostname);
        let mut state = BootState::Unknown;
        let mut visited = vec![state];
        let mut last_failure = String::new();

        loop {
            let event = match self.step(state, conn).await? {
                Ok(event) => event,
                Err(reason) => {
                    warn!("{} while {}: {}", self.device.hostname, state, reason);
                    last_failure = reason;
                    BootEvent::Failed
                }
            };

            let next = transition(state, event);
            debug!("boot: {} --{:?}--> {}", state, event, next);
            match next {
                BootState::MasterShellReady => {
                    visited.push(next);
                    info!("{} is in the master image", self.device.hostname);
                    return Ok(visited);
                }
                BootState::Fatal => {
                    return Err(Error::BootFailed {
                        state: state.to_string(),
                        reason: last_failure,
                    });
                }
                _ => {
                    state = next;
                    visited.push(state);
                }
            }
        }
    }

    /// Perform the action for `state`
    ///
    /// The outer error is for failures no state can absorb; the inner
    /// error carries the reason an expected observation did not happen.
    async fn step(
        &self,
        state: BootState,
        conn: &mut dyn Connection,
    ) -> Result<std::result::Result<BootEvent, String>> {
        let event = match state {
            BootState::Unknown => Ok(BootEvent::Begin),
            BootState::SoftRebooting => {
                info!("Soft rebooting {}", self.device.hostname);
                absorb(conn.send_line(&self.device.soft_reboot_command).await)?
                    .map(|_| BootEvent::ResetIssued)
            }
            BootState::AwaitingKernelBanner => {
                let banner = regex::Regex::new(KERNEL_BANNER)?;
                self.wait_for(conn, &banner, self.timeouts.kernel_banner(), false)
                    .await?
            }
            BootState::AwaitingShellPrompt { escalated } => {
                let timeout = if escalated {
                    self.timeouts.hard_boot_shell()
                } else {
                    self.timeouts.soft_boot_shell()
                };
                let prompt = self.prompt.plain().clone();
                self.wait_for(conn, &prompt, timeout, true).await?
            }
            BootState::HardRebooting => {
                warn!("Hard resetting {}", self.device.hostname);
                self.hard_reset(conn).await?.map(|_| BootEvent::ResetIssued)
            }
            BootState::ConfiguringPrompt => {
                let line = MasterPrompt::configure_command().render()?;
                match absorb(conn.send_line(&line).await)? {
                    Ok(()) => {
                        let with_rc = self.prompt.with_rc().clone();
                        self.wait_for(conn, &with_rc, self.timeouts.prompt_confirm(), false)
                            .await?
                    }
                    Err(reason) => Err(reason),
                }
            }
            BootState::MasterShellReady | BootState::Fatal => {
                return Err(Error::Other(format!("no boot action for state {}", state)))
            }
        };
        Ok(event)
    }

    async fn wait_for(
        &self,
        conn: &mut dyn Connection,
        pattern: &regex::Regex,
        timeout: std::time::Duration,
        nudge: bool,
    ) -> Result<std::result::Result<BootEvent, String>> {
        if nudge {
            if let Err(reason) = absorb(conn.send_line("").await)? {
                return Ok(Err(reason));
            }
        }
        let outcome = absorb(conn.expect(std::slice::from_ref(pattern), timeout).await)?;
        Ok(match outcome {
            Ok(ExpectOutcome::Matched(_)) => Ok(BootEvent::Observed),
            Ok(ExpectOutcome::Timeout) => Err(format!(
                "no /{}/ within {:?}",
                pattern.as_str(),
                timeout
            )),
            Ok(ExpectOutcome::Eof) => Err(format!("console closed waiting for /{}/", pattern.as_str())),
            Err(reason) => Err(reason),
        })
    }

    async fn hard_reset(&self, conn: &mut dyn Connection) -> Result<std::result::Result<(), String>> {
        match &self.device.hard_reset {
            HardReset::ConsoleLine(line) => absorb(conn.send_line(line).await),
            HardReset::HostCommand(argv) => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| Error::Other("empty hard reset command".to_string()))?;
                let cmd = HostCommand::new(program.clone())
                    .args(args.iter().cloned())
                    .sudo(self.use_sudo);
                match self.host.run_checked(&cmd).await {
                    Ok(_) => Ok(Ok(())),
                    Err(e) => Ok(Err(e.to_string())),
                }
            }
        }
    }
}

/// Console failures are boot observations, everything else propagates
fn absorb<T>(result: Result<T>) -> Result<std::result::Result<T, String>> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) if e.is_connection_error() => Ok(Err(e.to_string())),
        Err(e) => Err(e),
    }
}
