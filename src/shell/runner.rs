//! Command execution over a console
//!
//! One command is in flight at a time: the line is sent, then the runner
//! waits for the rc-carrying prompt before returning. A nonzero status is
//! an ordinary return value; only the console failing to answer is an
//! error.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tokio::time::Instant;

use super::{MasterPrompt, ShellCommand};
use crate::console::{Connection, ExpectMatch, ExpectOutcome};
use crate::error::{Error, Result};

/// Dotted-quad address in command output
static IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").unwrap());

static PING_REPLIED: Lazy<Regex> = Lazy::new(|| Regex::new("1 received").unwrap());
static PING_LOST: Lazy<Regex> = Lazy::new(|| Regex::new("0 received").unwrap());

/// Pause between network probes that failed quickly
const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Result of a command that also watched for extra patterns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status reported by the prompt
    pub rc: i32,
    /// First extra pattern seen before the prompt, if any
    pub matched: Option<ExpectMatch>,
    /// Output between the last match and the prompt
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.rc == 0
    }

    /// Index of the extra pattern that matched
    pub fn matched_index(&self) -> Option<usize> {
        self.matched.as_ref().map(|m| m.index)
    }
}

/// Runs shell commands on the device, one at a time
pub struct CommandRunner<'c> {
    conn: &'c mut dyn Connection,
    prompt: MasterPrompt,
    chroot: Option<String>,
    default_timeout: Duration,
}

impl<'c> CommandRunner<'c> {
    pub fn new(conn: &'c mut dyn Connection, prompt: MasterPrompt, default_timeout: Duration) -> Self {
        Self {
            conn,
            prompt,
            chroot: None,
            default_timeout,
        }
    }

    /// A runner on the same console whose commands run inside `root`
    pub fn chrooted(&mut self, root: &str) -> CommandRunner<'_> {
        CommandRunner {
            conn: &mut *self.conn,
            prompt: self.prompt.clone(),
            chroot: Some(root.to_string()),
            default_timeout: self.default_timeout,
        }
    }

    /// Chroot prefix applied to every command, if any
    pub fn chroot(&self) -> Option<&str> {
        self.chroot.as_deref()
    }

    pub fn prompt(&self) -> &MasterPrompt {
        &self.prompt
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run a command with the default timeout and return its status
    pub async fn run(&mut self, command: &ShellCommand) -> Result<i32> {
        let timeout = self.default_timeout;
        self.run_with_timeout(command, timeout).await
    }

    /// Run a command and return its status
    pub async fn run_with_timeout(&mut self, command: &ShellCommand, timeout: Duration) -> Result<i32> {
        Ok(self.run_matching(command, &[], timeout).await?.rc)
    }

    /// Run a command that must succeed
    pub async fn run_checked(&mut self, command: &ShellCommand, timeout: Duration) -> Result<()> {
        let rc = self.run_with_timeout(command, timeout).await?;
        if rc != 0 {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                rc,
            });
        }
        Ok(())
    }

    /// Run a command, watching its output for `extra` patterns
    ///
    /// Extra patterns are checked ahead of the prompt. Once one matches, the
    /// runner keeps waiting for the prompt within the same deadline so the
    /// console is idle again when this returns.
    pub async fn run_matching(
        &mut self,
        command: &ShellCommand,
        extra: &[Regex],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let command = match &self.chroot {
            Some(root) => command.within_chroot(root)?,
            None => command.clone(),
        };
        let line = command.render()?;
        debug!("$ {}", line);
        self.conn.send_line(&line).await?;

        let deadline = Instant::now() + timeout;
        let mut patterns: Vec<Regex> = extra.to_vec();
        patterns.push(self.prompt.with_rc().clone());
        let prompt_only = std::slice::from_ref(self.prompt.with_rc());

        let mut matched: Option<ExpectMatch> = None;
        loop {
            let candidates: &[Regex] = if matched.is_some() { prompt_only } else { &patterns };
            let remaining = deadline.saturating_duration_since(Instant::now());

            match self.conn.expect(candidates, remaining).await? {
                ExpectOutcome::Matched(found) => {
                    if matched.is_none() && found.index < extra.len() {
                        matched = Some(found);
                        continue;
                    }
                    let rc = parse_rc(&found)?;
                    debug!("rc={} for `{}`", rc, line);
                    return Ok(CommandOutput {
                        rc,
                        matched,
                        output: found.before,
                    });
                }
                ExpectOutcome::Timeout => {
                    return Err(Error::ConnectionTimeout {
                        waiting_for: format!("prompt after `{}`", line),
                        timeout,
                    })
                }
                ExpectOutcome::Eof => {
                    return Err(Error::ConnectionClosed {
                        waiting_for: format!("prompt after `{}`", line),
                    })
                }
            }
        }
    }

    /// Current IPv4 address of `interface`, if one is visible yet
    pub async fn interface_address(&mut self, interface: &str, timeout: Duration) -> Result<Option<String>> {
        let pipeline = ShellCommand::new("ifconfig")
            .arg(interface)
            .pipe(ShellCommand::new("grep").arg("inet addr"))
            .pipe(ShellCommand::new("awk").arg("-F:").arg("{print $2}"))
            .pipe(ShellCommand::new("awk").arg("{print $1}"));

        let output = self
            .run_matching(&pipeline, std::slice::from_ref(&*IPV4), timeout)
            .await?;
        Ok(output
            .matched
            .as_ref()
            .and_then(|m| m.first_group())
            .map(str::to_string))
    }

    /// Ping the dispatcher once; `true` when a reply came back
    pub async fn check_network_up(&mut self, server_ip: &str, timeout: Duration) -> Result<bool> {
        let ping = ShellCommand::new("ping")
            .env("LC_ALL", "C")
            .args(["-W4", "-c1", server_ip]);
        let patterns = [PING_REPLIED.clone(), PING_LOST.clone()];
        let output = self.run_matching(&ping, &patterns, timeout).await?;
        Ok(output.matched_index() == Some(0))
    }

    /// Poll until the dispatcher answers a ping or `total` elapses
    ///
    /// A console timeout during one probe only means "not yet"; at least one
    /// probe is always made.
    pub async fn wait_network_up(&mut self, server_ip: &str, total: Duration, ping_timeout: Duration) -> Result<()> {
        info!("Waiting for network to come up");
        let deadline = Instant::now() + total;
        loop {
            match self.check_network_up(server_ip, ping_timeout).await {
                Ok(true) => {
                    info!("Network is up");
                    return Ok(());
                }
                Ok(false) => debug!("{} not reachable yet", server_ip),
                Err(e @ Error::ConnectionTimeout { .. }) => debug!("ping probe: {}", e),
                Err(e) => return Err(e),
            }

            if Instant::now() + NETWORK_RETRY_DELAY >= deadline {
                warn!("Network is still down after {:?}", total);
                return Err(Error::NetworkUnreachable { timeout: total });
            }
            tokio::time::sleep(NETWORK_RETRY_DELAY).await;
        }
    }
}

fn parse_rc(found: &ExpectMatch) -> Result<i32> {
    found
        .rc
        .as_deref()
        .and_then(|rc| rc.parse().ok())
        .ok_or_else(|| Error::Other(format!("prompt without a return code: {:?}", found.text)))
}

/// First dotted-quad address in `text`
pub fn extract_ipv4(text: &str) -> Option<String> {
    IPV4.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
