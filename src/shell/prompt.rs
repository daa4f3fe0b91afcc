//! Master image prompt detection
//!
//! The master image prompt is configured per device as a regex. Once the
//! shell is confirmed, `PS1` is extended with the status of the previous
//! command so every prompt carries a return code, e.g.
//! `root@master:~# [rc=0]: `.

use regex::Regex;

use super::ShellCommand;
use crate::error::{Error, Result};

/// Line that appends the last exit status to the shell prompt
pub const PS1_WITH_RC: &str = r#"export PS1="$PS1 [rc=$(echo \$?)]: ""#;

/// Compiled prompt patterns for one device
#[derive(Debug, Clone)]
pub struct MasterPrompt {
    plain: Regex,
    with_rc: Regex,
}

impl MasterPrompt {
    /// Compile the prompt patterns for a device's `master_prompt` regex
    pub fn new(pattern: &str) -> Result<Self> {
        let plain = Regex::new(pattern).map_err(|e| Error::ConfigValidationFailed {
            field: "master_prompt".to_string(),
            reason: e.to_string(),
        })?;
        let with_rc = Regex::new(&format!(
            r"(?:{})[^\n]*?\[rc=(?P<rc>\d+)\]: ",
            pattern
        ))?;
        Ok(Self { plain, with_rc })
    }

    /// The prompt as printed before `PS1` is reconfigured
    pub fn plain(&self) -> &Regex {
        &self.plain
    }

    /// The prompt carrying the previous command's status in group `rc`
    pub fn with_rc(&self) -> &Regex {
        &self.with_rc
    }

    /// Command that switches the shell to the rc-carrying prompt
    pub fn configure_command() -> ShellCommand {
        ShellCommand::raw(PS1_WITH_RC)
    }
}
