//! Error types and Result aliases for lava-deploy

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for lava-deploy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for lava-deploy
///
/// A command that ran on the device and exited nonzero is *not* an error:
/// [`CommandRunner::run`](crate::shell::CommandRunner::run) returns the
/// status as a plain value. Errors are reserved for the console failing,
/// the shell never answering, and deployment steps with no recovery path.
#[derive(Debug, Error)]
pub enum Error {
    // === Console errors ===
    /// The console produced no matching output before the deadline
    #[error("console timed out after {timeout:?} waiting for {waiting_for}")]
    ConnectionTimeout {
        waiting_for: String,
        timeout: Duration,
    },

    /// The console stream ended before any pattern matched
    #[error("console closed while waiting for {waiting_for}")]
    ConnectionClosed { waiting_for: String },

    /// Failed to spawn or talk to the console process
    #[error("console I/O failed: {reason}")]
    ConsoleIo { reason: String },

    /// The blank-line probe did not see the master prompt
    #[error("master shell did not answer within {timeout:?}")]
    ShellNotReady { timeout: Duration },

    /// The boot sequencer ran out of transitions
    #[error("board did not reach the master shell ({state}): {reason}")]
    BootFailed { state: String, reason: String },

    // === Deployment errors ===
    /// Unrecoverable deployment failure; the diagnostic trace has already
    /// been written to the job output
    #[error("{context}")]
    Fatal {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// A host-side tool exited nonzero
    #[error("{tool} failed with status {status}: {output}")]
    ToolFailed {
        tool: String,
        status: i32,
        output: String,
    },

    /// A device command whose status matters exited nonzero
    #[error("`{command}` exited with rc={rc}")]
    CommandFailed { command: String, rc: i32 },

    /// The device never reached the dispatcher over the network
    #[error("network on the device did not come up within {timeout:?}")]
    NetworkUnreachable { timeout: Duration },

    /// Artifact download failed
    #[error("failed to fetch {url}: {reason}")]
    ArtifactFetchFailed { url: String, reason: String },

    /// The partition table dump had no entry for a partition
    #[error("partition {index} not found in {}", image.display())]
    PartitionNotFound { image: PathBuf, index: u32 },

    /// Only Debian kernel packages can be swapped into a hwpack
    #[error("kernel package must be a .deb, got {url}")]
    UnsupportedKernelPackage { url: String },

    // === Command errors ===
    /// A command or argument cannot be sent over a line-oriented console
    #[error("command validation failed for '{command}': {reason}")]
    CommandValidationFailed { command: String, reason: String },

    // === Configuration errors ===
    /// Failed to load configuration file
    #[error("failed to load config from '{}': {reason}", path.display())]
    ConfigLoadFailed { path: PathBuf, reason: String },

    /// Configuration file not found
    #[error("configuration file not found")]
    ConfigNotFound,

    /// Configuration validation failed
    #[error("configuration validation failed for '{field}': {reason}")]
    ConfigValidationFailed { field: String, reason: String },

    // === I/O and serialization errors ===
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Generic errors (use sparingly)
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap this error as fatal with a one-line context
    pub fn fatal(self, context: impl Into<String>) -> Self {
        Error::Fatal {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether the console itself failed (as opposed to a command or tool)
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout { .. } | Error::ConnectionClosed { .. } | Error::ConsoleIo { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }

    /// Render the error and its full source chain, one cause per line
    pub fn trace(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\n  caused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::Other(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::Other(err.to_string())
    }
}
