//! Shell commands on the master image
//!
//! [`ShellCommand`] builds a command line, [`MasterPrompt`] knows what the
//! shell prints between commands, and [`CommandRunner`] drives one command
//! at a time over a console connection.

pub mod command;
pub mod prompt;
pub mod runner;

pub use command::{quote, ShellCommand};
pub use prompt::MasterPrompt;
pub use runner::{extract_ipv4, CommandOutput, CommandRunner};
