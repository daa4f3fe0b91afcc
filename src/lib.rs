//! lava-deploy - deploys test images onto lab boards
//!
//! Boards in the lab carry a recovery "master image" next to their test
//! partitions. This crate drives a board's serial console into that master
//! shell, then reformats and refills the test partitions with a Linaro
//! Linux or Android build.
//!
//! ## Module Organization
//!
//! ### Device access
//!
//! - [`console`] - Console connection trait and the PTY implementation
//! - [`shell`] - Typed shell commands, prompt handling, command runner
//! - [`boot`] - Boot recovery state machine
//! - [`session`] - Master and partition (chroot) sessions
//!
//! ### Deployment
//!
//! - [`artifact`] - Downloads, the artifact cache, deployment workspaces
//! - [`image`] - Image building and partition extraction on the host
//! - [`deploy`] - Linux and Android deployment pipelines
//! - [`client`] - One board's deploy and session operations
//!
//! ### Support
//!
//! - [`config`] - Dispatcher and device configuration
//! - [`host`] - Host command execution
//! - [`job`] - Job metadata and diagnostics
//! - [`mod@error`] - Error types and Result aliases
//! - [`testing`] - Deterministic fakes for tests
//!
//! ## Quick Start
//!
//! ```no_run
//! use lava_deploy::{ConfigLoader, LinuxImage, MasterImageClient};
//!
//! # async fn run() -> lava_deploy::Result<()> {
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_dispatcher(None)?;
//! let device = loader.load_device("panda01")?;
//!
//! let mut client = MasterImageClient::connect(config, device)?;
//! let image = LinuxImage {
//!     hwpack: "http://snapshots/hwpack_panda.tar.gz".to_string(),
//!     rootfs: "http://snapshots/nano.tgz".to_string(),
//!     kernel: None,
//! };
//! client.deploy_linaro(&image, true).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! One board is driven by one task: sessions borrow the device's
//! [`SessionManager`] mutably, so only one command is in flight at a
//! time. The only lock shared between processes guards the image tool.

#[macro_use]
extern crate tracing;

pub mod artifact;
pub mod boot;
pub mod client;
pub mod config;
pub mod console;
pub mod deploy;
pub mod error;
pub mod host;
pub mod image;
pub mod job;
pub mod session;
pub mod shell;
pub mod testing;

pub use client::MasterImageClient;
pub use config::{ConfigLoader, DeviceConfig, DispatcherConfig};
pub use deploy::{AndroidImage, KernelPackage, LinuxImage};
pub use error::{Error, Result};
pub use session::{PartitionSession, SessionManager};

/// The current version of lava-deploy from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The application name from Cargo.toml
pub const NAME: &str = env!("CARGO_PKG_NAME");
