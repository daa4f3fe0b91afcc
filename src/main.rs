//! lava-deploy command line
//!
//! Deploys a Linaro image onto one board, runs a command in its master
//! image, or reports the master image's address.

use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, error, info};

use lava_deploy::config::ConfigLoader;
use lava_deploy::session::settle;
use lava_deploy::shell::ShellCommand;
use lava_deploy::{AndroidImage, KernelPackage, LinuxImage, MasterImageClient};

#[derive(Debug, Parser)]
#[command(name = "lava-deploy", version, about = "Deploy test images through a board's master image")]
struct Cli {
    /// Dispatcher configuration file
    #[arg(short, long, env = "LAVA_DEPLOY_CONFIG")]
    config: Option<PathBuf>,

    /// Device hostname or path to a device TOML file
    #[arg(short, long)]
    device: String,

    /// Always download artifacts instead of using the cache
    #[arg(long, global = true)]
    no_cache: bool,

    /// Enable debug logging
    #[arg(long, env = "LAVA_DEPLOY_DEBUG")]
    debug: bool,

    /// Write the JSON job record here when done
    #[arg(long, value_name = "PATH")]
    job_record: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deploy a hwpack + rootfs Linaro image
    Linux {
        #[arg(long)]
        hwpack: String,
        #[arg(long)]
        rootfs: String,
        /// Kernel .deb to swap into the hwpack
        #[arg(long, requires = "kernel_prefix")]
        kernel_deb: Option<String>,
        /// Package prefix of the kernel being replaced
        #[arg(long, requires = "kernel_deb")]
        kernel_prefix: Option<String>,
    },
    /// Deploy a Linaro Android build
    Android {
        #[arg(long)]
        boot: String,
        #[arg(long)]
        system: String,
        #[arg(long)]
        data: String,
        /// Extra tarball unpacked onto the boot partition
        #[arg(long)]
        pkg: Option<String>,
        #[arg(long)]
        install_data: bool,
        #[arg(long)]
        install_system: bool,
    },
    /// Run a command in the master image or inside a test partition
    Run {
        /// Chroot into the partition with this label
        #[arg(long)]
        partition: Option<String>,
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Print the master image's IP address
    MasterIp,
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from(filter))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Run `argv` on the board and return its status
async fn run_command(
    client: &mut MasterImageClient,
    partition: Option<&str>,
    argv: &[String],
) -> lava_deploy::Result<i32> {
    let cmd = ShellCommand::new(argv[0].clone()).args(argv[1..].iter().cloned());
    match partition {
        Some(label) => {
            let mut session = client.partition_session(label).await?;
            let rc = session.runner().run(&cmd).await;
            settle(rc, session.release().await)
        }
        None => client.master_session().await?.run(&cmd).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    info!("Starting {} v{}", lava_deploy::NAME, lava_deploy::VERSION);
    debug!("{:?}", cli);

    let mut loader = ConfigLoader::new();
    let config = loader
        .load_dispatcher(cli.config.as_deref())
        .context("loading dispatcher configuration")?;
    let device = loader
        .load_device(&cli.device)
        .with_context(|| format!("loading device {}", cli.device))?;

    let mut client = MasterImageClient::connect(config, device).context("attaching to the console")?;
    let use_cache = !cli.no_cache;
    let mut exit_code = 0;

    let outcome = match cli.command {
        Command::Linux {
            hwpack,
            rootfs,
            kernel_deb,
            kernel_prefix,
        } => {
            let kernel = match (kernel_deb, kernel_prefix) {
                (Some(deb), Some(prefix)) => Some(KernelPackage::new(deb, prefix)?),
                _ => None,
            };
            let image = LinuxImage { hwpack, rootfs, kernel };
            client.deploy_linaro(&image, use_cache).await
        }
        Command::Android {
            boot,
            system,
            data,
            pkg,
            install_data,
            install_system,
        } => {
            let image = AndroidImage {
                pkg,
                install_data,
                install_system,
                ..AndroidImage::new(boot, system, data)
            };
            client.deploy_linaro_android(&image, use_cache).await
        }
        Command::Run { partition, command } => run_command(&mut client, partition.as_deref(), &command)
            .await
            .map(|rc| {
                println!("rc={}", rc);
                exit_code = rc;
            }),
        Command::MasterIp => client.master_ip().await.map(|ip| match ip {
            Some(ip) => println!("{}", ip),
            None => exit_code = 1,
        }),
    };

    client.finish_job(&outcome);
    if let Some(path) = &cli.job_record {
        if let Err(e) = client.job_record().save(path) {
            error!("Could not write job record: {}", e);
        }
    }

    if let Err(e) = outcome {
        error!("{}", e.trace());
        process::exit(2);
    }
    if exit_code != 0 {
        process::exit(exit_code);
    }
    Ok(())
}
