//! Test Utilities and Fixtures
//!
//! Builds a [`MasterImageClient`] wired to the library's fakes so deploy
//! paths run end to end without a board, a host toolchain or a network.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use lava_deploy::artifact::CachingFetcher;
use lava_deploy::config::{DeviceConfig, DispatcherConfig};
use lava_deploy::testing::{CountingDownloader, RecordingHost, Responder, ScriptedConsole};
use lava_deploy::MasterImageClient;
use tempfile::TempDir;

pub const PROMPT: &str = "root@master:~# ";

/// A PandaBoard with an Android layout
pub fn panda_device() -> DeviceConfig {
    toml::from_str(
        r#"
        hostname = "panda01"
        device_type = "panda"
        connection_command = "conmux-console panda01"
        master_prompt = "root@master:"
        media_create_dev = "panda"
        tester_hostname = "linaro"

        [android]
        sys_part_org = 2
        cache_part_org = 3
        data_part_org = 5
        sys_part = 5
        sdcard_part = 6
        "#,
    )
    .unwrap()
}

/// Dispatcher config rooted in a scratch directory
pub fn dispatcher_config(root: &Path) -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.lava_image_tmpdir = root.join("tmp");
    config.lava_cachedir = root.join("cache");
    config.tools.use_sudo = false;
    config.tools.build_lock = root.join("lava-lmc.lck");
    config
}

/// Everything a deploy test needs to drive and inspect
pub struct Harness {
    pub root: TempDir,
    pub console: ScriptedConsole,
    pub host: RecordingHost,
    pub downloads: CountingDownloader,
    pub client: MasterImageClient,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_, _| {})
    }

    /// Build a harness after adjusting the configs
    pub fn with(adjust: impl FnOnce(&mut DispatcherConfig, &mut DeviceConfig)) -> Self {
        let root = TempDir::new().unwrap();
        let mut config = dispatcher_config(root.path());
        let mut device = panda_device();
        adjust(&mut config, &mut device);

        let console = ScriptedConsole::ready(PROMPT);
        console.respond("reboot", Responder::Boot);
        let host = RecordingHost::new();
        let downloads = CountingDownloader::default();

        let client = MasterImageClient::new(
            config,
            device,
            Box::new(console.clone()),
            Arc::new(host.clone()),
            Arc::new(CachingFetcher::new(downloads.clone())),
        )
        .unwrap();

        Self {
            root,
            console,
            host,
            downloads,
            client,
        }
    }

    /// Workspaces still present under the image temp root
    pub fn leftover_workspaces(&self) -> usize {
        match std::fs::read_dir(self.root.path().join("tmp")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    /// Position of the first sent line containing `needle`
    pub fn position_of(&self, needle: &str) -> Option<usize> {
        self.console.sent().iter().position(|l| l.contains(needle))
    }
}
