//! Master image client
//!
//! Ties one device's console, the dispatcher host and the artifact store
//! together and exposes the deploy and session operations a job uses.

use std::sync::Arc;

use crate::artifact::{ArtifactStore, CachingFetcher, HttpDownloader};
use crate::config::{DeviceConfig, DispatcherConfig};
use crate::console::{Connection, PtyConnection};
use crate::deploy::{AndroidDeployer, AndroidImage, DeployContext, LinuxDeployer, LinuxImage};
use crate::error::{Error, Result};
use crate::host::{HostOps, SystemHost};
use crate::image::BuildLock;
use crate::job::JobRecord;
use crate::session::{PartitionSession, SessionManager};
use crate::shell::CommandRunner;

/// Deploys images onto one board through its master image
pub struct MasterImageClient {
    config: DispatcherConfig,
    sessions: SessionManager,
    host: Arc<dyn HostOps>,
    store: Arc<dyn ArtifactStore>,
    build_lock: BuildLock,
    record: JobRecord,
}

impl MasterImageClient {
    pub fn new(
        config: DispatcherConfig,
        device: DeviceConfig,
        conn: Box<dyn Connection>,
        host: Arc<dyn HostOps>,
        store: Arc<dyn ArtifactStore>,
    ) -> Result<Self> {
        let record = JobRecord::new(device.hostname.clone());
        let sessions = SessionManager::new(conn, device, config.timeouts.clone(), Arc::clone(&host))?
            .with_sudo(config.tools.use_sudo);
        let build_lock = BuildLock::new(&config.tools.build_lock);
        Ok(Self {
            config,
            sessions,
            host,
            store,
            build_lock,
            record,
        })
    }

    /// Attach to the board's console and use the real host and network
    pub fn connect(config: DispatcherConfig, device: DeviceConfig) -> Result<Self> {
        device.validate()?;
        let conn = PtyConnection::spawn(&device.hostname, &device.connection_command)?;
        let store = CachingFetcher::new(HttpDownloader::new()?);
        Self::new(
            config,
            device,
            Box::new(conn),
            Arc::new(SystemHost),
            Arc::new(store),
        )
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn device(&self) -> &DeviceConfig {
        self.sessions.device()
    }

    /// Deploy a Linaro hwpack + rootfs image
    pub async fn deploy_linaro(&mut self, image: &LinuxImage, use_cache: bool) -> Result<()> {
        let ctx = DeployContext::new(&self.config, &*self.host, &*self.store, &self.build_lock).with_cache(use_cache);
        LinuxDeployer::new(ctx)
            .deploy(&mut self.sessions, &mut self.record, image)
            .await
    }

    /// Deploy a Linaro Android build
    pub async fn deploy_linaro_android(&mut self, image: &AndroidImage, use_cache: bool) -> Result<()> {
        let ctx = DeployContext::new(&self.config, &*self.host, &*self.store, &self.build_lock).with_cache(use_cache);
        AndroidDeployer::new(ctx)
            .deploy(&mut self.sessions, &mut self.record, image)
            .await
    }

    pub async fn master_session(&mut self) -> Result<CommandRunner<'_>> {
        self.sessions.master_session().await
    }

    pub async fn partition_session(&mut self, label: &str) -> Result<PartitionSession<'_>> {
        self.sessions.partition_session(label).await
    }

    /// Session inside the deployed test root filesystem
    pub async fn reliable_session(&mut self) -> Result<PartitionSession<'_>> {
        self.sessions.reliable_session().await
    }

    /// Address of the master image's network interface
    ///
    /// `None` when the network never came up or no address is visible yet.
    pub async fn master_ip(&mut self) -> Result<Option<String>> {
        let server_ip = self.config.lava_server_ip.clone();
        let timeouts = self.config.timeouts.clone();
        let interface = self.sessions.device().network_interface.clone();

        let mut master = self.sessions.master_session().await?;
        match master
            .wait_network_up(&server_ip, timeouts.network_up(), timeouts.ping())
            .await
        {
            Ok(()) => {}
            Err(e @ Error::NetworkUnreachable { .. }) => {
                warn!("Cannot determine master IP: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let ip = master.interface_address(&interface, timeouts.command()).await?;
        match &ip {
            Some(ip) => info!("Master image IP is {}", ip),
            None => warn!("No address on {} yet", interface),
        }
        Ok(ip)
    }

    pub fn job_record(&self) -> &JobRecord {
        &self.record
    }

    /// Stamp the job record with the outcome of the job
    pub fn finish_job<T>(&mut self, outcome: &Result<T>) {
        self.record.finish(outcome);
    }
}
