//! The device façade: provision the backstore, attach to the kernel, run
//! the pipeline, tear everything down on close.

use std::sync::Arc;

use tcmud_ring::OffsetProfile;

use crate::config::DeviceConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::handler::ScsiCmdHandler;
use crate::provision::Provisioner;
use crate::uio;

/// A running emulated SCSI device.
///
/// Opening one provisions the TCM-User backstore and a loopback target in
/// front of it, maps the command ring, starts the dispatcher, and creates
/// a block device node named after the volume. The device must be
/// [`closed`](Self::close) to take all of that down again.
#[derive(Debug)]
pub struct Device {
    config: Arc<DeviceConfig>,
    provisioner: Provisioner,
    dispatcher: Option<Dispatcher>,
}

impl Device {
    /// Provisions and attaches the device described by `config`, serving
    /// commands through `handler`.
    ///
    /// Must be called from within a tokio runtime. On failure, whatever
    /// provisioning already landed is unwound before returning.
    ///
    /// # Errors
    ///
    /// Configuration validation, configfs provisioning, uio discovery and
    /// mapping, or dispatcher start failures.
    pub async fn open(config: DeviceConfig, handler: Arc<dyn ScsiCmdHandler>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let mut provisioner = Provisioner::new(Arc::clone(&config));

        match Self::bring_up(&config, handler, &mut provisioner).await {
            Ok(dispatcher) => {
                tracing::info!(volume = %config.volume_name, "device attached");
                Ok(Self {
                    config,
                    provisioner,
                    dispatcher: Some(dispatcher),
                })
            }
            Err(err) => {
                if let Err(cleanup) = provisioner.teardown().await {
                    tracing::error!(%cleanup, "cleanup after failed open also failed");
                }
                Err(err)
            }
        }
    }

    async fn bring_up(
        config: &Arc<DeviceConfig>,
        handler: Arc<dyn ScsiCmdHandler>,
        provisioner: &mut Provisioner,
    ) -> Result<Dispatcher> {
        provisioner.pre_enable()?;

        let found = uio::find_device(&config.config_string())?;
        tracing::debug!(uio = %found.uio, volume = %found.name.volume, "found tcm-user uio node");
        let channel = uio::open_device(&found)?;

        let dispatcher =
            Dispatcher::start(channel, handler, OffsetProfile::native(), config.workers)?;

        provisioner.post_enable().await?;
        Ok(dispatcher)
    }

    /// The configuration this device was opened with.
    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Stops the pipeline (closing the uio descriptor) and removes the
    /// provisioned target and device node.
    ///
    /// # Errors
    ///
    /// The first dispatcher failure, or teardown failures.
    pub async fn close(mut self) -> Result<()> {
        tracing::info!(volume = %self.config.volume_name, "closing device");
        let dispatch_result = match self.dispatcher.take() {
            Some(dispatcher) => dispatcher.shutdown().await,
            None => Ok(()),
        };
        let teardown_result = self.provisioner.teardown().await;
        dispatch_result.and(teardown_result)
    }
}
