//! Graceful Shutdown Module
//!
//! Handles graceful shutdown of the gateway: signal handling, a broadcast
//! channel components listen on, and a final flush of the buffered access
//! log before the process exits.

use crate::logging::AccessLogBuffer;
use crate::{GatewayError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    access_log: Option<Arc<AccessLogBuffer>>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create new shutdown coordinator
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            access_log: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Set access log buffer reference for the final flush on shutdown
    pub fn set_access_log(&mut self, access_log: Arc<AccessLogBuffer>) {
        self.access_log = Some(access_log);
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Start listening for shutdown signals
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                GatewayError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                GatewayError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Initiate graceful shutdown sequence
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            // All receivers may already be gone; that is fine during teardown.
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.perform_shutdown()).await {
            Ok(result) => {
                result?;
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}",
                    self.shutdown_timeout
                );
                Err(GatewayError::SystemError("shutdown timed out".into()))
            }
        }
    }

    async fn perform_shutdown(&self) -> Result<()> {
        if let Some(access_log) = &self.access_log {
            match access_log.flush() {
                Ok(count) if count > 0 => {
                    info!("Final access log flush: {} entries", count);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Final access log flush failed: {}", e);
                }
            }
        }
        Ok(())
    }
}

/// Receiver handle a component uses to wait for shutdown.
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self { receiver }
    }

    /// Resolve when shutdown has been initiated.
    pub async fn wait_for_shutdown(&mut self) {
        // A closed channel also means the coordinator is gone; treat both as
        // shutdown.
        let _ = self.receiver.recv().await;
    }
}
