mod direct;
pub mod matcher;
mod remote;
mod simulated;

use async_trait::async_trait;
use protocol::config::{SimulatorConfig, TransportBackend, TransportConfig};
use protocol::proxy::PortInfo;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use direct::{list_serial_ports, DirectTransport};
pub use remote::RemoteTransport;
pub use simulated::{SentJournal, SimulatedTransport};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("link is not connected")]
    NotConnected,
    #[error("no serial port available: {0}")]
    PortUnavailable(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("proxy request failed: {0}")]
    Proxy(String),
    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

#[async_trait]
pub trait Transport: Send {
    fn name(&self) -> &'static str;

    fn is_connected(&self) -> bool;

    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn disconnect(&mut self);

    /// Called once before every command sequence, named after the trigger that started it.
    async fn begin_sequence(&mut self, _trigger: &str) -> Result<(), TransportError> {
        Ok(())
    }

    /// Sends one command. `window` is how long the caller will listen for the reply.
    async fn write(
        &mut self,
        command: &str,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    /// Sends a command whose reply nobody waits for; `grace` is how long the device gets to react.
    async fn send_only(
        &mut self,
        command: &str,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.write(command, grace, cancel).await
    }

    /// Returns whatever bytes arrive within `timeout`; an empty vector means nothing arrived.
    async fn read_available(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransportError>;

    async fn ports(&mut self) -> Result<Vec<PortInfo>, TransportError>;
}

pub fn build_transport(
    transport: &TransportConfig,
    simulator: &SimulatorConfig,
) -> Result<Box<dyn Transport>, TransportError> {
    let built: Box<dyn Transport> = match transport.backend {
        TransportBackend::Direct => Box::new(DirectTransport::new(transport.port_name.clone())),
        TransportBackend::Remote => Box::new(RemoteTransport::new(
            &transport.proxy_url,
            transport.port_name.clone(),
            transport.proxy_max_retries,
            transport.request_margin,
        )?),
        TransportBackend::Simulated => Box::new(SimulatedTransport::from_config(simulator)),
    };
    tracing::info!(event = "transport.selected", backend = built.name());
    Ok(built)
}

/// Sleeps for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_or_cancel_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let started = tokio::time::Instant::now();
        let result = sleep_or_cancel(Duration::from_secs(60), &cancel).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn simulated_backend_is_default() {
        let transport =
            build_transport(&TransportConfig::default(), &SimulatorConfig::default()).expect("build");
        assert_eq!(transport.name(), "simulated");
        assert!(!transport.is_connected());
    }
}
