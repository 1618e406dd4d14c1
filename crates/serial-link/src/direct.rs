use crate::{sleep_or_cancel, Transport, TransportError};
use async_trait::async_trait;
use protocol::framing::{BAUD_RATE, LINE_TERMINATOR};
use protocol::proxy::PortInfo;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const OPEN_SETTLE: Duration = Duration::from_millis(500);
const PRE_WRITE_SETTLE: Duration = Duration::from_millis(100);
const POST_WRITE_SETTLE: Duration = Duration::from_millis(300);
/// Longest a single blocking read may hold the port, so cancellation is seen promptly.
const READ_SLICE: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 256;

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Serial line opened on this machine at 9600 8N1.
pub struct DirectTransport {
    port_name: Option<String>,
    port: Option<SharedPort>,
    connected_name: Option<String>,
}

impl DirectTransport {
    pub fn new(port_name: Option<String>) -> Self {
        Self {
            port_name,
            port: None,
            connected_name: None,
        }
    }

    /// Opens `port_name` and waits for the device to settle.
    pub async fn open(port_name: &str) -> Result<Self, TransportError> {
        let mut transport = Self::new(Some(port_name.to_string()));
        transport.connect().await?;
        Ok(transport)
    }

    pub fn connected_name(&self) -> Option<&str> {
        self.connected_name.as_deref()
    }

    fn shared_port(&self) -> Result<SharedPort, TransportError> {
        self.port.clone().ok_or(TransportError::NotConnected)
    }

    async fn resolve_port_name(&self) -> Result<String, TransportError> {
        if let Some(name) = self.port_name.as_ref().filter(|name| !name.trim().is_empty()) {
            return Ok(name.clone());
        }
        let ports = list_serial_ports().await?;
        ports
            .into_iter()
            .next()
            .map(|port| port.device)
            .ok_or_else(|| TransportError::PortUnavailable("no serial ports detected".to_string()))
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }
        let name = self.resolve_port_name().await?;
        let open_name = name.clone();
        let port = tokio::task::spawn_blocking(move || open_port(&open_name))
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))??;
        let port: SharedPort = Arc::new(Mutex::new(port));

        tokio::time::sleep(OPEN_SETTLE).await;
        let clear_port = Arc::clone(&port);
        tokio::task::spawn_blocking(move || {
            let port = lock_port(&clear_port)?;
            port.clear(ClearBuffer::All)
                .map_err(|err| TransportError::Connect(err.to_string()))
        })
        .await
        .map_err(|err| TransportError::Connect(err.to_string()))??;

        tracing::info!(event = "serial.connected", port = %name, baud = BAUD_RATE);
        self.port = Some(port);
        self.connected_name = Some(name);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(name) = self.connected_name.take() {
            tracing::info!(event = "serial.disconnected", port = %name);
        }
        self.port = None;
    }

    async fn write(
        &mut self,
        command: &str,
        _window: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let port = self.shared_port()?;

        let drain_port = Arc::clone(&port);
        let drained = tokio::task::spawn_blocking(move || drain_input(&drain_port))
            .await
            .map_err(|err| TransportError::Write(err.to_string()))??;
        if drained > 0 {
            tracing::debug!(event = "serial.drained", bytes = drained);
        }
        sleep_or_cancel(PRE_WRITE_SETTLE, cancel).await?;

        let frame = format!("{command}{LINE_TERMINATOR}");
        let write_port = Arc::clone(&port);
        let write = tokio::task::spawn_blocking(move || {
            let mut port = lock_port(&write_port)?;
            port.write_all(frame.as_bytes())
                .and_then(|_| port.flush())
                .map_err(|err| TransportError::Write(err.to_string()))
        });
        tokio::select! {
            joined = write => joined.map_err(|err| TransportError::Write(err.to_string()))??,
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        }
        tracing::debug!(event = "serial.sent", command = %command);

        sleep_or_cancel(POST_WRITE_SETTLE, cancel).await
    }

    async fn read_available(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransportError> {
        let port = self.shared_port()?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let slice = remaining.min(READ_SLICE);
            let read_port = Arc::clone(&port);
            let read = tokio::task::spawn_blocking(move || read_slice(&read_port, slice));
            let chunk = tokio::select! {
                joined = read => joined.map_err(|err| TransportError::Read(err.to_string()))??,
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            };
            if !chunk.is_empty() {
                return Ok(chunk);
            }
        }
    }

    async fn ports(&mut self) -> Result<Vec<PortInfo>, TransportError> {
        list_serial_ports().await
    }
}

pub async fn list_serial_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = tokio::task::spawn_blocking(serialport::available_ports)
        .await
        .map_err(|err| TransportError::PortUnavailable(err.to_string()))?
        .map_err(|err| TransportError::PortUnavailable(err.to_string()))?;
    Ok(ports
        .into_iter()
        .map(|port| PortInfo {
            description: describe_port(&port.port_type),
            device: port.port_name,
        })
        .collect())
}

fn describe_port(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => usb
            .product
            .clone()
            .or_else(|| usb.manufacturer.clone())
            .unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb.vid, usb.pid)),
        SerialPortType::PciPort => "PCI serial port".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
        SerialPortType::Unknown => "serial port".to_string(),
    }
}

fn open_port(name: &str) -> Result<Box<dyn SerialPort>, TransportError> {
    let mut port = serialport::new(name, BAUD_RATE)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .flow_control(FlowControl::None)
        .timeout(READ_SLICE)
        .open()
        .map_err(|err| TransportError::Connect(format!("{name}: {err}")))?;
    // Asserting DTR/RTS resets some controllers on open.
    if let Err(err) = port
        .write_data_terminal_ready(false)
        .and_then(|_| port.write_request_to_send(false))
    {
        tracing::debug!(event = "serial.signals_unsupported", error = %err);
    }
    Ok(port)
}

fn lock_port(
    port: &SharedPort,
) -> Result<std::sync::MutexGuard<'_, Box<dyn SerialPort>>, TransportError> {
    port.lock()
        .map_err(|_| TransportError::Read("serial port lock poisoned".to_string()))
}

fn drain_input(port: &SharedPort) -> Result<usize, TransportError> {
    let mut port = lock_port(port)?;
    port.clear(ClearBuffer::Input)
        .map_err(|err| TransportError::Write(err.to_string()))?;
    let mut drained = 0;
    let mut buf = [0u8; READ_CHUNK];
    while port.bytes_to_read().unwrap_or(0) > 0 {
        match port.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => drained += read,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => break,
            Err(err) => return Err(TransportError::Write(err.to_string())),
        }
    }
    Ok(drained)
}

fn read_slice(port: &SharedPort, slice: Duration) -> Result<Vec<u8>, TransportError> {
    let mut port = lock_port(port)?;
    port.set_timeout(slice)
        .map_err(|err| TransportError::Read(err.to_string()))?;
    let mut buf = [0u8; READ_CHUNK];
    match port.read(&mut buf) {
        Ok(read) => Ok(buf[..read].to_vec()),
        Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
        Err(err) => Err(TransportError::Read(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_without_connect_is_reported() {
        let mut transport = DirectTransport::new(Some("/dev/null-serial".to_string()));
        let cancel = CancellationToken::new();
        let err = transport
            .write("(IBNP)", Duration::from_secs(1), &cancel)
            .await
            .expect_err("not connected");
        assert!(matches!(err, TransportError::NotConnected));
        let err = transport
            .read_available(Duration::from_millis(10), &cancel)
            .await
            .expect_err("not connected");
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn connect_to_missing_port_fails_without_retry() {
        let mut transport = DirectTransport::new(Some("/dev/does-not-exist-kiosk".to_string()));
        let err = transport.connect().await.expect_err("missing port");
        assert!(matches!(err, TransportError::Connect(_)));
        assert!(!transport.is_connected());
    }

    #[test]
    fn usb_ports_are_described_by_product() {
        let usb = SerialPortType::UsbPort(serialport::UsbPortInfo {
            vid: 0x1a86,
            pid: 0x7523,
            serial_number: None,
            manufacturer: Some("QinHeng".to_string()),
            product: None,
        });
        assert_eq!(describe_port(&usb), "QinHeng");
        assert_eq!(describe_port(&SerialPortType::Unknown), "serial port");
    }
}
