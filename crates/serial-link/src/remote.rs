use crate::{Transport, TransportError};
use async_trait::async_trait;
use protocol::is_weight_read_command;
use protocol::proxy::{Ack, ConnectRequest, ErrorBody, PortInfo, SendRequest, SendResponse};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const HTTP_IO_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause the proxy takes between its own attempts.
const PROXY_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Serial line owned by the proxy service, driven over HTTP.
///
/// The proxy listens for the reply itself, so a write completes only once the response window
/// has been spent on the proxy side. Reads hand back what that request collected and never wait.
pub struct RemoteTransport {
    client: Client,
    base: Url,
    port_name: Option<String>,
    max_retries: u32,
    request_margin: Duration,
    connected: bool,
    collected: Option<Vec<String>>,
}

impl RemoteTransport {
    pub fn new(
        base_url: &str,
        port_name: Option<String>,
        max_retries: u32,
        request_margin: Duration,
    ) -> Result<Self, TransportError> {
        let base = Url::parse(base_url)
            .map_err(|err| TransportError::Proxy(format!("invalid proxy url {base_url}: {err}")))?;
        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Proxy(err.to_string()))?;
        Ok(Self {
            client,
            base,
            port_name,
            max_retries: max_retries.max(1),
            request_margin,
            connected: false,
            collected: None,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|err| TransportError::Proxy(format!("invalid proxy path {path}: {err}")))
    }

    /// A weight read is never repeated by the proxy.
    fn attempts_for(&self, command: &str) -> u32 {
        if is_weight_read_command(command) {
            1
        } else {
            self.max_retries
        }
    }

    /// Deadline for one `/send` call: every proxy attempt, the pauses between them, and a margin.
    fn send_deadline(&self, window: Duration, attempts: u32) -> Duration {
        window * attempts + PROXY_RETRY_PAUSE * attempts.saturating_sub(1) + self.request_margin
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let url = self.endpoint(path)?;
        let response = self
            .client
            .get(url)
            .timeout(HTTP_IO_TIMEOUT)
            .send()
            .await
            .map_err(|err| TransportError::Proxy(err.to_string()))?;
        decode(path, response).await
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, TransportError> {
        let url = self.endpoint(path)?;
        let response = self
            .client
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Proxy(format!("{path} timed out"))
                } else {
                    TransportError::Proxy(err.to_string())
                }
            })?;
        decode(path, response).await
    }

    async fn notify_cancel(&self) {
        let result: Result<Ack, _> = self
            .post_json("cancel", &serde_json::json!({}), HTTP_IO_TIMEOUT)
            .await;
        if let Err(err) = result {
            tracing::debug!(event = "proxy.cancel_failed", error = %err);
        }
    }
}

async fn decode<T: DeserializeOwned>(
    path: &str,
    response: reqwest::Response,
) -> Result<T, TransportError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| TransportError::Proxy(format!("{path}: {err}")));
    }
    let detail = match response.json::<ErrorBody>().await {
        Ok(body) => body.detail,
        Err(_) => status.to_string(),
    };
    Err(TransportError::Proxy(format!("{path} returned {}: {detail}", status.as_u16())))
}

#[async_trait]
impl Transport for RemoteTransport {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Ok(());
        }
        let port_name = match self.port_name.clone().filter(|name| !name.trim().is_empty()) {
            Some(name) => name,
            None => self
                .ports()
                .await?
                .into_iter()
                .next()
                .map(|port| port.device)
                .ok_or_else(|| {
                    TransportError::PortUnavailable("proxy reports no serial ports".to_string())
                })?,
        };
        let request = ConnectRequest {
            port_name: port_name.clone(),
        };
        let ack: Ack = self
            .post_json("connect", &request, HTTP_IO_TIMEOUT)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        if !ack.success {
            return Err(TransportError::Connect(ack.message));
        }
        tracing::info!(event = "proxy.connected", proxy = %self.base, port = %port_name);
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        let result: Result<Ack, _> = self
            .post_json("disconnect", &serde_json::json!({}), HTTP_IO_TIMEOUT)
            .await;
        if let Err(err) = result {
            tracing::warn!(event = "proxy.disconnect_failed", error = %err);
        }
        self.connected = false;
        self.collected = None;
    }

    async fn begin_sequence(&mut self, trigger: &str) -> Result<(), TransportError> {
        self.collected = None;
        // Re-arms the proxy after an earlier cancellation.
        let _: Ack = self
            .post_json("reset", &serde_json::json!({}), HTTP_IO_TIMEOUT)
            .await?;
        tracing::debug!(event = "proxy.sequence_started", trigger = %trigger);
        Ok(())
    }

    async fn write(
        &mut self,
        command: &str,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let attempts = self.attempts_for(command);
        self.send(command, window, attempts, cancel).await
    }

    async fn send_only(
        &mut self,
        command: &str,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.send(command, grace, 1, cancel).await?;
        self.collected = None;
        Ok(())
    }

    async fn read_available(
        &mut self,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(self
            .collected
            .take()
            .map(|tokens| tokens.concat().into_bytes())
            .unwrap_or_default())
    }

    async fn ports(&mut self) -> Result<Vec<PortInfo>, TransportError> {
        self.get_json("ports").await
    }
}

impl RemoteTransport {
    async fn send(
        &mut self,
        command: &str,
        window: Duration,
        attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let request = SendRequest {
            command: command.to_string(),
            timeout: window.as_secs_f64(),
            max_retries: attempts,
        };
        let deadline = self.send_deadline(window, attempts);
        let outcome = tokio::select! {
            outcome = self.post_json::<_, SendResponse>("send", &request, deadline) => outcome,
            _ = cancel.cancelled() => {
                self.notify_cancel().await;
                return Err(TransportError::Cancelled);
            }
        };
        let response = outcome?;
        if response.cancelled {
            tracing::info!(event = "proxy.cancelled_remotely", command = %command);
            self.collected = None;
            return Err(TransportError::Cancelled);
        }
        tracing::debug!(
            event = "proxy.sent",
            command = %command,
            success = response.success,
            received = %response.received_data,
        );
        if !response.success {
            if let Some(error) = response.error.as_deref() {
                tracing::debug!(event = "proxy.no_reply", error = %error);
            }
        }
        self.collected = Some(response.responses);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_proxy_url() {
        let err = RemoteTransport::new("not a url", None, 1, Duration::from_secs(5))
            .err()
            .expect("invalid url");
        assert!(matches!(err, TransportError::Proxy(_)));
    }

    #[test]
    fn deadline_covers_every_proxy_attempt() {
        let transport =
            RemoteTransport::new("http://127.0.0.1:8000", None, 3, Duration::from_secs(5))
                .expect("build");
        assert_eq!(
            transport.send_deadline(Duration::from_secs(2), transport.max_retries),
            Duration::from_secs(2 * 3 + 2 + 5)
        );
    }

    #[test]
    fn zero_retries_still_sends_once() {
        let transport =
            RemoteTransport::new("http://127.0.0.1:8000/", None, 0, Duration::from_secs(1))
                .expect("build");
        assert_eq!(transport.max_retries, 1);
        assert_eq!(
            transport.endpoint("send").expect("endpoint").as_str(),
            "http://127.0.0.1:8000/send"
        );
    }

    #[test]
    fn weight_reads_get_a_single_proxy_attempt() {
        let transport =
            RemoteTransport::new("http://127.0.0.1:8000", None, 3, Duration::from_secs(5))
                .expect("build");
        assert_eq!(transport.attempts_for("(IWRP)"), 1);
        assert_eq!(transport.attempts_for("IWRP"), 1);
        assert_eq!(transport.attempts_for("(IBNP)"), 3);
    }

    #[tokio::test]
    async fn unreachable_proxy_fails_connect() {
        let mut transport = RemoteTransport::new(
            "http://127.0.0.1:9/",
            Some("/dev/ttyUSB0".to_string()),
            1,
            Duration::from_secs(1),
        )
        .expect("build");
        let err = transport.connect().await.expect_err("nothing listens on port 9");
        assert!(matches!(err, TransportError::Connect(_)));
        assert!(!transport.is_connected());
    }
}
