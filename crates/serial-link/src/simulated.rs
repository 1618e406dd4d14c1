use crate::{sleep_or_cancel, Transport, TransportError};
use async_trait::async_trait;
use protocol::config::{OutOfBounds, ScriptedResponse, SimulatorConfig};
use protocol::proxy::PortInfo;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_SCRIPT: &str = "default";

/// Shared record of every command the simulator was asked to send.
#[derive(Debug, Clone, Default)]
pub struct SentJournal {
    inner: Arc<Mutex<Vec<String>>>,
}

impl SentJournal {
    pub fn sent(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    fn record(&self, command: &str) {
        if let Ok(mut sent) = self.inner.lock() {
            sent.push(command.to_string());
        }
    }
}

/// Answers commands from per-trigger response scripts instead of hardware.
///
/// Each trigger owns an ordered response list. The position resets when a sequence begins and
/// advances on every write; past the end the list either repeats its last entry or wraps.
pub struct SimulatedTransport {
    scripts: BTreeMap<String, Vec<ScriptedResponse>>,
    out_of_bounds: OutOfBounds,
    default_delay: Duration,
    positions: HashMap<String, usize>,
    active: String,
    pending: Option<ScriptedResponse>,
    connected: bool,
    journal: SentJournal,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::from_config(&SimulatorConfig::default())
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self {
            scripts: config.scripts.clone(),
            out_of_bounds: config.out_of_bounds,
            default_delay: config.default_delay,
            positions: HashMap::new(),
            active: DEFAULT_SCRIPT.to_string(),
            pending: None,
            connected: false,
            journal: SentJournal::default(),
        }
    }

    pub fn with_script(mut self, trigger: &str, responses: Vec<ScriptedResponse>) -> Self {
        self.scripts.insert(trigger.to_string(), responses);
        self
    }

    pub fn with_out_of_bounds(mut self, policy: OutOfBounds) -> Self {
        self.out_of_bounds = policy;
        self
    }

    pub fn journal(&self) -> SentJournal {
        self.journal.clone()
    }

    fn next_response(&mut self) -> Option<ScriptedResponse> {
        let script = self.scripts.get(&self.active)?;
        if script.is_empty() {
            return None;
        }
        let position = self.positions.entry(self.active.clone()).or_insert(0);
        let index = match self.out_of_bounds {
            OutOfBounds::RepeatLast => (*position).min(script.len() - 1),
            OutOfBounds::Cycle => *position % script.len(),
        };
        *position += 1;
        script.get(index).cloned()
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
        self.pending = None;
    }

    async fn begin_sequence(&mut self, trigger: &str) -> Result<(), TransportError> {
        self.active = if self.scripts.contains_key(trigger) {
            trigger.to_string()
        } else {
            DEFAULT_SCRIPT.to_string()
        };
        self.positions.insert(self.active.clone(), 0);
        self.pending = None;
        tracing::debug!(event = "simulator.sequence_started", trigger = %trigger, script = %self.active);
        Ok(())
    }

    async fn write(
        &mut self,
        command: &str,
        _window: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.journal.record(command);
        self.pending = self.next_response();
        tracing::debug!(event = "simulator.sent", command = %command);
        Ok(())
    }

    async fn read_available(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let Some(response) = self.pending.take().filter(|response| response.succeed) else {
            sleep_or_cancel(timeout, cancel).await?;
            return Ok(Vec::new());
        };
        let delay = response
            .delay_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_delay);
        if delay > timeout {
            sleep_or_cancel(timeout, cancel).await?;
            return Ok(Vec::new());
        }
        sleep_or_cancel(delay, cancel).await?;
        Ok(response.receive.into_bytes())
    }

    async fn ports(&mut self) -> Result<Vec<PortInfo>, TransportError> {
        Ok(vec![PortInfo {
            device: "SIMULATOR".to_string(),
            description: "scripted collection unit".to_string(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(transport: &mut SimulatedTransport, command: &str) -> String {
        let cancel = CancellationToken::new();
        transport
            .write(command, Duration::from_secs(2), &cancel)
            .await
            .expect("write");
        let bytes = transport
            .read_available(Duration::from_secs(2), &cancel)
            .await
            .expect("read");
        String::from_utf8(bytes).expect("utf8")
    }

    fn script() -> Vec<ScriptedResponse> {
        vec![
            ScriptedResponse::reply("(ISNN)", 10),
            ScriptedResponse::reply("(15000)", 10),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_last_sticks_at_final_response() {
        let mut transport = SimulatedTransport::new().with_script("close", script());
        transport.connect().await.expect("connect");
        transport.begin_sequence("close").await.expect("begin");
        assert_eq!(exchange(&mut transport, "(IBNP)").await, "(ISNN)");
        assert_eq!(exchange(&mut transport, "(IWRP)").await, "(15000)");
        assert_eq!(exchange(&mut transport, "(IWRP)").await, "(15000)");
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_wraps_and_sequence_start_resets() {
        let mut transport = SimulatedTransport::new()
            .with_script("close", script())
            .with_out_of_bounds(OutOfBounds::Cycle);
        transport.connect().await.expect("connect");
        transport.begin_sequence("close").await.expect("begin");
        exchange(&mut transport, "a").await;
        exchange(&mut transport, "b").await;
        assert_eq!(exchange(&mut transport, "c").await, "(ISNN)");

        transport.begin_sequence("close").await.expect("begin");
        assert_eq!(exchange(&mut transport, "d").await, "(ISNN)");
        assert_eq!(transport.journal().sent(), ["a", "b", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_trigger_falls_back_to_default_script() {
        let mut transport = SimulatedTransport::new()
            .with_script(DEFAULT_SCRIPT, vec![ScriptedResponse::reply("(RST1)", 5)]);
        transport.connect().await.expect("connect");
        transport.begin_sequence("health").await.expect("begin");
        assert_eq!(exchange(&mut transport, "(RST0)").await, "(RST1)");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_or_late_responses_consume_the_window() {
        let mut transport = SimulatedTransport::new().with_script(
            "close",
            vec![ScriptedResponse::silent(), ScriptedResponse::reply("(ISNN)", 5_000)],
        );
        transport.connect().await.expect("connect");
        transport.begin_sequence("close").await.expect("begin");
        let started = tokio::time::Instant::now();
        assert_eq!(exchange(&mut transport, "(IBNP)").await, "");
        assert_eq!(exchange(&mut transport, "(IBNP)").await, "");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_millis(4_100));
    }

    #[tokio::test]
    async fn writes_require_connection() {
        let mut transport = SimulatedTransport::new();
        let err = transport
            .write("(IBNP)", Duration::from_secs(1), &CancellationToken::new())
            .await
            .expect_err("disconnected");
        assert!(matches!(err, TransportError::NotConnected));
    }
}
