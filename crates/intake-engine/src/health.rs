use crate::executor::SequenceExecutor;
use protocol::config::HealthConfig;
use protocol::equipment::{DeviceStatus, EquipmentState};
use serial_link::matcher::{MatchMode, Matched};
use serial_link::TransportError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const HEALTH_CHECK_ACTION: &str = "health_check";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The unit did not answer the liveness probe as expected.
    Unresponsive(String),
    /// Liveness passed but the temperature reply was missing or unreadable.
    BadTemperature(String),
    Temperature(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub status: DeviceStatus,
    pub temperature: Option<i32>,
    /// Why the unit was classified as faulty.
    pub reason: Option<String>,
    pub snapshot: EquipmentState,
}

#[derive(Debug, Clone)]
pub struct HealthProbe {
    liveness_command: String,
    liveness_expect: String,
    temperature_command: String,
    timeout: Duration,
    collection_threshold_kg: f64,
}

impl HealthProbe {
    pub fn new(config: &HealthConfig, collection_threshold_kg: f64) -> Self {
        Self {
            liveness_command: config.liveness_command.clone(),
            liveness_expect: config.liveness_expect.clone(),
            temperature_command: config.temperature_command.clone(),
            timeout: config.timeout,
            collection_threshold_kg,
        }
    }

    /// Sends the liveness probe and, only if it passes, the temperature probe. Each is a
    /// single attempt. The only error is cancellation; every other problem is a probe result.
    pub async fn probe(
        &self,
        executor: &mut SequenceExecutor,
        cancel: &CancellationToken,
    ) -> Result<ProbeResult, TransportError> {
        match executor.begin_sequence(HEALTH_CHECK_ACTION).await {
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => return Ok(ProbeResult::Unresponsive(err.to_string())),
            Ok(()) => {}
        }
        let liveness = executor
            .exchange(
                &self.liveness_command,
                MatchMode::Exact(&self.liveness_expect),
                self.timeout,
                cancel,
            )
            .await;
        match liveness {
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                return Ok(ProbeResult::Unresponsive(format!(
                    "{}: {err}",
                    self.liveness_command
                )))
            }
            Ok(exchange) if exchange.matched.is_none() => {
                return Ok(ProbeResult::Unresponsive(format!(
                    "{}: expected {}, received {}",
                    self.liveness_command, self.liveness_expect, exchange.received
                )))
            }
            Ok(_) => {}
        }

        let temperature = executor
            .exchange(
                &self.temperature_command,
                MatchMode::Temperature,
                self.timeout,
                cancel,
            )
            .await;
        Ok(match temperature {
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => ProbeResult::BadTemperature(format!("{}: {err}", self.temperature_command)),
            Ok(exchange) => match exchange.matched {
                Some(Matched::Temperature { celsius, .. }) => ProbeResult::Temperature(celsius),
                _ => ProbeResult::BadTemperature(format!(
                    "{}: expected T+NN, received {}",
                    self.temperature_command, exchange.received
                )),
            },
        })
    }

    /// Folds a probe result with the current bucket fill into the next snapshot.
    pub fn classify(&self, result: &ProbeResult, current: &EquipmentState) -> HealthReport {
        let (status, temperature, reason) = match result {
            ProbeResult::Unresponsive(reason) | ProbeResult::BadTemperature(reason) => {
                (DeviceStatus::Fault, None, Some(reason.clone()))
            }
            ProbeResult::Temperature(celsius) => {
                let full = current
                    .weights()
                    .iter()
                    .all(|kg| *kg >= self.collection_threshold_kg);
                let status = if full {
                    DeviceStatus::NeedsCollection
                } else {
                    DeviceStatus::Normal
                };
                (status, Some(*celsius), None)
            }
        };

        let response = match (&reason, temperature) {
            (Some(reason), _) => reason.clone(),
            (None, Some(celsius)) => format!("{status} at {celsius:+} C"),
            (None, None) => status.to_string(),
        };
        let mut snapshot = current.next_snapshot(HEALTH_CHECK_ACTION, response);
        snapshot.device_status = status;
        if let Some(celsius) = temperature {
            snapshot.temperature = f64::from(celsius);
        }
        HealthReport {
            status,
            temperature,
            reason,
            snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RetryPolicy;
    use protocol::config::ScriptedResponse;
    use serial_link::SimulatedTransport;

    fn probe() -> HealthProbe {
        HealthProbe::new(&HealthConfig::default(), 15.0)
    }

    fn executor(script: Vec<ScriptedResponse>) -> (SequenceExecutor, serial_link::SentJournal) {
        let transport = SimulatedTransport::new().with_script("default", script);
        let journal = transport.journal();
        (
            SequenceExecutor::new(Box::new(transport), RetryPolicy::default()),
            journal,
        )
    }

    fn state(weights: [f64; 4]) -> EquipmentState {
        let mut state = EquipmentState::empty("R1", 99.0, DeviceStatus::Normal);
        state.bucket1 = weights[0];
        state.bucket2 = weights[1];
        state.bucket3 = weights[2];
        state.bucket4 = weights[3];
        state
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_unit_reports_temperature() {
        let (mut executor, journal) = executor(vec![
            ScriptedResponse::reply("(RST1)", 10),
            ScriptedResponse::reply("(T+04)", 10),
        ]);
        let result = probe()
            .probe(&mut executor, &CancellationToken::new())
            .await
            .expect("probe");
        assert_eq!(result, ProbeResult::Temperature(4));
        assert_eq!(journal.sent(), ["(RST0)", "(STRP)"]);

        let report = probe().classify(&result, &state([14.0, 16.0, 15.0, 2.0]));
        assert_eq!(report.status, DeviceStatus::Normal);
        assert_eq!(report.snapshot.temperature, 4.0);
        assert_eq!(
            report.snapshot.last_action_name.as_deref(),
            Some(HEALTH_CHECK_ACTION)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_liveness_skips_temperature_probe() {
        let (mut executor, journal) = executor(vec![ScriptedResponse::silent()]);
        let result = probe()
            .probe(&mut executor, &CancellationToken::new())
            .await
            .expect("probe");
        assert_eq!(
            result,
            ProbeResult::Unresponsive("(RST0): expected (RST1), received (no response)".to_string())
        );
        assert_eq!(journal.sent(), ["(RST0)"]);

        let report = probe().classify(&result, &state([0.0; 4]));
        assert_eq!(report.status, DeviceStatus::Fault);
        assert_eq!(report.snapshot.temperature, 99.0);
        assert_eq!(
            report.snapshot.last_action_response.as_deref(),
            report.reason.as_deref()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_temperature_is_a_fault() {
        let (mut executor, _journal) = executor(vec![
            ScriptedResponse::reply("(RST1)", 10),
            ScriptedResponse::reply("(TEMP)", 10),
        ]);
        let result = probe()
            .probe(&mut executor, &CancellationToken::new())
            .await
            .expect("probe");
        assert_eq!(
            result,
            ProbeResult::BadTemperature("(STRP): expected T+NN, received (TEMP)".to_string())
        );
        assert_eq!(probe().classify(&result, &state([0.0; 4])).status, DeviceStatus::Fault);
    }

    #[test]
    fn every_bucket_at_threshold_needs_collection() {
        let result = ProbeResult::Temperature(-3);
        assert_eq!(
            probe().classify(&result, &state([15.0, 15.0, 15.2, 16.0])).status,
            DeviceStatus::NeedsCollection
        );
        assert_eq!(
            probe().classify(&result, &state([15.0, 15.0, 14.9, 16.0])).status,
            DeviceStatus::Normal
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_a_fault() {
        let (mut executor, _journal) = executor(vec![ScriptedResponse::silent()]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = probe().probe(&mut executor, &cancel).await.expect_err("cancelled");
        assert!(err.is_cancelled());
    }
}
