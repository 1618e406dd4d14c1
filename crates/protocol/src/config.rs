use crate::equipment::DeviceStatus;
use crate::Trigger;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_PROXY_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone, Deserialize)]
pub struct KioskConfig {
    pub robot_code: String,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub missing_state: MissingStateConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

impl KioskConfig {
    pub fn trigger(&self, name: &str) -> Option<&Trigger> {
        self.triggers.iter().find(|trigger| trigger.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportBackend {
    Direct,
    Remote,
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub backend: TransportBackend,
    /// Serial device for the direct backend, or the port the proxy should open.
    #[serde(default)]
    pub port_name: Option<String>,
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    /// Attempts the proxy makes per request; the executor retries on top of this.
    #[serde(default = "default_proxy_max_retries")]
    pub proxy_max_retries: u32,
    /// Added to the response window to form the HTTP request deadline.
    #[serde(default = "default_request_margin", deserialize_with = "deserialize_duration")]
    pub request_margin: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: TransportBackend::default(),
            port_name: None,
            proxy_url: default_proxy_url(),
            proxy_max_retries: default_proxy_max_retries(),
            request_margin: default_request_margin(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff", deserialize_with = "deserialize_duration")]
    pub retry_backoff: Duration,
    #[serde(default = "default_no_response_grace", deserialize_with = "deserialize_duration")]
    pub no_response_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff: default_retry_backoff(),
            no_response_grace: default_no_response_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    /// A bucket whose weight goes above this hands over to the next bucket.
    #[serde(default = "default_switch_threshold_kg")]
    pub switch_threshold_kg: f64,
    /// Health checks report collection needed once every bucket reaches this.
    #[serde(default = "default_collection_threshold_kg")]
    pub collection_threshold_kg: f64,
    #[serde(default = "default_daily_cap_kg")]
    pub daily_cap_kg: f64,
    #[serde(default = "default_kg_per_point")]
    pub kg_per_point: f64,
    #[serde(default = "default_input_type")]
    pub input_type: String,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            switch_threshold_kg: default_switch_threshold_kg(),
            collection_threshold_kg: default_collection_threshold_kg(),
            daily_cap_kg: default_daily_cap_kg(),
            kg_per_point: default_kg_per_point(),
            input_type: default_input_type(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_liveness_command")]
    pub liveness_command: String,
    #[serde(default = "default_liveness_expect")]
    pub liveness_expect: String,
    #[serde(default = "default_temperature_command")]
    pub temperature_command: String,
    #[serde(default = "default_health_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            liveness_command: default_liveness_command(),
            liveness_expect: default_liveness_expect(),
            temperature_command: default_temperature_command(),
            timeout: default_health_timeout(),
        }
    }
}

/// Values used when a robot has no recorded snapshot yet.
#[derive(Debug, Clone, Deserialize)]
pub struct MissingStateConfig {
    #[serde(default = "default_missing_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub device_status: DeviceStatus,
}

impl Default for MissingStateConfig {
    fn default() -> Self {
        Self {
            temperature: default_missing_temperature(),
            device_status: DeviceStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutOfBounds {
    #[default]
    RepeatLast,
    Cycle,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ScriptedResponse {
    #[serde(default)]
    pub receive: String,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    /// `false` makes the simulator stay silent for the whole response window.
    #[serde(default = "default_true")]
    pub succeed: bool,
}

impl ScriptedResponse {
    pub fn reply(receive: impl Into<String>, delay_ms: u64) -> Self {
        Self {
            receive: receive.into(),
            delay_ms: Some(delay_ms),
            succeed: true,
        }
    }

    pub fn silent() -> Self {
        Self {
            receive: String::new(),
            delay_ms: None,
            succeed: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub out_of_bounds: OutOfBounds,
    #[serde(default = "default_simulator_delay", deserialize_with = "deserialize_duration")]
    pub default_delay: Duration,
    /// Responses keyed by trigger name; `default` answers triggers without their own script.
    #[serde(default)]
    pub scripts: BTreeMap<String, Vec<ScriptedResponse>>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            out_of_bounds: OutOfBounds::default(),
            default_delay: default_simulator_delay(),
            scripts: BTreeMap::new(),
        }
    }
}

/// Accepts humantime strings (`"1s"`, `"250ms"`) or a bare number of seconds.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(f64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom),
        Raw::Seconds(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
        Raw::Seconds(secs) => Err(serde::de::Error::custom(format!("invalid duration {secs}"))),
    }
}

fn default_true() -> bool {
    true
}

fn default_proxy_url() -> String {
    DEFAULT_PROXY_URL.to_string()
}

fn default_proxy_max_retries() -> u32 {
    1
}

fn default_request_margin() -> Duration {
    Duration::from_secs(5)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_no_response_grace() -> Duration {
    Duration::from_millis(100)
}

fn default_switch_threshold_kg() -> f64 {
    13.0
}

fn default_collection_threshold_kg() -> f64 {
    15.0
}

fn default_daily_cap_kg() -> f64 {
    2.0
}

fn default_kg_per_point() -> f64 {
    0.1
}

fn default_input_type() -> String {
    "coffee_bean".to_string()
}

fn default_liveness_command() -> String {
    "(RST0)".to_string()
}

fn default_liveness_expect() -> String {
    "(RST1)".to_string()
}

fn default_temperature_command() -> String {
    "(STRP)".to_string()
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_missing_temperature() -> f64 {
    99.0
}

fn default_simulator_delay() -> Duration {
    Duration::from_millis(500)
}
