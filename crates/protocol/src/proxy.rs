use serde::{Deserialize, Serialize};

fn default_send_timeout() -> f64 {
    3.0
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendRequest {
    pub command: String,
    /// Seconds to listen for a reply per attempt.
    #[serde(default = "default_send_timeout")]
    pub timeout: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendResponse {
    pub success: bool,
    pub received_data: String,
    #[serde(default)]
    pub responses: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Set when `/cancel` interrupted the request, as opposed to the device staying silent.
    #[serde(default)]
    pub cancelled: bool,
}

impl SendResponse {
    pub fn received(responses: Vec<String>) -> Self {
        Self {
            success: true,
            received_data: responses.join(", "),
            responses,
            error: None,
            cancelled: false,
        }
    }

    pub fn no_response(responses: Vec<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            received_data: "(no response)".to_string(),
            responses,
            error: Some(error.into()),
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            success: false,
            received_data: String::new(),
            responses: Vec::new(),
            error: Some("cancelled".to_string()),
            cancelled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectRequest {
    pub port_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortInfo {
    pub device: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

impl Ack {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyStatus {
    pub connected: bool,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub baudrate: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub detail: String,
}
