use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod config;
pub mod equipment;
pub mod framing;
pub mod proxy;

/// Command that asks the unit for the weight of the last feed, in grams.
pub const WEIGHT_READ_COMMAND: &str = "IWRP";

/// Placeholder used by button configuration for "no response expected".
pub const NO_RESPONSE_PLACEHOLDER: &str = "-";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandStep {
    pub send: String,
    #[serde(default, alias = "receive")]
    pub expected_receive: Option<String>,
    #[serde(alias = "duration")]
    pub duration_secs: f64,
}

impl CommandStep {
    pub fn new(send: impl Into<String>, expected_receive: Option<&str>, duration_secs: f64) -> Self {
        Self {
            send: send.into(),
            expected_receive: expected_receive.map(str::to_string),
            duration_secs,
        }
    }

    /// Expected token, or `None` when the step is blank or the `-` placeholder.
    pub fn expected(&self) -> Option<&str> {
        self.expected_receive
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty() && *value != NO_RESPONSE_PLACEHOLDER)
    }

    pub fn is_weight_read(&self) -> bool {
        is_weight_read_command(&self.send)
    }

    pub fn duration(&self) -> Duration {
        if self.duration_secs.is_finite() && self.duration_secs > 0.0 {
            Duration::from_secs_f64(self.duration_secs)
        } else {
            Duration::ZERO
        }
    }
}

/// `IWRP` is accepted with or without surrounding brackets.
pub fn is_weight_read_command(command: &str) -> bool {
    framing::bracketed(command) == framing::bracketed(WEIGHT_READ_COMMAND)
}

/// A named, ordered command sequence as supplied by the button configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<CommandStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub received_token: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl ExecutionOutcome {
    pub fn matched(token: impl Into<String>) -> Self {
        Self {
            success: true,
            received_token: Some(token.into()),
            error_detail: None,
        }
    }

    pub fn sent() -> Self {
        Self {
            success: true,
            received_token: None,
            error_detail: None,
        }
    }

    pub fn failed(received: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            received_token: received,
            error_detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Completed,
    Failed,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_and_blank_mean_no_response() {
        assert_eq!(CommandStep::new("(IBNP)", Some("-"), 1.0).expected(), None);
        assert_eq!(CommandStep::new("(IBNP)", Some("  "), 1.0).expected(), None);
        assert_eq!(CommandStep::new("(IBNP)", None, 1.0).expected(), None);
        assert_eq!(
            CommandStep::new("(IBNP)", Some(" (ISNN) "), 1.0).expected(),
            Some("(ISNN)")
        );
    }

    #[test]
    fn weight_read_accepts_both_forms() {
        assert!(is_weight_read_command("IWRP"));
        assert!(is_weight_read_command("(IWRP)"));
        assert!(is_weight_read_command(" (IWRP) "));
        assert!(!is_weight_read_command("(IWRPX)"));
        assert!(!is_weight_read_command("(STRP)"));
    }

    #[test]
    fn step_accepts_configuration_field_names() {
        let json = r#"{"send":"(IBNP)","receive":"(ISNN)","duration":2}"#;
        let step: CommandStep = serde_json::from_str(json).expect("deserialize");
        assert_eq!(step, CommandStep::new("(IBNP)", Some("(ISNN)"), 2.0));
        assert_eq!(step.duration(), Duration::from_secs(2));
    }

    #[test]
    fn negative_duration_clamps_to_zero() {
        assert_eq!(CommandStep::new("(A)", None, -3.0).duration(), Duration::ZERO);
    }
}
