use protocol::config::ExecutorConfig;
use protocol::proxy::PortInfo;
use protocol::{CommandStep, ExecutionOutcome, SequenceStatus};
use serial_link::matcher::{MatchMode, Matched, TokenBuffer};
use serial_link::{sleep_or_cancel, Transport, TransportError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts for ordinary commands, the first send included.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    /// Pause after a command that expects no reply.
    pub no_response_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for RetryPolicy {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_backoff: config.retry_backoff,
            no_response_grace: config.no_response_grace,
        }
    }
}

/// Observation points emitted while a sequence runs. `index` is one-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Send {
        index: usize,
        total: usize,
        command: String,
    },
    Receive {
        index: usize,
        total: usize,
        received: Option<String>,
    },
}

pub type ProgressTx = mpsc::UnboundedSender<ProgressEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The link itself failed: connect, write or read.
    Transport,
    /// The device answered wrongly or not at all.
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub kind: FailureKind,
    /// One-based step index; `None` when the failure happened before the first step.
    pub step: Option<usize>,
    pub detail: String,
}

/// Weight telemetry captured by a weight-read step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightReading {
    pub step: usize,
    pub grams: u32,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceReport {
    pub status: SequenceStatus,
    pub outcomes: Vec<ExecutionOutcome>,
    /// Readings in the order they arrived, kept even when a later step fails.
    pub weights: Vec<WeightReading>,
    pub failure: Option<StepFailure>,
}

impl SequenceReport {
    fn new() -> Self {
        Self {
            status: SequenceStatus::Completed,
            outcomes: Vec::new(),
            weights: Vec::new(),
            failure: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == SequenceStatus::Completed
    }

    pub fn error(&self) -> Option<&str> {
        self.failure.as_ref().map(|failure| failure.detail.as_str())
    }

    fn fail(mut self, kind: FailureKind, step: Option<usize>, detail: String) -> Self {
        self.status = SequenceStatus::Failed;
        self.failure = Some(StepFailure { kind, step, detail });
        self
    }

    fn cancelled(mut self) -> Self {
        self.status = SequenceStatus::Cancelled;
        self
    }
}

/// Result of one single-attempt exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub matched: Option<Matched>,
    /// What arrived, for diagnostics.
    pub received: String,
}

enum StepResult {
    Done(ExecutionOutcome),
    Failed(FailureKind, String),
    Cancelled,
}

/// Owns the transport for one device and drives every exchange with it.
pub struct SequenceExecutor {
    transport: Box<dyn Transport>,
    policy: RetryPolicy,
}

impl SequenceExecutor {
    pub fn new(transport: Box<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Connects on demand. A failed connect is reported, not retried.
    pub async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        if self.transport.is_connected() {
            return Ok(());
        }
        tracing::info!(event = "executor.connecting", transport = self.transport.name());
        self.transport.connect().await
    }

    /// Marks the start of a sequence that is not driven through [`SequenceExecutor::run`].
    pub async fn begin_sequence(&mut self, name: &str) -> Result<(), TransportError> {
        self.transport.begin_sequence(name).await
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
    }

    pub async fn ports(&mut self) -> Result<Vec<PortInfo>, TransportError> {
        self.transport.ports().await
    }

    pub async fn run(
        &mut self,
        trigger: &str,
        steps: &[CommandStep],
        progress: Option<&ProgressTx>,
        cancel: &CancellationToken,
    ) -> SequenceReport {
        let report = SequenceReport::new();
        if cancel.is_cancelled() {
            return report.cancelled();
        }
        if let Err(err) = self.transport.begin_sequence(trigger).await {
            return report.fail(FailureKind::Transport, None, err.to_string());
        }
        if let Err(err) = self.ensure_connected().await {
            tracing::warn!(event = "executor.connect_failed", trigger = %trigger, error = %err);
            return report.fail(FailureKind::Transport, None, err.to_string());
        }
        tracing::info!(event = "sequence.started", trigger = %trigger, steps = steps.len());

        let report = self.run_steps(steps, progress, cancel, report).await;
        match report.status {
            SequenceStatus::Completed => {
                tracing::info!(event = "sequence.completed", trigger = %trigger)
            }
            SequenceStatus::Cancelled => {
                tracing::info!(event = "sequence.cancelled", trigger = %trigger)
            }
            SequenceStatus::Failed => tracing::warn!(
                event = "sequence.failed",
                trigger = %trigger,
                error = report.error().unwrap_or_default(),
            ),
        }
        report
    }

    async fn run_steps(
        &mut self,
        steps: &[CommandStep],
        progress: Option<&ProgressTx>,
        cancel: &CancellationToken,
        mut report: SequenceReport,
    ) -> SequenceReport {
        let total = steps.len();
        for (offset, step) in steps.iter().enumerate() {
            let index = offset + 1;
            if cancel.is_cancelled() {
                return report.cancelled();
            }
            emit(
                progress,
                ProgressEvent::Send {
                    index,
                    total,
                    command: step.send.clone(),
                },
            );

            let result = if step.is_weight_read() {
                self.weight_step(step, index, total, progress, cancel, &mut report)
                    .await
            } else if step.expected().is_none() {
                self.unanswered_step(step, index, total, progress, cancel)
                    .await
            } else {
                self.answered_step(step, index, total, progress, cancel).await
            };

            match result {
                StepResult::Done(outcome) => report.outcomes.push(outcome),
                StepResult::Failed(kind, detail) => {
                    report.outcomes.push(ExecutionOutcome::failed(None, detail.clone()));
                    return report.fail(kind, Some(index), detail);
                }
                StepResult::Cancelled => return report.cancelled(),
            }
        }
        report
    }

    async fn weight_step(
        &mut self,
        step: &CommandStep,
        index: usize,
        total: usize,
        progress: Option<&ProgressTx>,
        cancel: &CancellationToken,
        report: &mut SequenceReport,
    ) -> StepResult {
        let attempt = self
            .attempt(&step.send, MatchMode::Weight, step.duration(), cancel)
            .await;
        let exchange = match attempt {
            Ok(exchange) => exchange,
            Err(err) => return transport_failure(err, index, total),
        };
        emit_received(progress, index, total, &exchange);
        match exchange.matched {
            Some(Matched::Weight { token, grams }) => {
                tracing::info!(event = "sequence.weight", step = index, grams);
                report.weights.push(WeightReading {
                    step: index,
                    grams,
                    token: token.clone(),
                });
                StepResult::Done(ExecutionOutcome::matched(token))
            }
            _ => StepResult::Failed(
                FailureKind::Protocol,
                format!(
                    "[{index}/{total}] expected weight reading, received {}",
                    exchange.received
                ),
            ),
        }
    }

    async fn unanswered_step(
        &mut self,
        step: &CommandStep,
        index: usize,
        total: usize,
        progress: Option<&ProgressTx>,
        cancel: &CancellationToken,
    ) -> StepResult {
        let grace = self.policy.no_response_grace;
        let sent = self.transport.send_only(&step.send, grace, cancel).await;
        if let Err(err) = sent {
            return transport_failure(err, index, total);
        }
        if sleep_or_cancel(grace, cancel).await.is_err() {
            return StepResult::Cancelled;
        }
        emit(
            progress,
            ProgressEvent::Receive {
                index,
                total,
                received: None,
            },
        );
        StepResult::Done(ExecutionOutcome::sent())
    }

    async fn answered_step(
        &mut self,
        step: &CommandStep,
        index: usize,
        total: usize,
        progress: Option<&ProgressTx>,
        cancel: &CancellationToken,
    ) -> StepResult {
        let expected = step.expected().unwrap_or_default();
        let attempts = self.policy.max_attempts;
        let mut last_received = String::new();
        for attempt in 1..=attempts {
            if attempt > 1 {
                tracing::debug!(event = "sequence.retry", step = index, attempt, command = %step.send);
                if sleep_or_cancel(self.policy.retry_backoff, cancel).await.is_err() {
                    return StepResult::Cancelled;
                }
            }
            let exchange = match self
                .attempt(&step.send, MatchMode::Exact(expected), step.duration(), cancel)
                .await
            {
                Ok(exchange) => exchange,
                Err(err) => return transport_failure(err, index, total),
            };
            emit_received(progress, index, total, &exchange);
            if let Some(matched) = exchange.matched {
                return StepResult::Done(ExecutionOutcome::matched(matched.token()));
            }
            last_received = exchange.received;
        }
        StepResult::Failed(
            FailureKind::Protocol,
            format!(
                "[{index}/{total}] expected {expected}, received {last_received}, {attempts} attempts"
            ),
        )
    }

    /// One send followed by one wait of at most `window`, no retry.
    pub async fn exchange(
        &mut self,
        command: &str,
        mode: MatchMode<'_>,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Exchange, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.ensure_connected().await?;
        self.attempt(command, mode, window, cancel).await
    }

    async fn attempt(
        &mut self,
        command: &str,
        mode: MatchMode<'_>,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Exchange, TransportError> {
        self.transport.write(command, window, cancel).await?;
        let deadline = Instant::now() + window;
        let mut buffer = TokenBuffer::default();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let chunk = self.transport.read_available(remaining, cancel).await?;
            if chunk.is_empty() {
                break;
            }
            buffer.push(&chunk);
            if let Some(matched) = buffer.find(mode) {
                return Ok(Exchange {
                    matched: Some(matched),
                    received: buffer.diagnostic(),
                });
            }
        }
        Ok(Exchange {
            matched: None,
            received: buffer.diagnostic(),
        })
    }
}

fn transport_failure(err: TransportError, index: usize, total: usize) -> StepResult {
    if err.is_cancelled() {
        return StepResult::Cancelled;
    }
    StepResult::Failed(FailureKind::Transport, format!("[{index}/{total}] {err}"))
}

fn emit(progress: Option<&ProgressTx>, event: ProgressEvent) {
    if let Some(tx) = progress {
        let _ = tx.send(event);
    }
}

fn emit_received(progress: Option<&ProgressTx>, index: usize, total: usize, exchange: &Exchange) {
    let received = match &exchange.matched {
        Some(matched) => matched.token().to_string(),
        None => exchange.received.clone(),
    };
    emit(
        progress,
        ProgressEvent::Receive {
            index,
            total,
            received: Some(received),
        },
    );
}
