use protocol::proxy::SendResponse;
use serial_link::matcher::TokenBuffer;
use serial_link::{sleep_or_cancel, Transport, TransportError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) const ATTEMPT_PAUSE: Duration = Duration::from_secs(1);
/// Once a token arrived, this much silence ends the listening window early.
pub(crate) const QUIET_AFTER_TOKEN: Duration = Duration::from_millis(500);

/// Writes `command` and collects bracket tokens, retrying silent attempts.
pub(crate) async fn relay(
    link: &mut dyn Transport,
    command: &str,
    window: Duration,
    max_retries: u32,
    cancel: &CancellationToken,
) -> Result<SendResponse, TransportError> {
    let attempts = max_retries.max(1);
    for attempt in 1..=attempts {
        if attempt > 1 {
            sleep_or_cancel(ATTEMPT_PAUSE, cancel).await?;
        }
        link.write(command, window, cancel).await?;
        let tokens = collect(link, window, cancel).await?;
        if !tokens.is_empty() {
            tracing::info!(
                event = "proxy.received",
                command = %command,
                attempt,
                tokens = %tokens.join(", "),
            );
            return Ok(SendResponse::received(tokens));
        }
        tracing::warn!(event = "proxy.silent", command = %command, attempt, attempts);
    }
    Ok(SendResponse::no_response(
        Vec::new(),
        format!("no response to {command} after {attempts} attempts"),
    ))
}

async fn collect(
    link: &mut dyn Transport,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<String>, TransportError> {
    let deadline = Instant::now() + window;
    let mut buffer = TokenBuffer::default();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let heard = !buffer.tokens().is_empty();
        let wait = if heard {
            remaining.min(QUIET_AFTER_TOKEN)
        } else {
            remaining
        };
        let chunk = link.read_available(wait, cancel).await?;
        if chunk.is_empty() {
            if heard {
                break;
            }
            continue;
        }
        buffer.push(&chunk);
    }
    Ok(buffer.tokens().to_vec())
}
