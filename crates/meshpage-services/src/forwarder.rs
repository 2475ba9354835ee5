//! Paging forwarder — turns mesh text messages into pager calls.
//!
//! Each message is escaped, prefixed with the sender's name, and delivered
//! to the paging gateway with bounded exponential backoff:
//!
//!   wait(attempt) = retry_delay * 2^attempt      (attempt starts at 0)
//!
//! After `max_attempts` failures the message is dropped. The forwarder only
//! ever holds the directory lock for the name lookup, never across a
//! network call or a backoff sleep.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::directory::NodeDirectory;
use crate::gateway::{GatewayError, PagingGateway, PagingRequest};

/// Characters the paging gateway treats as markup.
const ESCAPE_SET: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Prefix every escape-set character with a single backslash.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    for c in text.chars() {
        if ESCAPE_SET.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Build the final pager text: literal sender prefix + escaped body.
pub fn compose_message(body: &str, sender_label: &str, display_name: Option<&str>) -> String {
    let prefix = match display_name {
        Some(name) => format!("*{name} ({sender_label})*:"),
        None => format!("*{sender_label}*:"),
    };
    prefix + &escape_text(body)
}

/// A text message waiting to be paged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub text: String,
    pub sender_label: String,
}

/// Static delivery settings.
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub callsign: String,
    pub transmitter_group: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

/// Successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("delivery failed after {attempts} attempts: {last_error}")]
    DeliveryFailed {
        attempts: u32,
        last_error: GatewayError,
    },
    #[error("shutdown requested after {attempts} attempts")]
    ShutdownRequested { attempts: u32 },
}

pub struct PagingForwarder {
    gateway: Arc<dyn PagingGateway>,
    directory: NodeDirectory,
    settings: ForwarderSettings,
}

impl PagingForwarder {
    pub fn new(
        gateway: Arc<dyn PagingGateway>,
        directory: NodeDirectory,
        settings: ForwarderSettings,
    ) -> Self {
        Self {
            gateway,
            directory,
            settings,
        }
    }

    /// Backoff before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.settings
            .retry_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }

    /// Build the gateway request for a message.
    pub async fn build_request(&self, text: &str, sender_label: &str) -> PagingRequest {
        let display_name = match self.directory.display_name_async(sender_label.to_string()).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(sender = sender_label, error = %e, "display name lookup failed");
                None
            }
        };
        PagingRequest {
            text: compose_message(text, sender_label, display_name.as_deref()),
            call_sign_names: vec![self.settings.callsign.clone()],
            transmitter_group_names: vec![self.settings.transmitter_group.clone()],
            emergency: false,
        }
    }

    /// Deliver one message, retrying with backoff.
    ///
    /// A shutdown signal aborts a pending backoff wait immediately; an
    /// attempt already in flight is allowed to finish.
    pub async fn forward(
        &self,
        text: &str,
        sender_label: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<ForwardOutcome, ForwardError> {
        let request = self.build_request(text, sender_label).await;
        let max = self.settings.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max {
            tracing::info!(
                attempt = attempt + 1,
                max,
                sender = sender_label,
                text = %truncate(text, 50),
                "sending page"
            );

            match self.gateway.deliver(&request).await {
                Ok(()) => {
                    tracing::info!(attempts = attempt + 1, "page delivered");
                    return Ok(ForwardOutcome {
                        attempts: attempt + 1,
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "page delivery failed");
                    last_error = Some(e);
                }
            }

            if attempt + 1 < max {
                let wait = self.backoff(attempt);
                tracing::info!(wait_secs = wait.as_secs_f64(), "retrying page");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.recv() => {
                        tracing::info!(attempts = attempt + 1, "page retry aborted by shutdown");
                        return Err(ForwardError::ShutdownRequested { attempts: attempt + 1 });
                    }
                }
            }
        }

        let last_error = last_error.unwrap_or(GatewayError::Request("no attempt made".into()));
        tracing::error!(attempts = max, error = %last_error, "page dropped after exhausting retries");
        Err(ForwardError::DeliveryFailed {
            attempts: max,
            last_error,
        })
    }
}

/// Char-boundary-safe truncation for log lines.
pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
