//! Escalation notifier: compose a bounded summary and hand it to a delivery channel.
//!
//! Delivery happens strictly after the escalation flag is committed. A failed
//! delivery is reported, never retried, and never un-commits the flag.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::types::EscalationTask;

/// Longest message excerpt carried in a summary.
pub const MAX_MESSAGE_CHARS: usize = 280;

/// One-time summary of a muted burst.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationSummary {
  pub fingerprint: String,
  pub headline: String,
  pub source_service: String,
  pub error_type: String,
  pub error_message: String,
  pub occurrence_count: u64,
  /// Occurrences muted during the burst (all but the first, which was forwarded).
  pub suppressed_count: u64,
  pub first_seen_at: DateTime<Utc>,
  pub last_seen_at: DateTime<Utc>,
  pub burst_started_at: DateTime<Utc>,
  pub mute_window_end: DateTime<Utc>,
  /// From the start of the burst to the end of its mute window.
  pub suppressed_for_secs: i64,
}

impl EscalationSummary {
  pub fn compose(task: &EscalationTask) -> Self {
    let suppressed_count = task.burst_count.saturating_sub(1);
    let suppressed_for = (task.mute_window_end - task.burst_started_at).max(Duration::zero());
    let headline = format!(
      "{} in {}: {} occurrence(s) suppressed over {} ({} total since {})",
      task.error_type,
      task.source_service,
      suppressed_count,
      human_duration(suppressed_for),
      task.occurrence_count,
      task.first_seen_at.format("%Y-%m-%dT%H:%MZ"),
    );

    Self {
      fingerprint: task.fingerprint.0.clone(),
      headline,
      source_service: task.source_service.clone(),
      error_type: task.error_type.clone(),
      error_message: truncate_chars(&task.error_message, MAX_MESSAGE_CHARS),
      occurrence_count: task.occurrence_count,
      suppressed_count,
      first_seen_at: task.first_seen_at,
      last_seen_at: task.last_seen_at,
      burst_started_at: task.burst_started_at,
      mute_window_end: task.mute_window_end,
      suppressed_for_secs: suppressed_for.num_seconds(),
    }
  }
}

/// External delivery channel for escalation summaries.
#[async_trait]
pub trait Notifier: Send + Sync {
  async fn deliver(&self, summary: &EscalationSummary) -> Result<()>;
}

/// Writes summaries to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
  async fn deliver(&self, summary: &EscalationSummary) -> Result<()> {
    tracing::info!(
      fingerprint = %summary.fingerprint,
      service = %summary.source_service,
      occurrences = summary.occurrence_count,
      suppressed = summary.suppressed_count,
      "escalation: {}",
      summary.headline
    );
    Ok(())
  }
}

/// Hands summaries to a bounded queue drained by a delivery task.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  tx: mpsc::Sender<EscalationSummary>,
}

impl ChannelNotifier {
  pub fn new(tx: mpsc::Sender<EscalationSummary>) -> Self {
    Self { tx }
  }

  pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EscalationSummary>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Self::new(tx), rx)
  }
}

#[async_trait]
impl Notifier for ChannelNotifier {
  async fn deliver(&self, summary: &EscalationSummary) -> Result<()> {
    self
      .tx
      .send(summary.clone())
      .await
      .map_err(|_| EngineError::notifier("delivery channel closed"))
  }
}

fn truncate_chars(s: &str, max: usize) -> String {
  match s.char_indices().nth(max) {
    Some((cut, _)) => format!("{}…", &s[..cut]),
    None => s.to_string(),
  }
}

fn human_duration(d: Duration) -> String {
  let secs = d.num_seconds();
  if secs >= 3600 {
    format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
  } else if secs >= 60 {
    format!("{}m", secs / 60)
  } else {
    format!("{}s", secs)
  }
}
