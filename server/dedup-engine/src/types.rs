//! Core types for the dedup engine (JSON contracts + ledger models).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Inbound types (JSON contract: what the caller sends)
// ---------------------------------------------------------------------------

/// One inbound error occurrence. Unknown fields are silently ignored.
///
/// Legacy producer field names (`service`,
/// `exception_type`, `message`, `timestamp`) are accepted as aliases.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundEvent {
  #[serde(default, alias = "service")]
  pub source_service: String,
  #[serde(default, alias = "exception_type")]
  pub error_type: String,
  #[serde(default, alias = "message")]
  pub error_message: String,
  /// RFC3339; defaults to receipt time when absent.
  #[serde(default, alias = "timestamp")]
  pub occurred_at: Option<String>,
}

impl InboundEvent {
  pub fn new(service: &str, error_type: &str, message: &str) -> Self {
    Self {
      source_service: service.into(),
      error_type: error_type.into(),
      error_message: message.into(),
      occurred_at: None,
    }
  }

  pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
    self.occurred_at = Some(occurred_at.to_rfc3339());
    self
  }
}

// ---------------------------------------------------------------------------
// Internal normalized types
// ---------------------------------------------------------------------------

/// Canonical internal event after validation + canonicalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
  pub source_service: String,
  pub error_type: String,
  /// Canonicalized message (the form that is fingerprinted and stored).
  pub error_message: String,
  /// Declared event time; all burst decisions compare against this.
  pub occurred_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// A stable hex string identifying one logical error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ---------------------------------------------------------------------------
// Ledger record
// ---------------------------------------------------------------------------

/// The one summarized record kept per fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
  pub fingerprint: Fingerprint,
  pub source_service: String,
  pub error_type: String,
  pub error_message: String,
  pub first_seen_at: DateTime<Utc>,
  pub last_seen_at: DateTime<Utc>,
  pub occurrence_count: u64,
  pub muted_until: Option<DateTime<Utc>>,
  pub escalation_sent: bool,
  pub escalation_sent_at: Option<DateTime<Utc>>,
  /// Declared time of the first event of the current burst.
  pub burst_started_at: DateTime<Utc>,
  /// Occurrences in the current burst (the first one was allowed).
  pub burst_count: u64,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
  /// Forward the alert.
  Allow,
  /// Drop the alert; the burst is being suppressed.
  Mute,
}

/// Which transition rule an observation went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstKind {
  /// No record existed.
  First,
  /// Gap since last_seen_at exceeded the quiet window.
  NewBurst,
  /// Gap within the quiet window.
  SameBurst,
  /// Event dated implausibly far before last_seen_at; handled as a fresh burst.
  ClockAnomaly,
}

impl BurstKind {
  pub fn verdict(self) -> Verdict {
    match self {
      Self::SameBurst => Verdict::Mute,
      Self::First | Self::NewBurst | Self::ClockAnomaly => Verdict::Allow,
    }
  }
}

/// Result of one atomic `Ledger::observe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
  /// Record as committed.
  pub record: ErrorRecord,
  pub verdict: Verdict,
  pub kind: BurstKind,
  /// Escalation committed for the previous mute cycle when this event reset
  /// a cycle that was muted but never escalated.
  pub closed_burst: Option<EscalationTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
  FirstOccurrence,
  NewBurst,
  SameBurst,
  ClockAnomaly,
  StoreUnavailable,
}

impl From<BurstKind> for DecisionReason {
  fn from(kind: BurstKind) -> Self {
    match kind {
      BurstKind::First => Self::FirstOccurrence,
      BurstKind::NewBurst => Self::NewBurst,
      BurstKind::SameBurst => Self::SameBurst,
      BurstKind::ClockAnomaly => Self::ClockAnomaly,
    }
  }
}

/// What the caller gets back for one inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
  pub fingerprint: Fingerprint,
  pub verdict: Verdict,
  pub reason: DecisionReason,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub occurrence_count: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub muted_until: Option<DateTime<Utc>>,
  /// True when the ledger was unreachable and the verdict is the fail-open default.
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub degraded: bool,
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

/// A committed, one-time escalation for a muted burst.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationTask {
  pub fingerprint: Fingerprint,
  pub source_service: String,
  pub error_type: String,
  pub error_message: String,
  pub occurrence_count: u64,
  pub first_seen_at: DateTime<Utc>,
  pub last_seen_at: DateTime<Utc>,
  pub mute_window_end: DateTime<Utc>,
  pub burst_started_at: DateTime<Utc>,
  pub burst_count: u64,
}

impl EscalationTask {
  /// Snapshot a muted record. Returns `None` if the record has no mute cycle.
  pub fn from_record(record: &ErrorRecord) -> Option<Self> {
    let mute_window_end = record.muted_until?;
    Some(Self {
      fingerprint: record.fingerprint.clone(),
      source_service: record.source_service.clone(),
      error_type: record.error_type.clone(),
      error_message: record.error_message.clone(),
      occurrence_count: record.occurrence_count,
      first_seen_at: record.first_seen_at,
      last_seen_at: record.last_seen_at,
      mute_window_end,
      burst_started_at: record.burst_started_at,
      burst_count: record.burst_count,
    })
  }
}

// ---------------------------------------------------------------------------
// CLI stream wrappers
// ---------------------------------------------------------------------------

/// Structured error output for invalid input lines.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
  pub error: bool,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub field: Option<String>,
}

impl ErrorOutput {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      error: true,
      message: message.into(),
      field: None,
    }
  }

  pub fn with_field(mut self, field: impl Into<String>) -> Self {
    self.field = Some(field.into());
    self
  }
}
