//! Core engine: validates events, asks the ledger for a verdict, fires escalations.
//!
//! The engine itself is stateless apart from counters; any number of
//! instances can share one ledger.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::fingerprint;
use crate::ledger::{self, Ledger, MemoryLedger};
use crate::normalize::{self, Canonicalizer};
use crate::notifier::{EscalationSummary, Notifier};
use crate::state;
use crate::types::*;

/// The dedup decision engine. Cheap to share behind an `Arc`.
pub struct Engine {
  config: Config,
  ledger: Arc<dyn Ledger>,
  notifier: Arc<dyn Notifier>,
  canonicalizer: Arc<dyn Canonicalizer>,
  clock: Arc<dyn Clock>,
  stats: EngineStats,
}

impl Engine {
  pub fn new(config: Config, ledger: Arc<dyn Ledger>, notifier: Arc<dyn Notifier>) -> Self {
    let canonicalizer = Arc::new(config.canonicalization.clone());
    Self {
      config,
      ledger,
      notifier,
      canonicalizer,
      clock: Arc::new(SystemClock),
      stats: EngineStats::default(),
    }
  }

  /// Engine over an in-process ledger (cached per the config).
  pub fn in_memory(config: Config, notifier: Arc<dyn Notifier>) -> Self {
    let ledger = ledger::layered(MemoryLedger::from_config(&config), &config);
    Self::new(config, ledger, notifier)
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_canonicalizer(mut self, canonicalizer: Arc<dyn Canonicalizer>) -> Self {
    self.canonicalizer = canonicalizer;
    self
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn ledger(&self) -> &Arc<dyn Ledger> {
    &self.ledger
  }

  pub fn stats(&self) -> EngineStatsSnapshot {
    self.stats.snapshot()
  }

  /// Decide ALLOW or MUTE for one inbound event.
  ///
  /// Only validation failures are returned as errors. A ledger failure yields
  /// a degraded ALLOW so that a real alert is never dropped on the floor.
  pub async fn process(&self, raw: &InboundEvent) -> Result<Decision> {
    let received_at = self.clock.now();
    let event = match normalize::normalize(raw, received_at, self.canonicalizer.as_ref()) {
      Ok(event) => event,
      Err(e) => {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        return Err(e);
      }
    };
    let fp = fingerprint::of_event(&event);

    if event.occurred_at - received_at > self.config.clock_skew_tolerance {
      tracing::warn!(
        fingerprint = %fp,
        occurred_at = %event.occurred_at,
        received_at = %received_at,
        "event dated ahead of the receipt clock"
      );
    }

    let observed = self.store_call("observe", self.ledger.observe(&fp, &event)).await;
    let obs = match observed {
      Ok(obs) => obs,
      Err(e) => return Ok(self.fail_open(fp, &e)),
    };

    match obs.verdict {
      Verdict::Allow => self.stats.allowed.fetch_add(1, Ordering::Relaxed),
      Verdict::Mute => self.stats.muted.fetch_add(1, Ordering::Relaxed),
    };
    if obs.kind == BurstKind::ClockAnomaly {
      self.stats.clock_anomalies.fetch_add(1, Ordering::Relaxed);
      tracing::warn!(
        fingerprint = %fp,
        occurred_at = %event.occurred_at,
        last_seen_at = %obs.record.last_seen_at,
        "event far older than last occurrence; treating as a fresh burst"
      );
    }
    tracing::debug!(
      fingerprint = %fp,
      verdict = ?obs.verdict,
      kind = ?obs.kind,
      count = obs.record.occurrence_count,
      "decision"
    );

    if let Some(task) = &obs.closed_burst {
      self.stats.escalations_committed.fetch_add(1, Ordering::Relaxed);
      self.dispatch(task).await;
    }
    if state::escalation_due(&obs.record, received_at) {
      self.escalate(&fp, received_at).await;
    }

    Ok(Decision {
      fingerprint: fp,
      verdict: obs.verdict,
      reason: obs.kind.into(),
      occurrence_count: Some(obs.record.occurrence_count),
      muted_until: obs.record.muted_until,
      degraded: false,
    })
  }

  /// Current ledger record for a fingerprint (served from the cache when fresh).
  pub async fn record(&self, fp: &Fingerprint) -> Result<Option<ErrorRecord>> {
    self
      .store_call("find_by_fingerprint", self.ledger.find_by_fingerprint(fp))
      .await
  }

  /// Escalate every due record as of the engine clock.
  pub async fn sweep(&self) -> Result<SweepReport> {
    self.sweep_at(self.clock.now()).await
  }

  /// Escalate records whose mute window elapsed by `now`, up to one batch.
  pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
    let due = self
      .store_call(
        "due_for_escalation",
        self.ledger.due_for_escalation(now, self.config.sweep_batch_size),
      )
      .await?;

    let mut report = SweepReport {
      scanned: due.len(),
      ..SweepReport::default()
    };
    for record in &due {
      match self.escalate(&record.fingerprint, now).await {
        EscalationOutcome::Delivered => report.escalated += 1,
        EscalationOutcome::DeliveryFailed => {
          report.escalated += 1;
          report.delivery_failures += 1;
        }
        EscalationOutcome::NotDue => report.raced += 1,
        EscalationOutcome::StoreError => report.store_errors += 1,
      }
    }

    if report.scanned > 0 {
      tracing::info!(
        scanned = report.scanned,
        escalated = report.escalated,
        raced = report.raced,
        store_errors = report.store_errors,
        delivery_failures = report.delivery_failures,
        "sweep finished"
      );
    }
    Ok(report)
  }

  /// Run the shared escalation transition for one fingerprint and deliver if it fired.
  async fn escalate(&self, fp: &Fingerprint, now: DateTime<Utc>) -> EscalationOutcome {
    let marked = self
      .store_call("mark_escalated", self.ledger.mark_escalated(fp, now))
      .await;
    let record = match marked {
      Ok(Some(record)) => record,
      Ok(None) => return EscalationOutcome::NotDue,
      Err(e) => {
        // Still due in the ledger; the next sweep picks it up.
        tracing::warn!(fingerprint = %fp, error = %e, "could not commit escalation");
        return EscalationOutcome::StoreError;
      }
    };
    self.stats.escalations_committed.fetch_add(1, Ordering::Relaxed);

    let Some(task) = EscalationTask::from_record(&record) else {
      return EscalationOutcome::DeliveryFailed;
    };
    if self.dispatch(&task).await {
      EscalationOutcome::Delivered
    } else {
      EscalationOutcome::DeliveryFailed
    }
  }

  /// Deliver a committed escalation. Failures are logged and counted, never retried.
  async fn dispatch(&self, task: &EscalationTask) -> bool {
    let summary = EscalationSummary::compose(task);
    let limit = self.config.notifier_timeout;
    let delivered = match tokio::time::timeout(limit, self.notifier.deliver(&summary)).await {
      Ok(result) => result,
      Err(_) => Err(EngineError::notifier(format!("delivery timed out after {:?}", limit))),
    };
    match delivered {
      Ok(()) => {
        self.stats.escalations_delivered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
          fingerprint = %task.fingerprint,
          service = %task.source_service,
          occurrences = task.occurrence_count,
          "escalation sent"
        );
        true
      }
      Err(e) => {
        self.stats.escalation_failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
          fingerprint = %task.fingerprint,
          error = %e,
          "escalation delivery failed; not retrying"
        );
        false
      }
    }
  }

  fn fail_open(&self, fp: Fingerprint, cause: &EngineError) -> Decision {
    self.stats.degraded.fetch_add(1, Ordering::Relaxed);
    tracing::warn!(fingerprint = %fp, error = %cause, "ledger unavailable; failing open");
    Decision {
      fingerprint: fp,
      verdict: Verdict::Allow,
      reason: DecisionReason::StoreUnavailable,
      occurrence_count: None,
      muted_until: None,
      degraded: true,
    }
  }

  /// Bound a ledger call by the store timeout; a timeout is a store failure.
  async fn store_call<T, F>(&self, op: &str, fut: F) -> Result<T>
  where
    F: Future<Output = Result<T>>,
  {
    let limit = self.config.store_timeout;
    match tokio::time::timeout(limit, fut).await {
      Ok(result) => result,
      Err(_) => Err(EngineError::store(format!("{} timed out after {:?}", op, limit))),
    }
  }
}

enum EscalationOutcome {
  Delivered,
  DeliveryFailed,
  NotDue,
  StoreError,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
  /// Due records returned by the scan.
  pub scanned: usize,
  /// Escalations committed by this sweep.
  pub escalated: usize,
  /// Due at scan time but committed by someone else before our flip.
  pub raced: usize,
  pub store_errors: usize,
  /// Committed escalations whose delivery failed.
  pub delivery_failures: usize,
}

#[derive(Debug, Default)]
struct EngineStats {
  allowed: AtomicU64,
  muted: AtomicU64,
  degraded: AtomicU64,
  rejected: AtomicU64,
  clock_anomalies: AtomicU64,
  escalations_committed: AtomicU64,
  escalations_delivered: AtomicU64,
  escalation_failures: AtomicU64,
}

impl EngineStats {
  fn snapshot(&self) -> EngineStatsSnapshot {
    EngineStatsSnapshot {
      allowed: self.allowed.load(Ordering::Relaxed),
      muted: self.muted.load(Ordering::Relaxed),
      degraded: self.degraded.load(Ordering::Relaxed),
      rejected: self.rejected.load(Ordering::Relaxed),
      clock_anomalies: self.clock_anomalies.load(Ordering::Relaxed),
      escalations_committed: self.escalations_committed.load(Ordering::Relaxed),
      escalations_delivered: self.escalations_delivered.load(Ordering::Relaxed),
      escalation_failures: self.escalation_failures.load(Ordering::Relaxed),
    }
  }
}

/// Point-in-time engine counters for operational monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
  pub allowed: u64,
  pub muted: u64,
  /// Fail-open verdicts issued while the ledger was unavailable.
  pub degraded: u64,
  /// Events rejected by validation.
  pub rejected: u64,
  pub clock_anomalies: u64,
  pub escalations_committed: u64,
  pub escalations_delivered: u64,
  pub escalation_failures: u64,
}
