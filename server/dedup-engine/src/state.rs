//! Per-fingerprint burst state machine.
//!
//! Every ledger backend applies these functions inside its own atomic
//! operation, so the rules exist exactly once:
//! - [`apply`] is the observe transition (ALLOW / MUTE, count, mute slide).
//! - [`commit_escalation`] is the escalation transition shared by the
//!   event-triggered check and the periodic sweep.

use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::types::{BurstKind, ErrorRecord, EscalationTask, Event, Fingerprint, Observation, Verdict};

/// Time windows that drive the transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstPolicy {
  pub quiet_window: Duration,
  pub mute_window: Duration,
  pub clock_skew_tolerance: Duration,
}

impl BurstPolicy {
  pub fn from_config(config: &Config) -> Self {
    Self {
      quiet_window: config.quiet_window,
      mute_window: config.mute_window,
      clock_skew_tolerance: config.clock_skew_tolerance,
    }
  }
}

impl Default for BurstPolicy {
  fn default() -> Self {
    Self::from_config(&Config::default())
  }
}

/// Logical state of a record, derived rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
  /// Not muted; the next in-burst event will be muted.
  Active,
  /// Inside a mute cycle whose window has not elapsed.
  Muted,
  /// Mute window elapsed, escalation not yet committed.
  EscalationDue,
  /// Escalation committed for the current cycle.
  Escalated,
}

pub fn classify(record: &ErrorRecord, now: DateTime<Utc>) -> RecordState {
  match record.muted_until {
    None => RecordState::Active,
    Some(_) if record.escalation_sent => RecordState::Escalated,
    Some(until) if until <= now => RecordState::EscalationDue,
    Some(_) => RecordState::Muted,
  }
}

/// Which rule an event at `occurred_at` falls under, given the stored record.
///
/// An event continues the burst when it is within the quiet window of
/// last_seen_at, or when it is dated inside a mute window that is still open.
pub fn burst_kind(prev: &ErrorRecord, occurred_at: DateTime<Utc>, policy: &BurstPolicy) -> BurstKind {
  let in_mute_window = prev.muted_until.is_some_and(|until| occurred_at <= until);
  if prev.last_seen_at - occurred_at > policy.clock_skew_tolerance {
    BurstKind::ClockAnomaly
  } else if occurred_at - prev.last_seen_at > policy.quiet_window && !in_mute_window {
    BurstKind::NewBurst
  } else {
    BurstKind::SameBurst
  }
}

/// Verdict an event would get against `record`, without mutating anything.
pub fn predict(record: Option<&ErrorRecord>, occurred_at: DateTime<Utc>, policy: &BurstPolicy) -> Verdict {
  match record {
    None => BurstKind::First.verdict(),
    Some(r) => burst_kind(r, occurred_at, policy).verdict(),
  }
}

/// Apply one event to the previous record (if any) and return the next record.
///
/// Pure; callers are responsible for committing `Observation::record` atomically
/// with respect to `prev`.
pub fn apply(
  prev: Option<&ErrorRecord>,
  fingerprint: &Fingerprint,
  event: &Event,
  policy: &BurstPolicy,
) -> Observation {
  let t = event.occurred_at;

  let prev = match prev {
    Some(p) => p,
    None => {
      let record = ErrorRecord {
        fingerprint: fingerprint.clone(),
        source_service: event.source_service.clone(),
        error_type: event.error_type.clone(),
        error_message: event.error_message.clone(),
        first_seen_at: t,
        last_seen_at: t,
        occurrence_count: 1,
        muted_until: None,
        escalation_sent: false,
        escalation_sent_at: None,
        burst_started_at: t,
        burst_count: 1,
      };
      return Observation {
        record,
        verdict: Verdict::Allow,
        kind: BurstKind::First,
        closed_burst: None,
      };
    }
  };

  let kind = burst_kind(prev, t, policy);
  let mut next = prev.clone();
  next.occurrence_count = prev.occurrence_count.saturating_add(1);
  next.last_seen_at = prev.last_seen_at.max(t);

  let mut closed_burst = None;
  match kind {
    BurstKind::SameBurst => {
      // Slide forward, never back: an out-of-order event must not shorten the cycle.
      let slid = t
        .checked_add_signed(policy.mute_window)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
      next.muted_until = Some(prev.muted_until.map_or(slid, |m| m.max(slid)));
      next.burst_count = prev.burst_count.saturating_add(1);
      next.burst_started_at = prev.burst_started_at.min(t);
    }
    BurstKind::NewBurst | BurstKind::ClockAnomaly | BurstKind::First => {
      if prev.muted_until.is_some() && !prev.escalation_sent {
        // The cycle being reset was muted but never escalated; close it out here.
        closed_burst = EscalationTask::from_record(prev);
        next.escalation_sent_at = Some(t);
      }
      next.muted_until = None;
      next.escalation_sent = false;
      next.burst_started_at = t;
      next.burst_count = 1;
    }
  }

  Observation {
    record: next,
    verdict: kind.verdict(),
    kind,
    closed_burst,
  }
}

/// Whether the record's mute cycle elapsed without an escalation.
pub fn escalation_due(record: &ErrorRecord, now: DateTime<Utc>) -> bool {
  classify(record, now) == RecordState::EscalationDue
}

/// Flip `escalation_sent` if due. Returns the task to dispatch; `None` means
/// nothing to do (not muted, not elapsed, or already escalated). Idempotent.
pub fn commit_escalation(record: &mut ErrorRecord, now: DateTime<Utc>) -> Option<EscalationTask> {
  if !escalation_due(record, now) {
    return None;
  }
  record.escalation_sent = true;
  record.escalation_sent_at = Some(now);
  EscalationTask::from_record(record)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, h, m, 0).unwrap()
  }

  fn event(t: DateTime<Utc>) -> Event {
    Event {
      source_service: "billing".into(),
      error_type: "Timeout".into(),
      error_message: "db timeout".into(),
      occurred_at: t,
    }
  }

  fn fp() -> Fingerprint {
    Fingerprint("f".repeat(32))
  }

  fn run(times: &[DateTime<Utc>]) -> Vec<Observation> {
    let policy = BurstPolicy::default();
    let mut record: Option<ErrorRecord> = None;
    let mut out = Vec::new();
    for &t in times {
      let obs = apply(record.as_ref(), &fp(), &event(t), &policy);
      record = Some(obs.record.clone());
      out.push(obs);
    }
    out
  }

  #[test]
  fn first_event_creates_unmuted_record() {
    let obs = run(&[at(0, 0)]).remove(0);
    assert_eq!(obs.verdict, Verdict::Allow);
    assert_eq!(obs.kind, BurstKind::First);
    assert_eq!(obs.record.occurrence_count, 1);
    assert_eq!(obs.record.first_seen_at, at(0, 0));
    assert_eq!(obs.record.muted_until, None);
    assert!(!obs.record.escalation_sent);
  }

  #[test]
  fn gap_at_exactly_quiet_window_is_same_burst() {
    let obs = run(&[at(0, 0), at(0, 5)]);
    assert_eq!(obs[1].verdict, Verdict::Mute);
    assert_eq!(obs[1].record.muted_until, Some(at(0, 35)));
  }

  #[test]
  fn gap_beyond_quiet_window_is_new_burst() {
    let obs = run(&[at(0, 0), at(0, 6)]);
    assert_eq!(obs[1].verdict, Verdict::Allow);
    assert_eq!(obs[1].kind, BurstKind::NewBurst);
    assert_eq!(obs[1].record.occurrence_count, 2);
    assert_eq!(obs[1].closed_burst, None);
  }

  #[test]
  fn mute_window_slides_on_every_muted_event() {
    let obs = run(&[at(0, 0), at(0, 2), at(0, 6), at(0, 10)]);
    assert_eq!(obs[1].record.muted_until, Some(at(0, 32)));
    assert_eq!(obs[2].record.muted_until, Some(at(0, 36)));
    assert_eq!(obs[3].record.muted_until, Some(at(0, 40)));
    assert_eq!(obs[3].record.burst_count, 4);
    assert_eq!(obs[3].record.burst_started_at, at(0, 0));
  }

  #[test]
  fn event_inside_open_mute_window_stays_in_burst() {
    let obs = run(&[at(0, 0), at(0, 2), at(0, 31), at(1, 2)]);
    assert_eq!(obs[2].verdict, Verdict::Mute);
    assert_eq!(obs[2].record.muted_until, Some(at(1, 1)));
    assert_eq!(obs[2].record.burst_count, 3);
    // 01:02 is past both the quiet window and the mute window.
    assert_eq!(obs[3].kind, BurstKind::NewBurst);
    assert_eq!(obs[3].closed_burst.as_ref().map(|t| t.occurrence_count), Some(3));
  }

  #[test]
  fn oversized_mute_window_saturates_instead_of_overflowing() {
    let policy = BurstPolicy {
      mute_window: Duration::MAX,
      ..BurstPolicy::default()
    };
    let first = apply(None, &fp(), &event(at(0, 0)), &policy).record;
    let muted = apply(Some(&first), &fp(), &event(at(0, 1)), &policy);
    assert_eq!(muted.verdict, Verdict::Mute);
    assert_eq!(muted.record.muted_until, Some(DateTime::<Utc>::MAX_UTC));
  }

  #[test]
  fn out_of_order_event_never_moves_last_seen_or_mute_back() {
    let obs = run(&[at(0, 0), at(0, 4), at(0, 2)]);
    let last = &obs[2].record;
    assert_eq!(obs[2].verdict, Verdict::Mute);
    assert_eq!(last.occurrence_count, 3);
    assert_eq!(last.last_seen_at, at(0, 4));
    assert_eq!(last.muted_until, Some(at(0, 34)));
  }

  #[test]
  fn far_past_event_is_a_clock_anomaly() {
    let obs = run(&[at(5, 0), at(5, 1), at(2, 0)]);
    assert_eq!(obs[2].kind, BurstKind::ClockAnomaly);
    assert_eq!(obs[2].verdict, Verdict::Allow);
    assert_eq!(obs[2].record.last_seen_at, at(5, 1));
    assert_eq!(obs[2].record.muted_until, None);
    assert_eq!(obs[2].record.occurrence_count, 3);
  }

  #[test]
  fn new_burst_closes_out_an_unescalated_cycle() {
    let obs = run(&[at(0, 0), at(0, 2), at(0, 3), at(2, 0)]);
    let closed = obs[3].closed_burst.as_ref().expect("closed burst");
    assert_eq!(closed.occurrence_count, 3);
    assert_eq!(closed.last_seen_at, at(0, 3));
    assert_eq!(closed.mute_window_end, at(0, 33));
    assert_eq!(closed.burst_count, 3);
    assert_eq!(obs[3].record.escalation_sent_at, Some(at(2, 0)));
    assert!(!obs[3].record.escalation_sent);
  }

  #[test]
  fn new_burst_after_escalation_resets_without_close_out() {
    let policy = BurstPolicy::default();
    let mut obs = run(&[at(0, 0), at(0, 2)]);
    let mut record = obs.remove(1).record;
    assert!(commit_escalation(&mut record, at(0, 40)).is_some());

    let next = apply(Some(&record), &fp(), &event(at(2, 0)), &policy);
    assert_eq!(next.verdict, Verdict::Allow);
    assert_eq!(next.closed_burst, None);
    assert!(!next.record.escalation_sent);
    assert_eq!(next.record.muted_until, None);
  }

  #[test]
  fn escalation_commits_once() {
    let mut record = run(&[at(0, 0), at(0, 2)]).remove(1).record;
    assert!(commit_escalation(&mut record, at(0, 31)).is_none(), "window not elapsed");
    let task = commit_escalation(&mut record, at(0, 32)).expect("due at window end");
    assert_eq!(task.occurrence_count, 2);
    assert_eq!(task.mute_window_end, at(0, 32));
    assert!(record.escalation_sent);
    assert_eq!(record.escalation_sent_at, Some(at(0, 32)));
    assert!(commit_escalation(&mut record, at(1, 0)).is_none());
  }

  #[test]
  fn in_burst_event_after_escalation_does_not_rearm() {
    let policy = BurstPolicy {
      quiet_window: Duration::hours(2),
      ..BurstPolicy::default()
    };
    let first = apply(None, &fp(), &event(at(0, 0)), &policy).record;
    let mut record = apply(Some(&first), &fp(), &event(at(0, 1)), &policy).record;
    assert!(commit_escalation(&mut record, at(0, 40)).is_some());

    let later = apply(Some(&record), &fp(), &event(at(0, 45)), &policy);
    assert_eq!(later.verdict, Verdict::Mute);
    assert!(later.record.escalation_sent);
    let mut r = later.record;
    assert!(commit_escalation(&mut r, at(3, 0)).is_none());
  }

  #[test]
  fn classify_walks_the_lifecycle() {
    let obs = run(&[at(0, 0), at(0, 2)]);
    assert_eq!(classify(&obs[0].record, at(0, 0)), RecordState::Active);
    let mut record = obs[1].record.clone();
    assert_eq!(classify(&record, at(0, 10)), RecordState::Muted);
    assert_eq!(classify(&record, at(0, 33)), RecordState::EscalationDue);
    commit_escalation(&mut record, at(0, 33));
    assert_eq!(classify(&record, at(0, 34)), RecordState::Escalated);
  }

  #[test]
  fn predict_matches_apply() {
    let policy = BurstPolicy::default();
    let obs = run(&[at(0, 0)]);
    assert_eq!(predict(None, at(0, 0), &policy), Verdict::Allow);
    assert_eq!(predict(Some(&obs[0].record), at(0, 3), &policy), Verdict::Mute);
    assert_eq!(predict(Some(&obs[0].record), at(0, 30), &policy), Verdict::Allow);
  }
}
