//! Ledger tests against a real PostgreSQL.
//!
//! Skipped unless `DEDUP_TEST_DATABASE_URL` points at a database the tests may
//! create the `error_records` table in. Every test uses its own service name so
//! runs never collide with earlier rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use dedup_engine::clock::ManualClock;
use dedup_engine::fingerprint;
use dedup_engine::types::Event;
use dedup_engine::{Config, Engine, InboundEvent, Ledger, LogNotifier, PgLedger, Verdict};

fn at(h: u32, m: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2025, 1, 15, h, m, 0).unwrap()
}

/// Generous store timeout: contention tests queue hundreds of writers on one row.
fn contended_config() -> Config {
  let mut config = Config::default();
  config.cache.enabled = false;
  config.store_timeout = Duration::from_secs(60);
  config
}

async fn ledger() -> Option<PgLedger> {
  ledger_with(&contended_config()).await
}

async fn ledger_with(config: &Config) -> Option<PgLedger> {
  let Ok(url) = std::env::var("DEDUP_TEST_DATABASE_URL") else {
    eprintln!("DEDUP_TEST_DATABASE_URL not set; skipping");
    return None;
  };
  let ledger = PgLedger::connect(&url, config).await.unwrap();
  ledger.migrate().await.unwrap();
  Some(ledger)
}

fn unique_service(test: &str) -> String {
  format!("{}-{}", test, Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

fn event(service: &str, t: DateTime<Utc>) -> Event {
  Event {
    source_service: service.to_string(),
    error_type: "Timeout".into(),
    error_message: "db timeout".into(),
    occurred_at: t,
  }
}

#[tokio::test]
async fn pg_burst_lifecycle() {
  let Some(ledger) = ledger().await else { return };
  let service = unique_service("lifecycle");
  let fp = fingerprint::compute(&service, "Timeout", "db timeout");

  let a = ledger.observe(&fp, &event(&service, at(0, 0))).await.unwrap();
  assert_eq!(a.verdict, Verdict::Allow);
  let b = ledger.observe(&fp, &event(&service, at(0, 2))).await.unwrap();
  assert_eq!(b.verdict, Verdict::Mute);
  assert_eq!(b.record.muted_until, Some(at(0, 32)));

  assert!(ledger.mark_escalated(&fp, at(0, 10)).await.unwrap().is_none());
  let due = ledger.due_for_escalation(at(0, 40), 1000).await.unwrap();
  assert!(due.iter().any(|r| r.fingerprint == fp));

  let flipped = ledger.mark_escalated(&fp, at(0, 40)).await.unwrap().unwrap();
  assert!(flipped.escalation_sent);
  assert!(ledger.mark_escalated(&fp, at(0, 41)).await.unwrap().is_none());

  let d = ledger.observe(&fp, &event(&service, at(2, 0))).await.unwrap();
  assert_eq!(d.verdict, Verdict::Allow);
  assert_eq!(d.closed_burst, None);
  let stored = ledger.find_by_fingerprint(&fp).await.unwrap().unwrap();
  assert_eq!(stored.occurrence_count, 3);
  assert!(!stored.escalation_sent);
  assert_eq!(stored.first_seen_at, at(0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn pg_concurrent_observes_are_serialized() {
  let Some(ledger) = ledger().await else { return };
  let ledger = Arc::new(ledger);
  let service = unique_service("concurrent");
  let fp = fingerprint::compute(&service, "Timeout", "db timeout");
  let n = 200u64;

  let handles: Vec<_> = (0..n)
    .map(|_| {
      let ledger = ledger.clone();
      let fp = fp.clone();
      let ev = event(&service, at(0, 1));
      tokio::spawn(async move { ledger.observe(&fp, &ev).await })
    })
    .collect();

  let mut allows = 0;
  let mut errors = Vec::new();
  for h in handles {
    match h.await.unwrap() {
      Ok(obs) if obs.verdict == Verdict::Allow => allows += 1,
      Ok(_) => {}
      Err(e) => errors.push(e.to_string()),
    }
  }
  assert!(errors.is_empty(), "store errors under contention: {:?}", errors);
  assert_eq!(allows, 1);
  let stored = ledger.find_by_fingerprint(&fp).await.unwrap().unwrap();
  assert_eq!(stored.occurrence_count, n);
  assert_eq!(stored.burst_count, n);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn pg_engine_under_contention_allows_once_without_degrading() {
  let config = contended_config();
  let Some(ledger) = ledger_with(&config).await else { return };
  let service = unique_service("engine");
  let clock = Arc::new(ManualClock::new(at(0, 1)));
  let engine = Arc::new(Engine::new(config, Arc::new(ledger), Arc::new(LogNotifier)).with_clock(clock));
  let n = 100u64;

  let handles: Vec<_> = (0..n)
    .map(|_| {
      let engine = engine.clone();
      let raw = InboundEvent::new(&service, "Timeout", "db timeout").at(at(0, 1));
      tokio::spawn(async move { engine.process(&raw).await.unwrap() })
    })
    .collect();

  let mut allows = 0;
  let mut fp = None;
  for h in handles {
    let d = h.await.unwrap();
    assert!(!d.degraded, "degraded decision under contention");
    if d.verdict == Verdict::Allow {
      allows += 1;
    }
    fp = Some(d.fingerprint);
  }

  assert_eq!(allows, 1);
  assert_eq!(engine.stats().degraded, 0);
  let stored = engine.record(&fp.unwrap()).await.unwrap().unwrap();
  assert_eq!(stored.occurrence_count, n);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pg_racing_escalations_commit_once() {
  let Some(ledger) = ledger().await else { return };
  let ledger = Arc::new(ledger);
  let service = unique_service("escalate");
  let fp = fingerprint::compute(&service, "Timeout", "db timeout");
  ledger.observe(&fp, &event(&service, at(0, 0))).await.unwrap();
  ledger.observe(&fp, &event(&service, at(0, 2))).await.unwrap();

  let sweepers: Vec<_> = (0..8)
    .map(|_| {
      let ledger = ledger.clone();
      let fp = fp.clone();
      tokio::spawn(async move { ledger.mark_escalated(&fp, at(1, 0)).await.unwrap().is_some() })
    })
    .collect();
  let late = {
    let ledger = ledger.clone();
    let fp = fp.clone();
    let ev = event(&service, at(2, 0));
    tokio::spawn(async move { ledger.observe(&fp, &ev).await.unwrap().closed_burst.is_some() })
  };

  let mut commits = 0;
  for h in sweepers {
    if h.await.unwrap() {
      commits += 1;
    }
  }
  if late.await.unwrap() {
    commits += 1;
  }
  assert_eq!(commits, 1);
}
