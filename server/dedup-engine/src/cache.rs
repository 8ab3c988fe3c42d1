//! Hot-path record cache: capacity-bounded LRU with a TTL.
//!
//! Purely a latency optimization. Entries may be stale (up to one TTL) and
//! are never used to commit anything; the ledger stays authoritative.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::{ErrorRecord, Fingerprint};

struct Entry {
  record: ErrorRecord,
  stored_at: Instant,
  /// Recency tick; key into `Inner::order`.
  tick: u64,
}

#[derive(Default)]
struct Inner {
  entries: HashMap<Fingerprint, Entry>,
  /// tick -> fingerprint, oldest first.
  order: BTreeMap<u64, Fingerprint>,
  next_tick: u64,
}

impl Inner {
  fn touch(&mut self, fp: &Fingerprint) {
    let tick = self.next_tick;
    self.next_tick += 1;
    if let Some(entry) = self.entries.get_mut(fp) {
      self.order.remove(&entry.tick);
      entry.tick = tick;
      self.order.insert(tick, fp.clone());
    }
  }

  fn remove(&mut self, fp: &Fingerprint) -> Option<Entry> {
    let entry = self.entries.remove(fp)?;
    self.order.remove(&entry.tick);
    Some(entry)
  }
}

/// Per-instance cache of recent ledger records keyed by fingerprint.
pub struct RecordCache {
  inner: Mutex<Inner>,
  ttl: Duration,
  capacity: usize,
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
  expirations: AtomicU64,
  stale_predictions: AtomicU64,
}

impl RecordCache {
  pub fn new(ttl: Duration, capacity: usize) -> Self {
    Self {
      inner: Mutex::new(Inner::default()),
      ttl,
      capacity: capacity.max(1),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      evictions: AtomicU64::new(0),
      expirations: AtomicU64::new(0),
      stale_predictions: AtomicU64::new(0),
    }
  }

  pub fn get(&self, fp: &Fingerprint) -> Option<ErrorRecord> {
    self.get_at(fp, Instant::now())
  }

  /// Look up a fresh entry as of `now`. Expired entries are dropped.
  pub fn get_at(&self, fp: &Fingerprint, now: Instant) -> Option<ErrorRecord> {
    let mut inner = self.inner.lock();
    let expired = match inner.entries.get(fp) {
      Some(entry) => now.saturating_duration_since(entry.stored_at) >= self.ttl,
      None => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        return None;
      }
    };
    if expired {
      inner.remove(fp);
      self.expirations.fetch_add(1, Ordering::Relaxed);
      self.misses.fetch_add(1, Ordering::Relaxed);
      return None;
    }
    inner.touch(fp);
    self.hits.fetch_add(1, Ordering::Relaxed);
    inner.entries.get(fp).map(|e| e.record.clone())
  }

  pub fn put(&self, record: ErrorRecord) {
    self.put_at(record, Instant::now())
  }

  /// Insert or refresh an entry, evicting least-recently-used entries over capacity.
  ///
  /// Concurrent writers may finish out of order; a fresh entry that already
  /// holds a later version of the record is kept.
  pub fn put_at(&self, record: ErrorRecord, now: Instant) {
    let mut inner = self.inner.lock();
    let fp = record.fingerprint.clone();
    if let Some(existing) = inner.entries.get(&fp) {
      let fresh = now.saturating_duration_since(existing.stored_at) < self.ttl;
      if fresh && version(&existing.record) > version(&record) {
        return;
      }
    }
    inner.remove(&fp);

    let tick = inner.next_tick;
    inner.next_tick += 1;
    inner.order.insert(tick, fp.clone());
    inner.entries.insert(
      fp,
      Entry {
        record,
        stored_at: now,
        tick,
      },
    );

    while inner.entries.len() > self.capacity {
      let Some((_, oldest)) = inner.order.pop_first() else {
        break;
      };
      inner.entries.remove(&oldest);
      self.evictions.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn invalidate(&self, fp: &Fingerprint) {
    self.inner.lock().remove(fp);
  }

  /// Count a locally predicted verdict that the ledger contradicted.
  pub fn record_stale_prediction(&self) {
    self.stale_predictions.fetch_add(1, Ordering::Relaxed);
  }

  pub fn len(&self) -> usize {
    self.inner.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      entries: self.len(),
      capacity: self.capacity,
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      expirations: self.expirations.load(Ordering::Relaxed),
      stale_predictions: self.stale_predictions.load(Ordering::Relaxed),
    }
  }
}

/// Records only move forward: the count grows and the escalation flag is set
/// before the count moves again.
fn version(record: &ErrorRecord) -> (u64, bool) {
  (record.occurrence_count, record.escalation_sent)
}

/// Point-in-time snapshot of cache counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub capacity: usize,
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub expirations: u64,
  pub stale_predictions: u64,
}
