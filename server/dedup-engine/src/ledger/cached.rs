//! Ledger decorator that keeps a local record cache in front of the real store.
//!
//! Cache-aside for reads, write-through for every mutation. A fresh hit lets
//! the verdict be predicted locally, but `observe` always goes to the inner
//! ledger and its answer is the one returned. The cache never decides.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cache::{CacheStats, RecordCache};
use crate::config::Config;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::state::{self, BurstPolicy};
use crate::types::{ErrorRecord, Event, Fingerprint, Observation};

pub struct CachedLedger<L> {
  inner: L,
  cache: Arc<RecordCache>,
  policy: BurstPolicy,
}

impl<L: Ledger> CachedLedger<L> {
  pub fn new(inner: L, cache: RecordCache, config: &Config) -> Self {
    Self {
      inner,
      cache: Arc::new(cache),
      policy: BurstPolicy::from_config(config),
    }
  }

  pub fn cache(&self) -> &Arc<RecordCache> {
    &self.cache
  }

  pub fn cache_stats(&self) -> CacheStats {
    self.cache.stats()
  }

  pub fn inner(&self) -> &L {
    &self.inner
  }
}

#[async_trait]
impl<L: Ledger> Ledger for CachedLedger<L> {
  async fn observe(&self, fingerprint: &Fingerprint, event: &Event) -> Result<Observation> {
    let predicted = self
      .cache
      .get(fingerprint)
      .map(|cached| state::predict(Some(&cached), event.occurred_at, &self.policy));

    let obs = match self.inner.observe(fingerprint, event).await {
      Ok(obs) => obs,
      Err(e) => {
        // Outcome unknown; do not serve the old snapshot again.
        self.cache.invalidate(fingerprint);
        return Err(e);
      }
    };

    if let Some(predicted) = predicted {
      if predicted != obs.verdict {
        self.cache.record_stale_prediction();
        tracing::debug!(
          fingerprint = %fingerprint,
          predicted = ?predicted,
          actual = ?obs.verdict,
          "cached record was stale"
        );
      }
    }

    self.cache.put(obs.record.clone());
    Ok(obs)
  }

  async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<ErrorRecord>> {
    if let Some(record) = self.cache.get(fingerprint) {
      return Ok(Some(record));
    }
    let found = self.inner.find_by_fingerprint(fingerprint).await?;
    if let Some(record) = &found {
      self.cache.put(record.clone());
    }
    Ok(found)
  }

  async fn due_for_escalation(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ErrorRecord>> {
    // The sweep must see the authoritative state, never the local cache.
    self.inner.due_for_escalation(now, limit).await
  }

  async fn mark_escalated(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<Option<ErrorRecord>> {
    match self.inner.mark_escalated(fingerprint, now).await {
      Ok(Some(record)) => {
        self.cache.put(record.clone());
        Ok(Some(record))
      }
      Ok(None) => Ok(None),
      Err(e) => {
        self.cache.invalidate(fingerprint);
        Err(e)
      }
    }
  }

  fn name(&self) -> &str {
    self.inner.name()
  }
}
