//! Ledger trait: the authoritative store of one record per fingerprint.
//!
//! Every backend must make `observe` and `mark_escalated` atomic per
//! fingerprint. That atomicity is the only serialization point in the
//! system: evaluators hold no locks and never coordinate with each other.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cache::RecordCache;
use crate::config::Config;
use crate::error::Result;
use crate::types::{ErrorRecord, Event, Fingerprint, Observation};

pub mod cached;
pub mod memory;
pub mod postgres;

pub use cached::CachedLedger;
pub use memory::MemoryLedger;
pub use postgres::PgLedger;

#[async_trait]
pub trait Ledger: Send + Sync {
  /// Apply one event to the fingerprint's record as a single indivisible step.
  async fn observe(&self, fingerprint: &Fingerprint, event: &Event) -> Result<Observation>;

  /// Read the current record, if any.
  async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<ErrorRecord>>;

  /// Records whose mute window has elapsed (`muted_until <= now`) and that have
  /// not been escalated, oldest window end first.
  async fn due_for_escalation(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ErrorRecord>>;

  /// Commit the escalation of a due record. Returns the updated record when
  /// this call performed the flip, `None` when it was not due (including when
  /// another caller already flipped it).
  async fn mark_escalated(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<Option<ErrorRecord>>;

  /// Backend name for logs ("memory", "postgres", ...).
  fn name(&self) -> &str;
}

/// Put the hot-path cache in front of `inner` when the config enables it.
pub fn layered<L>(inner: L, config: &Config) -> Arc<dyn Ledger>
where
  L: Ledger + 'static,
{
  if config.cache.enabled {
    let cache = RecordCache::new(config.cache.ttl, config.cache.capacity);
    Arc::new(CachedLedger::new(inner, cache, config))
  } else {
    Arc::new(inner)
  }
}
