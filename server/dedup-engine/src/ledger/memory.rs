//! In-process ledger backed by a sharded concurrent map.
//!
//! `observe` and `mark_escalated` run under the map's per-shard write lock for
//! the fingerprint's entry, which makes each of them atomic per fingerprint.
//! Suitable for a single instance or for tests; records do not survive restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::Config;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::state::{self, BurstPolicy};
use crate::types::{ErrorRecord, Event, Fingerprint, Observation};

pub struct MemoryLedger {
  records: DashMap<Fingerprint, ErrorRecord>,
  policy: BurstPolicy,
}

impl MemoryLedger {
  pub fn new(policy: BurstPolicy) -> Self {
    Self {
      records: DashMap::new(),
      policy,
    }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::new(BurstPolicy::from_config(config))
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

impl Default for MemoryLedger {
  fn default() -> Self {
    Self::new(BurstPolicy::default())
  }
}

#[async_trait]
impl Ledger for MemoryLedger {
  async fn observe(&self, fingerprint: &Fingerprint, event: &Event) -> Result<Observation> {
    let obs = match self.records.entry(fingerprint.clone()) {
      Entry::Occupied(mut slot) => {
        let obs = state::apply(Some(slot.get()), fingerprint, event, &self.policy);
        slot.insert(obs.record.clone());
        obs
      }
      Entry::Vacant(slot) => {
        let obs = state::apply(None, fingerprint, event, &self.policy);
        slot.insert(obs.record.clone());
        obs
      }
    };
    Ok(obs)
  }

  async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<ErrorRecord>> {
    Ok(self.records.get(fingerprint).map(|r| r.value().clone()))
  }

  async fn due_for_escalation(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ErrorRecord>> {
    let mut due: Vec<ErrorRecord> = self
      .records
      .iter()
      .filter(|r| state::escalation_due(r.value(), now))
      .map(|r| r.value().clone())
      .collect();
    due.sort_by(|a, b| a.muted_until.cmp(&b.muted_until).then_with(|| a.fingerprint.cmp(&b.fingerprint)));
    due.truncate(limit);
    Ok(due)
  }

  async fn mark_escalated(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<Option<ErrorRecord>> {
    let Some(mut record) = self.records.get_mut(fingerprint) else {
      return Ok(None);
    };
    Ok(state::commit_escalation(&mut record, now).map(|_| record.value().clone()))
  }

  fn name(&self) -> &str {
    "memory"
  }
}
