//! PushLog Alert Dedup Engine: per-fingerprint ALLOW/MUTE decisions with
//! exactly-once escalation of muted bursts.
//!
//! Events are fingerprinted (service + error type + canonicalized message),
//! then applied to one summarized ledger record per fingerprint through a
//! single atomic operation. Evaluators are stateless; the ledger is the only
//! point of serialization. A local TTL/LRU cache sits in front of the ledger
//! for latency only.

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod normalize;
pub mod notifier;
pub mod state;
pub mod sweeper;
pub mod types;

pub use config::Config;
pub use engine::{Engine, EngineStatsSnapshot, SweepReport};
pub use error::EngineError;
pub use ledger::{CachedLedger, Ledger, MemoryLedger, PgLedger};
pub use notifier::{ChannelNotifier, EscalationSummary, LogNotifier, Notifier};
pub use types::{Decision, ErrorRecord, EscalationTask, Fingerprint, InboundEvent, Verdict};
