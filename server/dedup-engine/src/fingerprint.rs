//! Stable fingerprint computation for grouping occurrences into one logical error.

use crate::types::{Event, Fingerprint};

/// Compute the fingerprint of (service, error type, canonicalized message).
///
/// Each field is length-prefixed before hashing so that no shift of bytes
/// between adjacent fields can produce the same input. Uses blake3 and keeps
/// the first 16 bytes (32 hex chars).
pub fn compute(source_service: &str, error_type: &str, error_message: &str) -> Fingerprint {
  let mut hasher = blake3::Hasher::new();
  for part in [source_service, error_type, error_message] {
    hasher.update(&(part.len() as u64).to_le_bytes());
    hasher.update(part.as_bytes());
  }
  let hex = hasher.finalize().to_hex();
  Fingerprint(hex[..32].to_string())
}

/// Fingerprint of an already-normalized event.
pub fn of_event(event: &Event) -> Fingerprint {
  compute(&event.source_service, &event.error_type, &event.error_message)
}
