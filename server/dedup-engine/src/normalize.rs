//! Validate inbound events and canonicalize messages before fingerprinting.

use chrono::{DateTime, Utc};

use crate::error::{EngineError, Result};
use crate::types::{Event, InboundEvent};

/// Pluggable message canonicalization. Must be deterministic: every instance
/// has to map the same message to the same canonical form.
pub trait Canonicalizer: Send + Sync {
  fn canonicalize(&self, message: &str) -> String;
}

/// One built-in canonicalization step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalStep {
  /// Strip leading/trailing whitespace.
  Trim,
  /// ASCII lowercase.
  Lowercase,
  /// Collapse runs of whitespace into a single space.
  CollapseWhitespace,
  /// Replace runs of decimal digits with `<n>`.
  MaskNumbers,
  /// Replace hex-looking tokens (8+ hex chars, e.g. ids and hashes) with `<hex>`.
  MaskHex,
}

impl CanonicalStep {
  fn parse(name: &str) -> Option<Self> {
    match name {
      "trim" => Some(Self::Trim),
      "lowercase" | "lower" => Some(Self::Lowercase),
      "collapse_whitespace" | "whitespace" => Some(Self::CollapseWhitespace),
      "mask_numbers" | "numbers" => Some(Self::MaskNumbers),
      "mask_hex" | "hex" => Some(Self::MaskHex),
      _ => None,
    }
  }

  fn apply(self, s: &str) -> String {
    match self {
      Self::Trim => s.trim().to_string(),
      Self::Lowercase => s.to_ascii_lowercase(),
      Self::CollapseWhitespace => s.split_whitespace().collect::<Vec<_>>().join(" "),
      Self::MaskNumbers => mask_numbers(s),
      Self::MaskHex => mask_hex(s),
    }
  }
}

/// Ordered list of canonicalization steps. Empty means identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Canonicalization {
  steps: Vec<CanonicalStep>,
}

impl Canonicalization {
  pub fn identity() -> Self {
    Self::default()
  }

  pub fn with_steps(steps: Vec<CanonicalStep>) -> Self {
    Self { steps }
  }

  /// Parse a comma-separated policy, e.g. `"trim,lowercase,mask_numbers"`.
  /// `"identity"`, `"none"` and the empty string mean no steps.
  pub fn parse(policy: &str) -> std::result::Result<Self, String> {
    let mut steps = Vec::new();
    for name in policy.split(',').map(|s| s.trim().to_ascii_lowercase()) {
      if name.is_empty() || name == "identity" || name == "none" {
        continue;
      }
      match CanonicalStep::parse(&name) {
        Some(step) => steps.push(step),
        None => return Err(format!("unknown canonicalization step {:?}", name)),
      }
    }
    Ok(Self { steps })
  }

  pub fn is_identity(&self) -> bool {
    self.steps.is_empty()
  }

  pub fn apply(&self, message: &str) -> String {
    self
      .steps
      .iter()
      .fold(message.to_string(), |acc, step| step.apply(&acc))
  }
}

impl Canonicalizer for Canonicalization {
  fn canonicalize(&self, message: &str) -> String {
    self.apply(message)
  }
}

/// Validate an inbound event and produce the canonical Event.
///
/// `received_at` stands in for a missing `occurred_at`.
pub fn normalize(
  raw: &InboundEvent,
  received_at: DateTime<Utc>,
  canonicalizer: &dyn Canonicalizer,
) -> Result<Event> {
  let source_service = required("source_service", &raw.source_service)?;
  let error_type = required("error_type", &raw.error_type)?;
  if raw.error_message.trim().is_empty() {
    return Err(EngineError::validation("error_message", "must not be empty"));
  }

  let occurred_at = match raw.occurred_at.as_deref().map(str::trim) {
    Some(ts) if !ts.is_empty() => DateTime::parse_from_rfc3339(ts)
      .map_err(|e| EngineError::validation("occurred_at", &format!("invalid RFC3339: {}", e)))?
      .with_timezone(&Utc),
    _ => received_at,
  };

  let error_message = canonicalizer.canonicalize(&raw.error_message);
  if error_message.is_empty() {
    return Err(EngineError::validation(
      "error_message",
      "empty after canonicalization",
    ));
  }

  Ok(Event {
    source_service,
    error_type,
    error_message,
    occurred_at,
  })
}

fn required(field: &str, value: &str) -> Result<String> {
  let trimmed = value.trim();
  if trimmed.is_empty() {
    return Err(EngineError::validation(field, "must not be empty"));
  }
  Ok(trimmed.to_string())
}

fn mask_numbers(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  let mut in_digits = false;
  for ch in s.chars() {
    if ch.is_ascii_digit() {
      if !in_digits {
        out.push_str("<n>");
      }
      in_digits = true;
    } else {
      in_digits = false;
      out.push(ch);
    }
  }
  out
}

fn mask_hex(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  let mut token = String::new();
  let flush = |token: &mut String, out: &mut String| {
    let looks_hex = token.len() >= 8
      && token.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
      && token.chars().any(|c| c.is_ascii_digit());
    if looks_hex {
      out.push_str("<hex>");
    } else {
      out.push_str(token);
    }
    token.clear();
  };
  for ch in s.chars() {
    if ch.is_ascii_alphanumeric() || ch == '-' {
      token.push(ch);
    } else {
      flush(&mut token, &mut out);
      out.push(ch);
    }
  }
  flush(&mut token, &mut out);
  out
}
