//! Binary entrypoint: read JSON lines from stdin, write JSON lines to stdout.
//!
//! Each input line is an InboundEvent. Output lines are one of:
//! - `{"type":"decision",...}` for every valid event
//! - `{"type":"escalation",...}` whenever a muted burst is escalated
//! - `{"type":"error",...}` when an input line fails parsing or validation
//!
//! Logs go to stderr (`RUST_LOG`, default `info`). With `DATABASE_URL` set the
//! ledger lives in PostgreSQL and may be shared with other instances;
//! otherwise it is in-process.

use std::io::Write;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use dedup_engine::ledger::{self, MemoryLedger, PgLedger};
use dedup_engine::types::ErrorOutput;
use dedup_engine::{sweeper, ChannelNotifier, Config, Decision, Engine, EngineError, EscalationSummary, InboundEvent};

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputLine {
  Decision(Decision),
  Escalation(EscalationSummary),
  Error(ErrorOutput),
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  if let Err(e) = run().await {
    tracing::error!(error = %e, "dedup-engine: fatal");
    std::process::exit(1);
  }
}

async fn run() -> Result<(), EngineError> {
  let config = Config::from_env()?;

  let ledger = match std::env::var("DATABASE_URL") {
    Ok(url) => {
      let pg = PgLedger::connect(&url, &config).await?;
      pg.migrate().await?;
      tracing::info!("ledger: postgres");
      ledger::layered(pg, &config)
    }
    Err(_) => {
      tracing::warn!("DATABASE_URL not set; ledger is in-process and not shared");
      ledger::layered(MemoryLedger::from_config(&config), &config)
    }
  };

  let (notifier, mut escalations) = ChannelNotifier::channel(1024);
  let engine = Arc::new(Engine::new(config.clone(), ledger, Arc::new(notifier)));

  // Single writer so decision and escalation lines never interleave mid-line.
  let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutputLine>();
  let writer = tokio::task::spawn_blocking(move || {
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    while let Some(line) = out_rx.blocking_recv() {
      if serde_json::to_writer(&mut out, &line).is_err() || writeln!(out).is_err() {
        break;
      }
      if out_rx.is_empty() && out.flush().is_err() {
        break;
      }
    }
    let _ = out.flush();
  });

  let escalation_tx = out_tx.clone();
  let forwarder = tokio::spawn(async move {
    while let Some(summary) = escalations.recv().await {
      if escalation_tx.send(OutputLine::Escalation(summary)).is_err() {
        break;
      }
    }
  });

  let sweeper = sweeper::spawn(engine.clone(), config.sweep_interval);

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    let line = match lines.next_line().await {
      Ok(Some(line)) => line,
      Ok(None) => break,
      Err(e) => {
        tracing::error!(error = %e, "read error");
        break;
      }
    };

    // Skip blank lines.
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let raw: InboundEvent = match serde_json::from_str(trimmed) {
      Ok(v) => v,
      Err(e) => {
        let _ = out_tx.send(OutputLine::Error(ErrorOutput::new(format!("json parse: {}", e))));
        continue;
      }
    };

    let output = match engine.process(&raw).await {
      Ok(decision) => OutputLine::Decision(decision),
      Err(EngineError::Validation { field, reason }) => {
        OutputLine::Error(ErrorOutput::new(reason).with_field(field))
      }
      Err(e) => OutputLine::Error(ErrorOutput::new(e.to_string())),
    };
    let _ = out_tx.send(output);
  }

  sweeper.shutdown().await;
  // Catch bursts whose window closed while we were reading the tail of the input.
  if let Err(e) = engine.sweep().await {
    tracing::warn!(error = %e, "final sweep failed");
  }

  let stats = engine.stats();
  tracing::info!(
    allowed = stats.allowed,
    muted = stats.muted,
    degraded = stats.degraded,
    rejected = stats.rejected,
    escalations = stats.escalations_delivered,
    escalation_failures = stats.escalation_failures,
    "input exhausted; shutting down"
  );

  // Closing the engine closes the notifier channel, which ends the forwarder.
  drop(engine);
  let _ = forwarder.await;
  drop(out_tx);
  let _ = writer.await;
  Ok(())
}
