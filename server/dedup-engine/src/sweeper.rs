//! Background sweep: escalate muted bursts that went quiet and got no further events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::engine::Engine;

/// Handle to a running sweeper task.
pub struct SweeperHandle {
  stop: Option<oneshot::Sender<()>>,
  join: JoinHandle<()>,
}

impl SweeperHandle {
  /// Stop after the in-flight pass (if any) and wait for the task to exit.
  pub async fn shutdown(mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
    if let Err(e) = self.join.await {
      tracing::error!(error = %e, "sweeper task panicked");
    }
  }
}

/// Spawn a task that runs `Engine::sweep` every `every`.
///
/// The first pass runs immediately so records left due by a previous process
/// are picked up on startup.
pub fn spawn(engine: Arc<Engine>, every: Duration) -> SweeperHandle {
  let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

  let join = tokio::spawn(async move {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(interval = ?every, "sweeper started");

    loop {
      tokio::select! {
        _ = &mut stop_rx => break,
        _ = ticker.tick() => {
          if let Err(e) = engine.sweep().await {
            tracing::warn!(error = %e, "sweep failed; retrying next tick");
          }
        }
      }
    }

    tracing::info!("sweeper stopped");
  });

  SweeperHandle {
    stop: Some(stop_tx),
    join,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::config::Config;
  use crate::notifier::ChannelNotifier;
  use crate::types::InboundEvent;
  use chrono::{Duration as ChronoDuration, TimeZone, Utc};

  #[tokio::test(start_paused = true)]
  async fn sweeper_escalates_without_further_events() {
    let start = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let (notifier, mut rx) = ChannelNotifier::channel(4);
    let engine = Arc::new(Engine::in_memory(Config::default(), Arc::new(notifier)).with_clock(clock.clone()));

    engine
      .process(&InboundEvent::new("billing", "Timeout", "db timeout").at(start))
      .await
      .unwrap();
    engine
      .process(&InboundEvent::new("billing", "Timeout", "db timeout").at(start + ChronoDuration::minutes(1)))
      .await
      .unwrap();

    let handle = spawn(engine.clone(), Duration::from_secs(60));
    clock.advance(ChronoDuration::hours(1));

    let summary = tokio::time::timeout(Duration::from_secs(120), rx.recv())
      .await
      .expect("sweep within two ticks")
      .expect("channel open");
    assert_eq!(summary.occurrence_count, 2);

    handle.shutdown().await;
    assert_eq!(engine.stats().escalations_delivered, 1);
  }
}
