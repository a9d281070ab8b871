use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use tracker_core::wire::ChangeSignal;

use crate::error::EngineError;
use crate::replica::Replica;

/// Drives a replica's pulls from three triggers: a fixed interval, change
/// signals from the host, and requests queued by the replica itself. All feed
/// one [`Notify`], so a burst of triggers while a sync is running results in
/// at most one further sync. Syncs run one at a time and are never cancelled;
/// each flushes the outbox, then pulls, through [`Replica::sync_shared`].
pub struct PullScheduler {
    trigger: Arc<Notify>,
    pulls: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    forwarder: Option<JoinHandle<()>>,
}

impl PullScheduler {
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        replica: Arc<Mutex<Replica>>,
        interval: Duration,
        signals: Option<broadcast::Receiver<ChangeSignal>>,
    ) -> Self {
        let trigger = Arc::new(Notify::new());
        let pulls = Arc::new(AtomicU64::new(0));
        match replica.lock() {
            Ok(mut replica) => replica.attach_trigger(trigger.clone()),
            Err(_) => warn!("replica lock poisoned, queued requests wait for the interval"),
        }
        let (shutdown, shutdown_rx) = watch::channel(false);

        let forwarder = signals.map(|rx| tokio::spawn(forward_signals(rx, trigger.clone())));
        let task = tokio::spawn(pull_loop(
            replica,
            interval,
            trigger.clone(),
            pulls.clone(),
            shutdown_rx,
        ));
        info!(interval_ms = interval.as_millis() as u64, "pull scheduler started");

        Self { trigger, pulls, shutdown, task, forwarder }
    }

    /// Ask for a pull as soon as the current one (if any) finishes.
    pub fn request_pull(&self) {
        self.trigger.notify_one();
    }

    /// Completed pulls so far.
    pub fn pulls(&self) -> u64 {
        self.pulls.load(Ordering::Relaxed)
    }

    /// True once the loop has exited, e.g. after the session was terminated.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop after any in-flight pull completes.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Some(forwarder) = self.forwarder {
            forwarder.abort();
        }
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!(error = %e, "pull loop panicked");
            }
        }
        info!("pull scheduler stopped");
    }
}

async fn forward_signals(mut rx: broadcast::Receiver<ChangeSignal>, trigger: Arc<Notify>) {
    loop {
        match rx.recv().await {
            Ok(signal) => {
                debug!(
                    epoch = %signal.epoch,
                    origin = %signal.origin,
                    incident = %signal.incident,
                    "change signal received"
                );
                trigger.notify_one();
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "change signals lagged");
                trigger.notify_one();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn pull_loop(
    replica: Arc<Mutex<Replica>>,
    interval: Duration,
    trigger: Arc<Notify>,
    pulls: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = trigger.notified() => {}
            _ = ticker.tick() => {}
        }

        let replica = replica.clone();
        let outcome = tokio::task::spawn_blocking(move || Replica::sync_shared(&replica)).await;

        match outcome {
            Ok(Ok(report)) => {
                pulls.fetch_add(1, Ordering::Relaxed);
                debug!(watermark = %report.watermark, changed = report.changed(), "scheduled pull done");
            }
            Ok(Err(EngineError::FatalSession(reason))) => {
                error!(%reason, "session over, pull scheduler exiting");
                break;
            }
            Ok(Err(e)) => warn!(error = %e, "pull failed, retrying on next trigger"),
            Err(e) => {
                error!(error = %e, "pull task failed");
                break;
            }
        }
    }
}
