//! Lease heartbeat task
//!
//! While a shard is leased, a background task renews the lease at a third
//! of its TTL. Renewal is fenced on the lease generation, so a worker whose
//! lease was taken over gets a clean `false` back — that flips the loss
//! signal, and the owning shard task transitions to LOST.
//!
//! A renewal *error* (as opposed to a refusal) is tolerated while the lease
//! still has runway; once two thirds of the TTL pass without a successful
//! renewal, ownership can no longer be assumed and the loss signal is
//! flipped anyway.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use easystore_metadata::{MetadataStore, ShardLease};

use crate::metrics::{MetricsSink, Readiness};

/// Handle to a running heartbeat task.
pub struct Heartbeat {
    handle: JoinHandle<()>,
    lost_rx: watch::Receiver<bool>,
}

impl Heartbeat {
    /// Receiver that flips to `true` when the lease is lost.
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    /// Stop renewing (the lease itself is released by the shard task).
    pub fn stop(self) {
        self.handle.abort();
    }
}

/// Spawn the renewal task for one held lease.
pub fn spawn_heartbeat(
    store: Arc<dyn MetadataStore>,
    lease: ShardLease,
    readiness: Arc<Readiness>,
    metrics: Arc<dyn MetricsSink>,
) -> Heartbeat {
    let (lost_tx, lost_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let ttl = Duration::from_secs(u64::from(lease.ttl_seconds));
        let period = (ttl / 3).max(Duration::from_millis(200));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_success = Instant::now();

        loop {
            ticker.tick().await;
            match store
                .renew(lease.shard_id, &lease.owner_id, lease.generation)
                .await
            {
                Ok(true) => {
                    last_success = Instant::now();
                    readiness.record_lease_renew();
                    readiness.record_db_ping();
                }
                Ok(false) => {
                    tracing::warn!(
                        shard_id = lease.shard_id,
                        generation = lease.generation,
                        "lease renewal refused; lease lost"
                    );
                    metrics.on_event("lease_lost", &[], 1.0);
                    let _ = lost_tx.send(true);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        shard_id = lease.shard_id,
                        error = %e,
                        "lease renewal errored"
                    );
                    if last_success.elapsed() > ttl * 2 / 3 {
                        metrics.on_event("lease_lost", &[], 1.0);
                        let _ = lost_tx.send(true);
                        return;
                    }
                }
            }
        }
    });

    Heartbeat { handle, lost_rx }
}
