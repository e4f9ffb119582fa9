//! Deferred re-evaluation for `Wait`.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use super::eval::EvalSlot;
use crate::fes::Aggregate;
use crate::telemetry::Telemetry;

/// Schedules wake-ups. Fired timers deliver the aggregate on the receiver
/// returned by [`WaitScheduler::new`]; the controller's run loop turns them
/// into evaluations.
#[derive(Debug, Clone)]
pub struct WaitScheduler {
    wakeups: mpsc::UnboundedSender<Aggregate>,
    telemetry: Telemetry,
}

impl WaitScheduler {
    pub fn new(telemetry: Telemetry) -> (Self, mpsc::UnboundedReceiver<Aggregate>) {
        let (wakeups, rx) = mpsc::unbounded_channel();
        (Self { wakeups, telemetry }, rx)
    }

    /// Wake the aggregate after `after`. Replaces any timer already set on
    /// the slot; evicting the slot cancels it.
    pub fn schedule(&self, slot: &EvalSlot, aggregate: Aggregate, after: Duration) {
        let token = CancellationToken::new();
        slot.replace_timer(token.clone());

        let wakeups = self.wakeups.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("aggregate.id" = %aggregate.id, "wait cancelled");
                    }
                    _ = tokio::time::sleep(after) => {
                        debug!("aggregate.id" = %aggregate.id, "wait elapsed");
                        // The receiver is gone once the controller stops.
                        let _ = wakeups.send(aggregate);
                    }
                }
            }
            .instrument(self.telemetry.span().clone()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::eval::EvalCache;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let cache = EvalCache::new(Telemetry::disabled("controller"));
        let wf = Aggregate::new("invocation", "wf-1");
        let (slot, _) = cache.get_or_create(&wf);
        let (scheduler, mut rx) = WaitScheduler::new(Telemetry::disabled("controller"));

        scheduler.schedule(&slot, wf.clone(), Duration::from_secs(5));
        assert_eq!(rx.recv().await, Some(wf));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_wait_replaces_older() {
        let cache = EvalCache::new(Telemetry::disabled("controller"));
        let wf = Aggregate::new("invocation", "wf-1");
        let (slot, _) = cache.get_or_create(&wf);
        let (scheduler, mut rx) = WaitScheduler::new(Telemetry::disabled("controller"));

        scheduler.schedule(&slot, wf.clone(), Duration::from_secs(1));
        scheduler.schedule(&slot, wf.clone(), Duration::from_secs(10));

        let started = tokio::time::Instant::now();
        assert_eq!(rx.recv().await, Some(wf));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_cancels_wait() {
        let cache = EvalCache::new(Telemetry::disabled("controller"));
        let wf = Aggregate::new("invocation", "wf-1");
        let (slot, _) = cache.get_or_create(&wf);
        let (scheduler, mut rx) = WaitScheduler::new(Telemetry::disabled("controller"));

        scheduler.schedule(&slot, wf.clone(), Duration::from_secs(1));
        cache.del(&wf);
        drop(scheduler);

        // Every sender is gone once the cancelled timer task exits.
        assert_eq!(rx.recv().await, None);
    }
}
