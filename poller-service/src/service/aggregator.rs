//! Result aggregator
//!
//! The only writer of the run statistics. Workers send their outcomes over
//! a channel and this task folds them into [`RunStats`] one at a time, so no
//! lock is needed on the counters.

use poller_core::domain::poll::{PollOutcome, PollStatus};
use poller_core::domain::run::RunStats;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct ResultAggregator {
    frequency: Duration,
    stats: RunStats,
}

impl ResultAggregator {
    pub fn new(frequency: Duration) -> Self {
        Self {
            frequency,
            stats: RunStats::new(),
        }
    }

    /// Consumes outcomes until every sender is gone, then hands back the
    /// final statistics
    pub async fn run(mut self, mut outcomes: mpsc::UnboundedReceiver<PollOutcome>) -> RunStats {
        while let Some(outcome) = outcomes.recv().await {
            self.record(outcome);
        }
        self.stats
    }

    pub fn record(&mut self, outcome: PollOutcome) {
        match outcome.status {
            PollStatus::Failed => warn!(
                "{} failed to poll device {} after {} seconds",
                outcome.worker_id,
                outcome.device_id,
                outcome.elapsed_seconds()
            ),
            PollStatus::Completed if outcome.is_slow(self.frequency) => warn!(
                "{} finished device {} in {} seconds",
                outcome.worker_id,
                outcome.device_id,
                outcome.elapsed_seconds()
            ),
            PollStatus::Completed => info!(
                "{} finished device {} in {} seconds",
                outcome.worker_id,
                outcome.device_id,
                outcome.elapsed_seconds()
            ),
        }

        self.stats.record(&outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_aggregates_until_senders_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = tokio::spawn(ResultAggregator::new(Duration::from_secs(300)).run(rx));

        let workers: Vec<_> = (1..=4u64)
            .map(|id| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tx.send(PollOutcome::completed(
                        id,
                        format!("worker-{}", id),
                        Duration::from_secs(id * 10),
                    ))
                    .unwrap();
                })
            })
            .collect();
        drop(tx);
        for worker in workers {
            worker.await.unwrap();
        }

        let stats = aggregator.await.unwrap();
        assert_eq!(stats.devices_polled, 4);
        assert_eq!(stats.cumulative_elapsed, Duration::from_secs(100));
        assert_eq!(stats.per_device_elapsed.len(), 4);
    }

    #[test]
    fn test_slow_and_failed_outcomes_are_counted() {
        let mut aggregator = ResultAggregator::new(Duration::from_secs(300));

        aggregator.record(PollOutcome::completed(4, "worker-1", Duration::from_secs(310)));
        aggregator.record(PollOutcome::failed(5, "worker-2", Duration::from_secs(3)));

        let stats = &aggregator.stats;
        assert_eq!(stats.devices_polled, 2);
        assert_eq!(stats.devices_failed, 1);
        assert_eq!(stats.per_device_elapsed[&4], Duration::from_secs(310));
    }
}
