//! Runs every due CTM through a bounded worker pool.
//!
//! CTMs are independent, so passes run concurrently up to
//! `scheduler.max_concurrent_partitions`. A CTM locked by another writer is
//! deferred to the next batch; any other failure is logged and counted
//! without stopping the batch.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::controller::{ClusterPass, RunMode};
use crate::error::Result;
use crate::stats::PassStats;
use crate::store::TopicStore;

#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<Uuid>,
    pub deferred: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
    pub totals: PassStats,
}

impl BatchReport {
    pub fn partitions(&self) -> usize {
        self.succeeded.len() + self.deferred.len() + self.failed.len()
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Batch Complete ===")?;
        writeln!(f, "Partitions:  {}", self.partitions())?;
        writeln!(f, "Succeeded:   {}", self.succeeded.len())?;
        writeln!(f, "Deferred:    {}", self.deferred.len())?;
        writeln!(f, "Failed:      {}", self.failed.len())?;
        for (ctm_id, reason) in &self.failed {
            writeln!(f, "  {ctm_id}: {reason}")?;
        }
        write!(f, "{}", self.totals)
    }
}

pub struct Scheduler<S> {
    pass: ClusterPass<S>,
}

impl<S: TopicStore> Scheduler<S> {
    pub fn new(pass: ClusterPass<S>) -> Self {
        Self { pass }
    }

    /// One batch over every CTM the store reports as due.
    pub async fn run_due(&self, mode: RunMode) -> Result<BatchReport> {
        let due = self.pass.store().due_partitions().await?;
        if due.is_empty() {
            info!("No CTMs due for clustering");
            return Ok(BatchReport::default());
        }
        Ok(self.run_batch(due, mode).await)
    }

    pub async fn run_batch(&self, ctm_ids: Vec<Uuid>, mode: RunMode) -> BatchReport {
        let workers = self.pass.config().scheduler.max_concurrent_partitions.max(1);
        info!(partitions = ctm_ids.len(), workers, ?mode, "Clustering batch starting");

        let results: Vec<_> = stream::iter(ctm_ids.into_iter().map(|ctm_id| {
            let pass = self.pass.clone();
            async move { (ctm_id, pass.run(ctm_id, mode).await) }
        }))
        .buffer_unordered(workers)
        .collect()
        .await;

        let mut report = BatchReport::default();
        for (ctm_id, result) in results {
            match result {
                Ok(stats) => {
                    report.totals.merge(&stats);
                    report.succeeded.push(ctm_id);
                }
                Err(e) if e.is_retryable() => {
                    warn!(%ctm_id, error = %e, "CTM busy, deferring");
                    report.deferred.push(ctm_id);
                }
                Err(e) => {
                    error!(%ctm_id, error = %e, "Clustering pass failed");
                    report.failed.push((ctm_id, e.to_string()));
                }
            }
        }

        // Completion order depends on timing; report in a stable order.
        report.succeeded.sort();
        report.deferred.sort();
        report.failed.sort();

        info!(
            succeeded = report.succeeded.len(),
            deferred = report.deferred.len(),
            failed = report.failed.len(),
            linked = report.totals.headlines_linked,
            "Clustering batch complete"
        );
        report
    }

    /// Run write-mode batches forever on a fixed interval. Missed ticks are
    /// skipped rather than bunched.
    pub async fn watch(&self, interval: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "Watching for due CTMs");

        loop {
            ticker.tick().await;
            match self.run_due(RunMode::Write).await {
                Ok(report) if report.partitions() > 0 => info!("{report}"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to list due CTMs"),
            }
        }
    }
}
