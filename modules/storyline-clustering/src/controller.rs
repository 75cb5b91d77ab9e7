//! One clustering pass over one CTM.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use storyline_common::ClusteringConfig;

use crate::engine::{Decision, PartitionEngine, Plan};
use crate::error::{ClusterError, Result};
use crate::stats::PassStats;
use crate::store::{CommitOutcome, TopicCommit, TopicStore, TopicWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Persist every decision.
    Write,
    /// Decide against an in-memory copy and log; persist nothing.
    DryRun,
}

impl RunMode {
    pub fn from_write_flag(write: bool) -> Self {
        if write {
            RunMode::Write
        } else {
            RunMode::DryRun
        }
    }
}

pub struct ClusterPass<S> {
    store: Arc<S>,
    config: Arc<ClusteringConfig>,
}

impl<S> Clone for ClusterPass<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: TopicStore> ClusterPass<S> {
    pub fn new(store: Arc<S>, config: Arc<ClusteringConfig>) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    /// Cluster every unlinked headline of `ctm_id`, holding the partition
    /// lock for the whole pass.
    pub async fn run(&self, ctm_id: Uuid, mode: RunMode) -> Result<PassStats> {
        let lock = self
            .store
            .try_lock_partition(ctm_id)
            .await?
            .ok_or(ClusterError::LockConflict(ctm_id))?;

        let result = self.run_locked(ctm_id, mode).await;

        if let Err(e) = lock.release().await {
            warn!(%ctm_id, error = %e, "Failed to release partition lock");
        }
        result
    }

    async fn run_locked(&self, ctm_id: Uuid, mode: RunMode) -> Result<PassStats> {
        let ctm = self
            .store
            .load_ctm(ctm_id)
            .await?
            .ok_or(ClusterError::CtmNotFound(ctm_id))?;

        let mut stats = PassStats::default();
        if ctm.is_frozen {
            info!(%ctm_id, "CTM is frozen, skipping");
            return Ok(stats);
        }

        // Every headline in a CTM shares its track.
        if self.config.weights_for(&ctm.track).is_none() {
            return Err(ClusterError::UnknownTrack {
                track: ctm.track.clone(),
                ctm_id,
            });
        }

        let headlines = self.store.unlinked_headlines(&ctm).await?;
        stats.headlines_loaded = headlines.len() as u32;
        if headlines.is_empty() {
            debug!(%ctm_id, "No unlinked headlines");
            return Ok(stats);
        }

        let stored = self.store.load_topics(ctm_id).await?;
        info!(
            %ctm_id,
            centroid = %ctm.centroid_id,
            track = %ctm.track,
            month = %ctm.month,
            headlines = headlines.len(),
            topics = stored.len(),
            ?mode,
            "Clustering pass starting"
        );

        let mut engine = PartitionEngine::new(Arc::clone(&self.config), ctm_id, stored);

        for headline in &headlines {
            let normalized = engine.normalize(headline);
            let verdict = engine.decide(&normalized)?;
            let plan = engine.plan(&normalized, verdict)?;
            log_plan(&plan);

            if mode == RunMode::Write {
                match self.store.commit(&to_commit(ctm_id, &plan)).await? {
                    CommitOutcome::Linked => {}
                    CommitOutcome::AlreadyLinked => {
                        debug!(headline_id = %plan.headline_id, "Headline already linked, skipping");
                        stats.duplicates_skipped += 1;
                        continue;
                    }
                }
            }

            engine.apply(&plan);
            stats.record(&plan);
        }

        if mode == RunMode::Write {
            self.store.mark_clustered(ctm_id, Utc::now()).await?;
        }

        info!(
            %ctm_id,
            linked = stats.headlines_linked,
            topics_created = stats.topics_created,
            joins = stats.joins,
            catchall = stats.catchall_total(),
            vetoes = stats.vetoes,
            anchors_locked = stats.anchors_locked,
            duplicates = stats.duplicates_skipped,
            ?mode,
            "Clustering pass complete"
        );
        Ok(stats)
    }
}

fn to_commit(ctm_id: Uuid, plan: &Plan) -> TopicCommit {
    TopicCommit {
        ctm_id,
        headline_id: plan.headline_id,
        topic: plan.topic.clone(),
        write: if plan.is_new_topic() {
            TopicWrite::Insert
        } else {
            TopicWrite::Update
        },
        score: plan.score(),
    }
}

fn log_plan(plan: &Plan) {
    let veto_rule = plan.verdict.veto.as_ref().map(|v| v.rule);
    match &plan.verdict.decision {
        Decision::Join { topic_id, score, .. } => debug!(
            headline_id = %plan.headline_id,
            %topic_id,
            score,
            absorption = ?plan.absorption,
            "Joined topic"
        ),
        Decision::Seed => debug!(
            headline_id = %plan.headline_id,
            topic_id = %plan.topic.id,
            bucket = %plan.topic.bucket,
            anchor_tokens = plan.topic.anchor.len(),
            ?veto_rule,
            "Seeded topic"
        ),
        Decision::Catchall(reason) => debug!(
            headline_id = %plan.headline_id,
            topic_id = %plan.topic.id,
            bucket = %plan.topic.bucket,
            ?reason,
            ?veto_rule,
            "Routed to catchall"
        ),
    }
}
