// Persistence seam for clustering passes.
//
// TopicStore covers everything a pass reads or writes: the CTM row, its
// unlinked headlines, its topics, the per-headline commit, and the surface the
// downstream summarization stage uses (move, pending, mark summarized).
// PgTopicStore is the production implementation; the in-memory one lives in
// `testing`.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use storyline_common::{Bucket, Ctm, Headline, LockState};

use crate::error::Result;
use crate::topic::Topic;

pub use postgres::PgTopicStore;

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// Whether a commit creates the topic row or updates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicWrite {
    Insert,
    Update,
}

/// One headline's membership together with the topic snapshot it produces.
/// Stores apply it atomically.
#[derive(Debug, Clone)]
pub struct TopicCommit {
    pub ctm_id: Uuid,
    pub headline_id: Uuid,
    pub topic: Topic,
    pub write: TopicWrite,
    /// Match score for joins; `None` for seeds and catchall routings.
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Linked,
    /// The headline already had a membership row; nothing was written.
    AlreadyLinked,
}

// ---------------------------------------------------------------------------
// Downstream surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved { from_topic: Uuid },
    AlreadyThere,
}

/// A topic flagged for (re)summarization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingTopic {
    pub topic_id: Uuid,
    pub ctm_id: Uuid,
    pub bucket: Bucket,
    pub is_catchall: bool,
    pub lock_state: LockState,
    pub member_count: u32,
    pub last_active: DateTime<Utc>,
}

impl From<&Topic> for PendingTopic {
    fn from(topic: &Topic) -> Self {
        Self {
            topic_id: topic.id,
            ctm_id: topic.ctm_id,
            bucket: topic.bucket.clone(),
            is_catchall: topic.is_catchall,
            lock_state: topic.lock_state,
            member_count: topic.member_count,
            last_active: topic.last_active,
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Exclusive hold on one CTM. Dropping without `release` is allowed; the
/// holder's session ending frees it.
#[async_trait]
pub trait PartitionLock: Send {
    fn ctm_id(&self) -> Uuid;

    async fn release(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait TopicStore: Send + Sync {
    async fn load_ctm(&self, ctm_id: Uuid) -> Result<Option<Ctm>>;

    /// `None` when another writer holds the CTM.
    async fn try_lock_partition(&self, ctm_id: Uuid) -> Result<Option<Box<dyn PartitionLock>>>;

    /// Headlines of the CTM without a membership row, ordered by publication
    /// time then id.
    async fn unlinked_headlines(&self, ctm: &Ctm) -> Result<Vec<Headline>>;

    /// Topics of the CTM in creation order.
    async fn load_topics(&self, ctm_id: Uuid) -> Result<Vec<Topic>>;

    async fn commit(&self, commit: &TopicCommit) -> Result<CommitOutcome>;

    async fn mark_clustered(&self, ctm_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Not frozen, with at least one unlinked headline.
    async fn due_partitions(&self) -> Result<Vec<Uuid>>;

    async fn move_membership(
        &self,
        ctm_id: Uuid,
        headline_id: Uuid,
        to_topic: Uuid,
    ) -> Result<MoveOutcome>;

    async fn pending_summaries(&self, ctm_id: Uuid) -> Result<Vec<PendingTopic>>;

    /// Clear the summary marker. Returns false if the topic does not exist.
    async fn mark_summarized(&self, topic_id: Uuid) -> Result<bool>;
}
