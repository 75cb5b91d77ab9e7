// Test doubles for clustering passes.
//
// MemoryTopicStore implements TopicStore over shared in-memory state with the
// same observable rules as the Postgres store: one membership per headline,
// anchors frozen once stored as locked, one catchall per (CTM, bucket), and a
// per-CTM exclusive lock. Plus fixtures for CTMs, headlines and config.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use storyline_common::{ClusteringConfig, Ctm, Headline, LockState, RawSignals};

use crate::error::{ClusterError, Result};
use crate::store::{
    CommitOutcome, MoveOutcome, PartitionLock, PendingTopic, TopicCommit, TopicStore, TopicWrite,
};
use crate::topic::Topic;

// ---------------------------------------------------------------------------
// MemoryTopicStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredTopic {
    topic: Topic,
    needs_summary: bool,
}

#[derive(Debug, Clone)]
struct Membership {
    topic_id: Uuid,
    score: Option<f64>,
}

#[derive(Default)]
struct Inner {
    ctms: HashMap<Uuid, Ctm>,
    headlines: HashMap<Uuid, Vec<Headline>>,
    /// Creation order is insertion order.
    topics: Vec<StoredTopic>,
    members: HashMap<(Uuid, Uuid), Membership>,
    locks: HashSet<Uuid>,
    commits: usize,
    fail_after_commits: Option<usize>,
}

impl Inner {
    fn topic_mut(&mut self, topic_id: Uuid) -> Option<&mut StoredTopic> {
        self.topics.iter_mut().find(|t| t.topic.id == topic_id)
    }

    fn is_linked(&self, ctm_id: Uuid, headline_id: Uuid) -> bool {
        self.members.contains_key(&(ctm_id, headline_id))
    }
}

#[derive(Clone, Default)]
pub struct MemoryTopicStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ctm(&self, ctm: Ctm) {
        self.inner.lock().unwrap().ctms.insert(ctm.id, ctm);
    }

    pub fn add_headline(&self, headline: Headline) {
        self.inner
            .lock()
            .unwrap()
            .headlines
            .entry(headline.ctm_id)
            .or_default()
            .push(headline);
    }

    pub fn add_headlines(&self, headlines: impl IntoIterator<Item = Headline>) {
        for headline in headlines {
            self.add_headline(headline);
        }
    }

    pub fn set_frozen(&self, ctm_id: Uuid, frozen: bool) {
        if let Some(ctm) = self.inner.lock().unwrap().ctms.get_mut(&ctm_id) {
            ctm.is_frozen = frozen;
        }
    }

    /// Make every commit after the next `n` fail.
    pub fn fail_after_commits(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_after_commits = Some(inner.commits + n);
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().fail_after_commits = None;
    }

    /// Take the partition lock as another writer would.
    pub fn hold_lock(&self, ctm_id: Uuid) -> bool {
        self.inner.lock().unwrap().locks.insert(ctm_id)
    }

    pub fn is_locked(&self, ctm_id: Uuid) -> bool {
        self.inner.lock().unwrap().locks.contains(&ctm_id)
    }

    pub fn topics(&self, ctm_id: Uuid) -> Vec<Topic> {
        self.inner
            .lock()
            .unwrap()
            .topics
            .iter()
            .filter(|t| t.topic.ctm_id == ctm_id)
            .map(|t| t.topic.clone())
            .collect()
    }

    pub fn topic(&self, topic_id: Uuid) -> Option<Topic> {
        self.inner
            .lock()
            .unwrap()
            .topics
            .iter()
            .find(|t| t.topic.id == topic_id)
            .map(|t| t.topic.clone())
    }

    pub fn topic_of(&self, ctm_id: Uuid, headline_id: Uuid) -> Option<Uuid> {
        self.inner
            .lock()
            .unwrap()
            .members
            .get(&(ctm_id, headline_id))
            .map(|m| m.topic_id)
    }

    pub fn score_of(&self, ctm_id: Uuid, headline_id: Uuid) -> Option<f64> {
        self.inner
            .lock()
            .unwrap()
            .members
            .get(&(ctm_id, headline_id))
            .and_then(|m| m.score)
    }

    /// Headline ids per topic id.
    pub fn members(&self, ctm_id: Uuid) -> HashMap<Uuid, BTreeSet<Uuid>> {
        let inner = self.inner.lock().unwrap();
        let mut out: HashMap<Uuid, BTreeSet<Uuid>> = HashMap::new();
        for ((ctm, headline), m) in &inner.members {
            if *ctm == ctm_id {
                out.entry(m.topic_id).or_default().insert(*headline);
            }
        }
        out
    }

    pub fn membership_count(&self, ctm_id: Uuid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .members
            .keys()
            .filter(|(ctm, _)| *ctm == ctm_id)
            .count()
    }

    /// Link a headline directly, bypassing any pass. Simulates a concurrent
    /// writer having linked it first.
    pub fn link_directly(&self, ctm_id: Uuid, headline_id: Uuid, topic_id: Uuid) {
        self.inner.lock().unwrap().members.insert(
            (ctm_id, headline_id),
            Membership {
                topic_id,
                score: None,
            },
        );
    }

    pub fn commit_count(&self) -> usize {
        self.inner.lock().unwrap().commits
    }

    pub fn last_clustered_at(&self, ctm_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap()
            .ctms
            .get(&ctm_id)
            .and_then(|c| c.last_clustered_at)
    }
}

struct MemoryPartitionLock {
    ctm_id: Uuid,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl PartitionLock for MemoryPartitionLock {
    fn ctm_id(&self) -> Uuid {
        self.ctm_id
    }

    async fn release(self: Box<Self>) -> Result<()> {
        // Drop does the work.
        Ok(())
    }
}

impl Drop for MemoryPartitionLock {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.locks.remove(&self.ctm_id);
        }
    }
}

#[async_trait]
impl TopicStore for MemoryTopicStore {
    async fn load_ctm(&self, ctm_id: Uuid) -> Result<Option<Ctm>> {
        Ok(self.inner.lock().unwrap().ctms.get(&ctm_id).cloned())
    }

    async fn try_lock_partition(&self, ctm_id: Uuid) -> Result<Option<Box<dyn PartitionLock>>> {
        if !self.inner.lock().unwrap().locks.insert(ctm_id) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryPartitionLock {
            ctm_id,
            inner: Arc::clone(&self.inner),
        })))
    }

    async fn unlinked_headlines(&self, ctm: &Ctm) -> Result<Vec<Headline>> {
        let inner = self.inner.lock().unwrap();
        let home: BTreeSet<String> = ctm.home_iso_codes.iter().cloned().collect();
        let mut out: Vec<Headline> = inner
            .headlines
            .get(&ctm.id)
            .into_iter()
            .flatten()
            .filter(|h| !inner.is_linked(ctm.id, h.id))
            .map(|h| {
                let mut h = h.clone();
                h.track = ctm.track.clone();
                h.home_iso_codes = home.clone();
                h
            })
            .collect();
        out.sort_by(|a, b| a.pubdate.cmp(&b.pubdate).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn load_topics(&self, ctm_id: Uuid) -> Result<Vec<Topic>> {
        Ok(self.topics(ctm_id))
    }

    async fn commit(&self, commit: &TopicCommit) -> Result<CommitOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(limit) = inner.fail_after_commits {
            if inner.commits >= limit {
                return Err(ClusterError::Other(anyhow!("injected commit failure")));
            }
        }
        if inner.is_linked(commit.ctm_id, commit.headline_id) {
            return Ok(CommitOutcome::AlreadyLinked);
        }

        let topic = &commit.topic;
        match commit.write {
            TopicWrite::Insert => {
                let duplicate_catchall = topic.is_catchall
                    && inner.topics.iter().any(|t| {
                        t.topic.is_catchall
                            && t.topic.ctm_id == topic.ctm_id
                            && t.topic.bucket == topic.bucket
                    });
                if duplicate_catchall || inner.topic_mut(topic.id).is_some() {
                    return Err(ClusterError::Other(anyhow!(
                        "unique violation inserting topic {}",
                        topic.id
                    )));
                }
                inner.topics.push(StoredTopic {
                    topic: topic.clone(),
                    needs_summary: true,
                });
            }
            TopicWrite::Update => {
                let stored = inner
                    .topic_mut(topic.id)
                    .filter(|t| t.topic.ctm_id == commit.ctm_id)
                    .ok_or(ClusterError::TopicNotInCtm {
                        topic_id: topic.id,
                        ctm_id: commit.ctm_id,
                    })?;
                if stored.topic.lock_state == LockState::Forming {
                    stored.topic.anchor = topic.anchor.clone();
                    stored.topic.lock_state = topic.lock_state;
                }
                stored.topic.co_occurrence = topic.co_occurrence.clone();
                stored.topic.member_count = topic.member_count;
                stored.topic.first_active = topic.first_active;
                stored.topic.last_active = topic.last_active;
                stored.needs_summary = true;
            }
        }

        inner.members.insert(
            (commit.ctm_id, commit.headline_id),
            Membership {
                topic_id: topic.id,
                score: commit.score,
            },
        );
        inner.commits += 1;
        Ok(CommitOutcome::Linked)
    }

    async fn mark_clustered(&self, ctm_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(ctm) = self.inner.lock().unwrap().ctms.get_mut(&ctm_id) {
            ctm.last_clustered_at = Some(at);
        }
        Ok(())
    }

    async fn due_partitions(&self) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<&Ctm> = inner
            .ctms
            .values()
            .filter(|ctm| !ctm.is_frozen)
            .filter(|ctm| {
                inner
                    .headlines
                    .get(&ctm.id)
                    .into_iter()
                    .flatten()
                    .any(|h| !inner.is_linked(ctm.id, h.id))
            })
            .collect();
        due.sort_by(|a, b| {
            a.last_clustered_at
                .cmp(&b.last_clustered_at)
                .then(a.id.cmp(&b.id))
        });
        Ok(due.into_iter().map(|ctm| ctm.id).collect())
    }

    async fn move_membership(
        &self,
        ctm_id: Uuid,
        headline_id: Uuid,
        to_topic: Uuid,
    ) -> Result<MoveOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locks.contains(&ctm_id) {
            return Err(ClusterError::LockConflict(ctm_id));
        }
        let target_ok = inner
            .topics
            .iter()
            .any(|t| t.topic.id == to_topic && t.topic.ctm_id == ctm_id);
        if !target_ok {
            return Err(ClusterError::TopicNotInCtm {
                topic_id: to_topic,
                ctm_id,
            });
        }

        let from_topic = inner
            .members
            .get(&(ctm_id, headline_id))
            .map(|m| m.topic_id)
            .ok_or(ClusterError::NotLinked {
                headline_id,
                ctm_id,
            })?;
        if from_topic == to_topic {
            return Ok(MoveOutcome::AlreadyThere);
        }

        inner.members.insert(
            (ctm_id, headline_id),
            Membership {
                topic_id: to_topic,
                score: None,
            },
        );
        if let Some(from) = inner.topic_mut(from_topic) {
            from.topic.member_count = from.topic.member_count.saturating_sub(1);
            from.needs_summary = true;
        }
        if let Some(to) = inner.topic_mut(to_topic) {
            to.topic.member_count += 1;
            to.needs_summary = true;
        }
        Ok(MoveOutcome::Moved { from_topic })
    }

    async fn pending_summaries(&self, ctm_id: Uuid) -> Result<Vec<PendingTopic>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .topics
            .iter()
            .filter(|t| t.topic.ctm_id == ctm_id && t.needs_summary)
            .map(|t| PendingTopic::from(&t.topic))
            .collect())
    }

    async fn mark_summarized(&self, topic_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.topic_mut(topic_id) {
            Some(t) => {
                t.needs_summary = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const GEO_ECONOMY: &str = "geo_economy";

/// Config with a `geo_economy` track, the default thresholds and both
/// default discriminators.
pub fn test_config() -> ClusteringConfig {
    ClusteringConfig::from_toml_str(
        r#"
        anchor_lock_threshold = 5
        join_threshold = 0.2
        high_freq_persons = ["donald trump", "xi jinping"]

        [track_weights.geo_economy]
        persons = 0.5
        orgs = 2.0
        places = 0.5
        commodities = 2.0
        policies = 2.0
        systems = 1.0
        named_events = 1.0

        [[discriminators]]
        rule = "generic_signal_dominance"
        max_share = 0.5

        [[discriminators]]
        rule = "geographic_conflict"
        "#,
    )
    .expect("test config parses")
}

/// A US-homed `geo_economy` CTM for March 2026.
pub fn us_ctm() -> Ctm {
    Ctm {
        id: Uuid::new_v4(),
        centroid_id: "united-states".into(),
        track: GEO_ECONOMY.into(),
        month: NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid date"),
        home_iso_codes: vec!["US".into()],
        is_frozen: false,
        last_clustered_at: None,
    }
}

/// Base publication time for fixtures; `headline_at` offsets from it.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// A headline `minute` minutes after `base_time()`.
pub fn headline_at(ctm: &Ctm, minute: i64, signals: RawSignals) -> Headline {
    Headline::builder()
        .ctm_id(ctm.id)
        .pubdate(base_time() + Duration::minutes(minute))
        .track(ctm.track.clone())
        .home_iso_codes(ctm.home_iso_codes.iter().cloned().collect())
        .signals(signals)
        .build()
}

/// Like `headline_at`, with entity token -> country mappings.
pub fn headline_with_countries(
    ctm: &Ctm,
    minute: i64,
    signals: RawSignals,
    countries: &[(&str, &str)],
) -> Headline {
    let mut headline = headline_at(ctm, minute, signals);
    headline.entity_countries = countries
        .iter()
        .map(|(token, code)| (token.to_string(), code.to_string()))
        .collect();
    headline
}

pub fn orgs(tokens: &[&str]) -> RawSignals {
    RawSignals::default().with(storyline_common::SignalType::Orgs, tokens)
}
