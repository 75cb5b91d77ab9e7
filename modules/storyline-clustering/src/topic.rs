//! Topic state: anchors, the Forming -> Locked machine, and the per-CTM set.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use storyline_common::{Bucket, LockState, SignalSet, SignalType};

// ---------------------------------------------------------------------------
// Co-occurrence statistics
// ---------------------------------------------------------------------------

/// Counts of non-anchor tokens seen on headlines that joined after locking.
/// Auxiliary only: never consulted by scoring, never folded into the anchor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoOccurrence(BTreeMap<SignalType, BTreeMap<String, u32>>);

impl CoOccurrence {
    /// Record every token of `signals` that is not part of `anchor`.
    /// Returns how many tokens were counted.
    pub fn record_outside(&mut self, anchor: &SignalSet, signals: &SignalSet) -> usize {
        let mut recorded = 0;
        for (signal_type, token) in signals.tokens() {
            if anchor.contains(signal_type, token.as_str()) {
                continue;
            }
            *self
                .0
                .entry(signal_type)
                .or_default()
                .entry(token.as_str().to_string())
                .or_insert(0) += 1;
            recorded += 1;
        }
        recorded
    }

    pub fn count(&self, signal_type: SignalType, token: &str) -> u32 {
        self.0
            .get(&signal_type)
            .and_then(|tokens| tokens.get(token))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub id: Uuid,
    pub ctm_id: Uuid,
    /// Fixed at creation from the seeding headline.
    pub bucket: Bucket,
    pub is_catchall: bool,
    pub lock_state: LockState,
    pub anchor: SignalSet,
    pub co_occurrence: CoOccurrence,
    pub member_count: u32,
    pub first_active: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// What a join did to the topic's anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absorption {
    /// Topic still forming; `added` new anchor tokens.
    Extended { added: usize },
    /// This join reached the lock threshold and froze the anchor.
    Locked { added: usize },
    /// Anchor already frozen; `co_occurring` tokens went to the side statistics.
    Frozen { co_occurring: usize },
    /// Catchall topics carry no anchor.
    Catchall,
}

impl Topic {
    /// A new thematic topic whose anchor is the seeding headline's signals.
    pub fn seed(
        ctm_id: Uuid,
        bucket: Bucket,
        signals: &SignalSet,
        at: DateTime<Utc>,
        lock_threshold: u32,
    ) -> Self {
        let lock_state = if lock_threshold <= 1 {
            LockState::Locked
        } else {
            LockState::Forming
        };
        Self {
            id: Uuid::new_v4(),
            ctm_id,
            bucket,
            is_catchall: false,
            lock_state,
            anchor: signals.clone(),
            co_occurrence: CoOccurrence::default(),
            member_count: 1,
            first_active: at,
            last_active: at,
        }
    }

    /// The "Other coverage" topic for one bucket, before its first member.
    pub fn catchall(ctm_id: Uuid, bucket: Bucket, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ctm_id,
            bucket,
            is_catchall: true,
            lock_state: LockState::Forming,
            anchor: SignalSet::new(),
            co_occurrence: CoOccurrence::default(),
            member_count: 0,
            first_active: at,
            last_active: at,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_state == LockState::Locked
    }

    /// Add one member. Forming topics union the member's signals into the
    /// anchor; the join that reaches `lock_threshold` is the last to do so.
    pub fn absorb(
        &mut self,
        signals: &SignalSet,
        at: DateTime<Utc>,
        lock_threshold: u32,
    ) -> Absorption {
        self.member_count += 1;
        self.touch(at);

        if self.is_catchall {
            return Absorption::Catchall;
        }

        match self.lock_state {
            LockState::Forming => {
                let added = self.anchor.union_with(signals);
                if self.member_count >= lock_threshold {
                    self.lock_state = LockState::Locked;
                    Absorption::Locked { added }
                } else {
                    Absorption::Extended { added }
                }
            }
            LockState::Locked => Absorption::Frozen {
                co_occurring: self.co_occurrence.record_outside(&self.anchor, signals),
            },
        }
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at < self.first_active {
            self.first_active = at;
        }
        if at > self.last_active {
            self.last_active = at;
        }
    }
}

// ---------------------------------------------------------------------------
// TopicSet: one CTM's topics in creation order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TopicSet {
    ctm_id: Uuid,
    topics: Vec<Topic>,
    catchalls: HashMap<Bucket, usize>,
}

impl TopicSet {
    pub fn new(ctm_id: Uuid) -> Self {
        Self {
            ctm_id,
            topics: Vec::new(),
            catchalls: HashMap::new(),
        }
    }

    /// Rebuild from stored topics, which must already be in creation order.
    pub fn from_loaded(ctm_id: Uuid, topics: Vec<Topic>) -> Self {
        let mut set = Self::new(ctm_id);
        for topic in topics {
            set.push(topic);
        }
        set
    }

    pub fn ctm_id(&self) -> Uuid {
        self.ctm_id
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Topic> {
        self.topics.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.topics.iter()
    }

    /// Non-catchall topics with their creation-order index.
    pub fn thematic(&self) -> impl Iterator<Item = (usize, &Topic)> {
        self.topics
            .iter()
            .enumerate()
            .filter(|(_, topic)| !topic.is_catchall)
    }

    pub fn catchall_index(&self, bucket: &Bucket) -> Option<usize> {
        self.catchalls.get(bucket).copied()
    }

    pub fn index_of(&self, topic_id: Uuid) -> Option<usize> {
        self.topics.iter().position(|t| t.id == topic_id)
    }

    /// Append a topic, returning its index. A second catchall for a bucket
    /// that already has one is not indexed as the bucket's catchall.
    pub fn push(&mut self, topic: Topic) -> usize {
        let index = self.topics.len();
        if topic.is_catchall {
            self.catchalls.entry(topic.bucket.clone()).or_insert(index);
        }
        self.topics.push(topic);
        index
    }

    /// Replace the topic at `index` with an updated snapshot of itself.
    pub fn replace(&mut self, index: usize, topic: Topic) {
        debug_assert_eq!(self.topics[index].id, topic.id);
        self.topics[index] = topic;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyline_common::{RawSignals, Token};

    fn signals(orgs: &[&str], persons: &[&str]) -> SignalSet {
        SignalSet::from(
            RawSignals::default()
                .with(SignalType::Orgs, orgs)
                .with(SignalType::Persons, persons),
        )
    }

    #[test]
    fn forming_topic_unions_until_threshold_then_freezes() {
        let now = Utc::now();
        let mut topic = Topic::seed(Uuid::new_v4(), Bucket::Domestic, &signals(&["fed"], &[]), now, 3);
        assert_eq!(topic.lock_state, LockState::Forming);

        assert_eq!(
            topic.absorb(&signals(&["fed"], &["powell"]), now, 3),
            Absorption::Extended { added: 1 }
        );
        assert_eq!(
            topic.absorb(&signals(&["treasury"], &[]), now, 3),
            Absorption::Locked { added: 1 }
        );
        assert!(topic.is_locked());

        let frozen = topic.anchor.clone();
        assert_eq!(
            topic.absorb(&signals(&["fed", "ecb"], &["lagarde"]), now, 3),
            Absorption::Frozen { co_occurring: 2 }
        );
        assert_eq!(topic.anchor, frozen);
        assert_eq!(topic.member_count, 4);
        assert_eq!(topic.co_occurrence.count(SignalType::Orgs, "ecb"), 1);
        assert_eq!(topic.co_occurrence.count(SignalType::Orgs, "fed"), 0);
    }

    #[test]
    fn locked_state_never_reopens() {
        let now = Utc::now();
        let mut topic = Topic::seed(Uuid::new_v4(), Bucket::Domestic, &signals(&["fed"], &[]), now, 2);
        topic.absorb(&signals(&["fed"], &[]), now, 2);
        assert!(topic.is_locked());
        for _ in 0..10 {
            topic.absorb(&signals(&["other"], &[]), now, 100);
            assert!(topic.is_locked());
        }
        assert!(!topic.anchor.contains(SignalType::Orgs, "other"));
    }

    #[test]
    fn threshold_of_one_locks_at_seed() {
        let topic = Topic::seed(Uuid::new_v4(), Bucket::Domestic, &signals(&["fed"], &[]), Utc::now(), 1);
        assert!(topic.is_locked());
    }

    #[test]
    fn catchall_counts_members_without_anchor() {
        let now = Utc::now();
        let mut topic = Topic::catchall(Uuid::new_v4(), Bucket::Domestic, now);
        for _ in 0..6 {
            assert_eq!(topic.absorb(&signals(&["fed"], &[]), now, 5), Absorption::Catchall);
        }
        assert_eq!(topic.member_count, 6);
        assert!(topic.anchor.is_empty());
        assert_eq!(topic.lock_state, LockState::Forming);
    }

    #[test]
    fn activity_window_widens_in_both_directions() {
        let t0 = Utc::now();
        let earlier = t0 - chrono::Duration::hours(3);
        let later = t0 + chrono::Duration::hours(3);
        let mut topic = Topic::seed(Uuid::new_v4(), Bucket::Domestic, &signals(&["fed"], &[]), t0, 5);
        topic.absorb(&signals(&["fed"], &[]), later, 5);
        topic.absorb(&signals(&["fed"], &[]), earlier, 5);
        assert_eq!(topic.first_active, earlier);
        assert_eq!(topic.last_active, later);
    }

    #[test]
    fn topic_set_keeps_one_catchall_per_bucket() {
        let ctm = Uuid::new_v4();
        let now = Utc::now();
        let mut set = TopicSet::new(ctm);
        let seeded = set.push(Topic::seed(ctm, Bucket::Domestic, &signals(&["fed"], &[]), now, 5));
        let first = set.push(Topic::catchall(ctm, Bucket::Domestic, now));
        set.push(Topic::catchall(ctm, Bucket::Domestic, now));

        assert_eq!(set.catchall_index(&Bucket::Domestic), Some(first));
        assert_eq!(set.catchall_index(&Bucket::OtherInternational), None);
        assert_eq!(set.thematic().map(|(i, _)| i).collect::<Vec<_>>(), vec![seeded]);
    }

    #[test]
    fn co_occurrence_serializes_by_signal_type() {
        let mut co = CoOccurrence::default();
        let anchor = SignalSet::new();
        let mut extra = SignalSet::new();
        extra.insert(SignalType::NamedEvents, Token::new("g20 summit"));
        co.record_outside(&anchor, &extra);
        let json = serde_json::to_value(&co).unwrap();
        assert_eq!(json, serde_json::json!({"named_events": {"g20 summit": 1}}));
    }
}
