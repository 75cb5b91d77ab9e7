//! In-memory decision loop for one CTM.
//!
//! `PartitionEngine` owns the partition's topic state and turns each headline
//! into a `Plan`: the topic snapshot the headline's membership produces. The
//! controller persists a plan and only then calls `apply`, so the in-memory
//! state never runs ahead of what the store has accepted. Dry runs apply
//! plans without persisting them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use storyline_common::{Bucket, ClusteringConfig, Headline, SignalSet, SignalType};

use crate::bucket::classify_headline;
use crate::discriminator::{DiscriminatorChain, MatchContext, Veto};
use crate::error::{ClusterError, Result};
use crate::scorer::best_candidate;
use crate::signals::{NormalizedHeadline, SignalNormalizer};
use crate::topic::{Absorption, Topic, TopicSet};

/// Why a headline ended up in its bucket's catchall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchallReason {
    /// The headline carried no signals at all.
    NoSignals,
    /// No topic matched and the headline is too generic to seed one.
    NotDistinctive,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Join { index: usize, topic_id: Uuid, score: f64 },
    Seed,
    Catchall(CatchallReason),
}

/// A decision plus the context it was made in.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub decision: Decision,
    pub bucket: Bucket,
    /// Set when the best candidate was rejected by a discriminator.
    pub veto: Option<Veto>,
}

/// The write a verdict implies.
#[derive(Debug, Clone)]
pub struct Plan {
    pub headline_id: Uuid,
    pub pubdate: DateTime<Utc>,
    pub verdict: Verdict,
    /// Topic after absorbing the headline.
    pub topic: Topic,
    /// Position in the topic set; `None` when the topic is new.
    pub index: Option<usize>,
    pub absorption: Absorption,
}

impl Plan {
    pub fn is_new_topic(&self) -> bool {
        self.index.is_none()
    }

    pub fn score(&self) -> Option<f64> {
        match self.verdict.decision {
            Decision::Join { score, .. } => Some(score),
            _ => None,
        }
    }
}

pub struct PartitionEngine {
    config: Arc<ClusteringConfig>,
    discriminators: DiscriminatorChain,
    normalizer: SignalNormalizer,
    topics: TopicSet,
}

impl PartitionEngine {
    /// Build an engine over stored topics (in creation order).
    pub fn new(config: Arc<ClusteringConfig>, ctm_id: Uuid, stored: Vec<Topic>) -> Self {
        let mut normalizer = SignalNormalizer::new();
        let stored = stored
            .into_iter()
            .map(|mut topic| {
                topic.anchor = normalizer.intern_set(&topic.anchor);
                topic
            })
            .collect();
        let discriminators = DiscriminatorChain::from_rules(&config.discriminators);

        Self {
            config,
            discriminators,
            normalizer,
            topics: TopicSet::from_loaded(ctm_id, stored),
        }
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    pub fn normalize(&mut self, headline: &Headline) -> NormalizedHeadline {
        self.normalizer.normalize(headline)
    }

    /// Match, discriminate, and decide for one headline. Pure with respect to
    /// the topic state.
    pub fn decide(&self, headline: &NormalizedHeadline) -> Result<Verdict> {
        let bucket = classify_headline(headline);

        if headline.signals.is_empty() {
            return Ok(Verdict {
                decision: Decision::Catchall(CatchallReason::NoSignals),
                bucket,
                veto: None,
            });
        }

        let weights = self
            .config
            .weights_for(&headline.track)
            .ok_or_else(|| ClusterError::UnknownTrack {
                track: headline.track.clone(),
                ctm_id: self.topics.ctm_id(),
            })?;

        let mut veto = None;
        let best = best_candidate(
            &self.topics,
            &headline.signals,
            weights,
            self.config.join_threshold,
        );
        if let Some((candidate, topic)) =
            best.and_then(|c| self.topics.get(c.index).map(|topic| (c, topic)))
        {
            let ctx = MatchContext {
                headline,
                topic,
                score: &candidate.score,
                high_freq_persons: &self.config.high_freq_persons,
            };
            match self.discriminators.evaluate(&ctx) {
                None => {
                    return Ok(Verdict {
                        decision: Decision::Join {
                            index: candidate.index,
                            topic_id: candidate.topic_id,
                            score: candidate.score.score,
                        },
                        bucket,
                        veto: None,
                    });
                }
                Some(v) => {
                    debug!(
                        headline_id = %headline.id,
                        topic_id = %candidate.topic_id,
                        rule = v.rule,
                        reason = %v.reason,
                        "Join vetoed"
                    );
                    veto = Some(v);
                }
            }
        }

        let decision = if self.is_distinctive(&headline.signals) {
            Decision::Seed
        } else {
            Decision::Catchall(CatchallReason::NotDistinctive)
        };
        Ok(Verdict {
            decision,
            bucket,
            veto,
        })
    }

    /// Build the topic snapshot a verdict produces, without applying it.
    pub fn plan(&self, headline: &NormalizedHeadline, verdict: Verdict) -> Result<Plan> {
        let lock_threshold = self.config.anchor_lock_threshold;
        let ctm_id = self.topics.ctm_id();

        let (index, mut topic) = match &verdict.decision {
            Decision::Join { index, topic_id, .. } => {
                let topic = self.topics.get(*index).filter(|t| t.id == *topic_id).ok_or(
                    ClusterError::TopicNotInCtm {
                        topic_id: *topic_id,
                        ctm_id,
                    },
                )?;
                (Some(*index), topic.clone())
            }
            Decision::Seed => {
                let topic = Topic::seed(
                    ctm_id,
                    verdict.bucket.clone(),
                    &headline.signals,
                    headline.pubdate,
                    lock_threshold,
                );
                let added = topic.anchor.len();
                let absorption = if topic.is_locked() {
                    Absorption::Locked { added }
                } else {
                    Absorption::Extended { added }
                };
                return Ok(Plan {
                    headline_id: headline.id,
                    pubdate: headline.pubdate,
                    verdict,
                    topic,
                    index: None,
                    absorption,
                });
            }
            Decision::Catchall(_) => {
                let existing = self
                    .topics
                    .catchall_index(&verdict.bucket)
                    .and_then(|i| self.topics.get(i).map(|t| (i, t.clone())));
                match existing {
                    Some((index, topic)) => (Some(index), topic),
                    None => (
                        None,
                        Topic::catchall(ctm_id, verdict.bucket.clone(), headline.pubdate),
                    ),
                }
            }
        };

        let absorption = topic.absorb(&headline.signals, headline.pubdate, lock_threshold);
        Ok(Plan {
            headline_id: headline.id,
            pubdate: headline.pubdate,
            verdict,
            topic,
            index,
            absorption,
        })
    }

    /// Commit a plan to the in-memory state.
    pub fn apply(&mut self, plan: &Plan) {
        match plan.index {
            Some(index) => self.topics.replace(index, plan.topic.clone()),
            None => {
                self.topics.push(plan.topic.clone());
            }
        }
        debug!(
            headline_id = %plan.headline_id,
            topic_id = %plan.topic.id,
            bucket = %plan.topic.bucket,
            members = plan.topic.member_count,
            lock_state = %plan.topic.lock_state,
            "Applied clustering decision"
        );
    }

    /// True when the headline carries enough tokens outside the
    /// high-frequency persons list to define a topic of its own.
    fn is_distinctive(&self, signals: &SignalSet) -> bool {
        let distinctive = signals
            .tokens()
            .filter(|(signal_type, token)| {
                !(*signal_type == SignalType::Persons
                    && self.config.is_high_freq_person(token.as_str()))
            })
            .count();
        distinctive >= self.config.min_distinctive_tokens.max(1)
    }
}
