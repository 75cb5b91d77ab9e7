//! Weighted multi-signal similarity between a headline and topic anchors.
//!
//! For each signal type the headline carries, the share of its tokens found
//! in the anchor is weighted by the track's weight for that type. The sum is
//! normalized by the total weight of the types present, so scores from
//! headlines with different signal shapes stay comparable in [0, 1].

use uuid::Uuid;

use storyline_common::{SignalSet, SignalType, Token, TrackWeights};

use crate::topic::TopicSet;

/// One signal type's part of a match.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeContribution {
    pub signal_type: SignalType,
    pub weight: f64,
    /// Headline tokens of this type that are also in the anchor.
    pub matched: Vec<Token>,
    /// Number of headline tokens of this type.
    pub headline_len: usize,
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchScore {
    pub score: f64,
    /// Sum of per-type contributions, before normalization.
    pub weighted_total: f64,
    /// Sum of weights over the headline's non-empty types.
    pub normalizer: f64,
    pub contributions: Vec<TypeContribution>,
}

impl MatchScore {
    pub fn matched_tokens(&self) -> impl Iterator<Item = (SignalType, &Token)> {
        self.contributions
            .iter()
            .flat_map(|c| c.matched.iter().map(move |t| (c.signal_type, t)))
    }

    pub fn has_overlap(&self) -> bool {
        self.contributions.iter().any(|c| !c.matched.is_empty())
    }

    pub fn contribution_of(&self, signal_type: SignalType) -> Option<&TypeContribution> {
        self.contributions
            .iter()
            .find(|c| c.signal_type == signal_type)
    }
}

pub fn score(headline: &SignalSet, anchor: &SignalSet, weights: &TrackWeights) -> MatchScore {
    let mut contributions = Vec::new();
    let mut weighted_total = 0.0;
    let mut normalizer = 0.0;

    for (signal_type, tokens) in headline.iter() {
        if tokens.is_empty() {
            continue;
        }
        let weight = weights.weight(signal_type);
        let matched: Vec<Token> = tokens
            .iter()
            .filter(|t| anchor.contains(signal_type, t.as_str()))
            .cloned()
            .collect();
        let contribution = weight * matched.len() as f64 / tokens.len().max(1) as f64;

        weighted_total += contribution;
        normalizer += weight;
        contributions.push(TypeContribution {
            signal_type,
            weight,
            matched,
            headline_len: tokens.len(),
            contribution,
        });
    }

    let score = if normalizer > 0.0 {
        (weighted_total / normalizer).clamp(0.0, 1.0)
    } else {
        0.0
    };

    MatchScore {
        score,
        weighted_total,
        normalizer,
        contributions,
    }
}

/// The best qualifying topic for a headline.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub index: usize,
    pub topic_id: Uuid,
    pub score: MatchScore,
}

/// Highest-scoring thematic topic at or above `join_threshold`.
/// Ties go to the topic created first.
pub fn best_candidate(
    topics: &TopicSet,
    headline: &SignalSet,
    weights: &TrackWeights,
    join_threshold: f64,
) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;

    for (index, topic) in topics.thematic() {
        let scored = score(headline, &topic.anchor, weights);
        if !scored.has_overlap() || scored.score < join_threshold {
            continue;
        }
        let better = match &best {
            Some(current) => scored.score > current.score.score,
            None => true,
        };
        if better {
            best = Some(Candidate {
                index,
                topic_id: topic.id,
                score: scored,
            });
        }
    }

    best
}
