//! Veto rules applied to the best-scoring candidate before a join commits.
//!
//! Each rule is a named type behind the `Discriminator` trait, built from the
//! ordered `[[discriminators]]` list in the clustering config. The scorer knows
//! nothing about them; adding a rule means adding a type and a config variant.

use std::collections::BTreeSet;

use storyline_common::{Bucket, CountryCode, DiscriminatorRule, SignalType};

use crate::bucket::{foreign_countries, home_codes};
use crate::scorer::MatchScore;
use crate::signals::NormalizedHeadline;
use crate::topic::Topic;

/// Everything a rule may look at for one headline/topic pair.
pub struct MatchContext<'a> {
    pub headline: &'a NormalizedHeadline,
    pub topic: &'a Topic,
    pub score: &'a MatchScore,
    pub high_freq_persons: &'a BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Veto {
    pub rule: &'static str,
    pub reason: String,
}

pub trait Discriminator: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// `Some` rejects the join.
    fn veto(&self, ctx: &MatchContext<'_>) -> Option<Veto>;
}

// ---------------------------------------------------------------------------
// Generic-signal dominance
// ---------------------------------------------------------------------------

/// Rejects matches carried by ubiquitous actors alone.
#[derive(Debug, Clone)]
pub struct GenericSignalDominance {
    pub max_share: f64,
}

impl Discriminator for GenericSignalDominance {
    fn name(&self) -> &'static str {
        "generic_signal_dominance"
    }

    fn veto(&self, ctx: &MatchContext<'_>) -> Option<Veto> {
        if ctx.score.weighted_total <= 0.0 {
            return None;
        }

        let mut generic = 0.0;
        let mut other_overlap = false;
        for c in &ctx.score.contributions {
            let mut generic_matches = 0usize;
            for token in &c.matched {
                if c.signal_type == SignalType::Persons
                    && ctx.high_freq_persons.contains(token.as_str())
                {
                    generic_matches += 1;
                } else {
                    other_overlap = true;
                }
            }
            generic += c.weight * generic_matches as f64 / c.headline_len.max(1) as f64;
        }

        let share = generic / ctx.score.weighted_total;
        if other_overlap || share <= self.max_share {
            return None;
        }

        let actors: Vec<&str> = ctx
            .score
            .matched_tokens()
            .map(|(_, t)| t.as_str())
            .collect();
        Some(Veto {
            rule: self.name(),
            reason: format!(
                "match carried only by high-frequency persons {actors:?} ({:.0}% of score)",
                share * 100.0
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Geographic conflict
// ---------------------------------------------------------------------------

/// Rejects joining a `bilateral-XX` topic from a headline whose places and
/// orgs point at foreign countries other than `XX` and at no home country.
#[derive(Debug, Clone, Default)]
pub struct GeographicConflict;

impl Discriminator for GeographicConflict {
    fn name(&self) -> &'static str {
        "geographic_conflict"
    }

    fn veto(&self, ctx: &MatchContext<'_>) -> Option<Veto> {
        let Bucket::Bilateral(topic_country) = &ctx.topic.bucket else {
            return None;
        };

        let home = home_codes(&ctx.headline.home_iso_codes);
        let domestic_overlap = ctx
            .headline
            .place_and_org_countries()
            .filter_map(CountryCode::parse)
            .any(|code| home.contains(&code));
        if domestic_overlap {
            return None;
        }

        // Malformed codes give no reliable signal either way.
        let foreign = foreign_countries(ctx.headline.place_and_org_countries(), &home)?;
        if foreign.is_empty() || foreign.contains(topic_country) {
            return None;
        }

        let named: Vec<&str> = foreign.iter().map(|c| c.as_str()).collect();
        Some(Veto {
            rule: self.name(),
            reason: format!(
                "topic is bilateral-{topic_country}, headline names {}",
                named.join(",")
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Named-event conflict
// ---------------------------------------------------------------------------

/// Rejects a match when both sides name events and none of them coincide.
#[derive(Debug, Clone, Default)]
pub struct NamedEventConflict;

impl Discriminator for NamedEventConflict {
    fn name(&self) -> &'static str {
        "named_event_conflict"
    }

    fn veto(&self, ctx: &MatchContext<'_>) -> Option<Veto> {
        let anchor_events = ctx.topic.anchor.get(SignalType::NamedEvents);
        let headline_events = ctx.headline.signals.get(SignalType::NamedEvents);
        if anchor_events.is_empty() || headline_events.is_empty() {
            return None;
        }
        if headline_events.iter().any(|e| anchor_events.contains(e)) {
            return None;
        }
        Some(Veto {
            rule: self.name(),
            reason: format!(
                "headline events {:?} disjoint from topic events {:?}",
                headline_events, anchor_events
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Configured rules in order. The first veto wins.
#[derive(Debug, Default)]
pub struct DiscriminatorChain {
    rules: Vec<Box<dyn Discriminator>>,
}

impl DiscriminatorChain {
    pub fn from_rules(rules: &[DiscriminatorRule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| -> Box<dyn Discriminator> {
                match rule {
                    DiscriminatorRule::GenericSignalDominance { max_share } => {
                        Box::new(GenericSignalDominance {
                            max_share: *max_share,
                        })
                    }
                    DiscriminatorRule::GeographicConflict => Box::new(GeographicConflict),
                    DiscriminatorRule::NamedEventConflict => Box::new(NamedEventConflict),
                }
            })
            .collect();
        Self { rules }
    }

    pub fn push(&mut self, rule: Box<dyn Discriminator>) {
        self.rules.push(rule);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn evaluate(&self, ctx: &MatchContext<'_>) -> Option<Veto> {
        self.rules.iter().find_map(|rule| rule.veto(ctx))
    }
}
