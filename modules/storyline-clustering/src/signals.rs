//! Signal normalization.
//!
//! Turns a headline's loosely-shaped per-type token arrays into a fixed-shape
//! `SignalSet` of interned tokens. One normalizer lives for one clustering
//! pass, so every occurrence of "fed" in that pass shares a single allocation.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use storyline_common::{Headline, RawSignals, SignalSet, SignalType, Token};

/// Deduplicating string pool.
#[derive(Debug, Default)]
pub struct Interner {
    tokens: HashSet<Token>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, value: &str) -> Token {
        if let Some(existing) = self.tokens.get(value) {
            return existing.clone();
        }
        let token = Token::new(value);
        self.tokens.insert(token.clone());
        token
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

pub use storyline_common::normalize_token;

/// A headline reduced to what the clustering loop reads.
#[derive(Debug, Clone)]
pub struct NormalizedHeadline {
    pub id: Uuid,
    pub pubdate: DateTime<Utc>,
    pub track: String,
    pub signals: SignalSet,
    pub home_iso_codes: BTreeSet<String>,
    /// Normalized entity token -> raw country code as supplied upstream.
    pub entity_countries: BTreeMap<Token, String>,
}

impl NormalizedHeadline {
    /// Country codes attached to the headline's place and org tokens.
    pub fn place_and_org_countries(&self) -> impl Iterator<Item = &str> {
        [SignalType::Places, SignalType::Orgs]
            .into_iter()
            .flat_map(move |t| self.signals.get(t).iter())
            .filter_map(move |token| self.entity_countries.get(token).map(String::as_str))
    }
}

#[derive(Debug, Default)]
pub struct SignalNormalizer {
    interner: Interner,
}

impl SignalNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(&mut self, headline: &Headline) -> NormalizedHeadline {
        let entity_countries = headline
            .entity_countries
            .iter()
            .filter_map(|(entity, code)| {
                normalize_token(entity).map(|e| (self.interner.intern(&e), code.clone()))
            })
            .collect();

        NormalizedHeadline {
            id: headline.id,
            pubdate: headline.pubdate,
            track: headline.track.clone(),
            signals: self.normalize_signals(&headline.signals),
            home_iso_codes: headline.home_iso_codes.clone(),
            entity_countries,
        }
    }

    pub fn normalize_signals(&mut self, raw: &RawSignals) -> SignalSet {
        let mut set = SignalSet::new();
        for signal_type in SignalType::ALL {
            for value in raw.field(signal_type) {
                if let Some(normalized) = normalize_token(value) {
                    set.insert(signal_type, self.interner.intern(&normalized));
                }
            }
        }
        set
    }

    /// Re-intern a set loaded from storage so it shares this pass's pool.
    pub fn intern_set(&mut self, set: &SignalSet) -> SignalSet {
        let mut interned = SignalSet::new();
        for (signal_type, token) in set.tokens() {
            interned.insert(signal_type, self.interner.intern(token.as_str()));
        }
        interned
    }

    pub fn interned_count(&self) -> usize {
        self.interner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_lowercased_and_whitespace_collapsed() {
        assert_eq!(normalize_token("  Federal   Reserve "), Some("federal reserve".into()));
        assert_eq!(normalize_token("   "), None);
    }

    #[test]
    fn duplicate_and_empty_tokens_collapse() {
        let mut normalizer = SignalNormalizer::new();
        let raw = RawSignals::default().with(SignalType::Orgs, &["FED", "fed", " ", "Fed "]);
        let set = normalizer.normalize_signals(&raw);
        assert_eq!(set.len(), 1);
        assert!(set.contains(SignalType::Orgs, "fed"));
    }

    #[test]
    fn same_token_across_headlines_shares_allocation() {
        let mut normalizer = SignalNormalizer::new();
        let a = normalizer.normalize_signals(&RawSignals::default().with(SignalType::Orgs, &["fed"]));
        let b = normalizer
            .normalize_signals(&RawSignals::default().with(SignalType::Persons, &["Fed"]));
        let ta = a.get(SignalType::Orgs).iter().next().unwrap();
        let tb = b.get(SignalType::Persons).iter().next().unwrap();
        assert!(ta.ptr_eq(tb));
        assert_eq!(normalizer.interned_count(), 1);
    }

    #[test]
    fn place_and_org_countries_skip_other_types() {
        let mut normalizer = SignalNormalizer::new();
        let headline = Headline::builder()
            .ctm_id(Uuid::new_v4())
            .pubdate(Utc::now())
            .track("geo_security")
            .signals(
                RawSignals::default()
                    .with(SignalType::Places, &["Kyiv"])
                    .with(SignalType::Persons, &["Zelensky"]),
            )
            .entity_countries(BTreeMap::from([
                ("kyiv".to_string(), "UA".to_string()),
                ("zelensky".to_string(), "UA".to_string()),
            ]))
            .build();
        let normalized = normalizer.normalize(&headline);
        assert_eq!(normalized.place_and_org_countries().collect::<Vec<_>>(), vec!["UA"]);
    }
}
