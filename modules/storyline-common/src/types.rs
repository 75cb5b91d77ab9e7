use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Index;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::StorylineError;

// --- Signal Types ---

/// The typed signal axes produced by the upstream label extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Persons,
    Orgs,
    Places,
    Commodities,
    Policies,
    Systems,
    NamedEvents,
}

impl SignalType {
    pub const COUNT: usize = 7;

    pub const ALL: [SignalType; Self::COUNT] = [
        SignalType::Persons,
        SignalType::Orgs,
        SignalType::Places,
        SignalType::Commodities,
        SignalType::Policies,
        SignalType::Systems,
        SignalType::NamedEvents,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Persons => "persons",
            SignalType::Orgs => "orgs",
            SignalType::Places => "places",
            SignalType::Commodities => "commodities",
            SignalType::Policies => "policies",
            SignalType::Systems => "systems",
            SignalType::NamedEvents => "named_events",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalType {
    type Err = StorylineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SignalType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StorylineError::Validation(format!("unknown signal type '{s}'")))
    }
}

// --- Tokens ---

/// An interned, normalized signal token. Clones share one allocation.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(Arc<str>);

impl Token {
    pub fn new(value: &str) -> Self {
        Self(Arc::from(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when both tokens point at the same interned allocation.
    pub fn ptr_eq(&self, other: &Token) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Arc<str>> for Token {
    fn from(value: Arc<str>) -> Self {
        Self(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for Token {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// Lowercase, trim and collapse inner whitespace. Empty input yields `None`.
pub fn normalize_token(raw: &str) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined.to_lowercase())
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Token::from(Arc::<str>::from(s)))
    }
}

// --- Signal Sets ---

/// Wire shape of a headline's signals: one token array per signal type.
///
/// This is the upstream extractor's output and the JSONB layout of persisted
/// anchors. Missing keys, `null` arrays and `null` entries deserialize as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSignals {
    #[serde(deserialize_with = "tokens_or_empty")]
    pub persons: Vec<String>,
    #[serde(deserialize_with = "tokens_or_empty")]
    pub orgs: Vec<String>,
    #[serde(deserialize_with = "tokens_or_empty")]
    pub places: Vec<String>,
    #[serde(deserialize_with = "tokens_or_empty")]
    pub commodities: Vec<String>,
    #[serde(deserialize_with = "tokens_or_empty")]
    pub policies: Vec<String>,
    #[serde(deserialize_with = "tokens_or_empty")]
    pub systems: Vec<String>,
    #[serde(deserialize_with = "tokens_or_empty")]
    pub named_events: Vec<String>,
}

fn tokens_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let tokens = Option::<Vec<Option<String>>>::deserialize(deserializer)?;
    Ok(tokens.into_iter().flatten().flatten().collect())
}

fn signals_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RawSignals, D::Error> {
    Ok(Option::<RawSignals>::deserialize(deserializer)?.unwrap_or_default())
}

/// Entity -> country map with `null` maps and `null` codes dropped.
pub fn entity_countries_or_empty<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    let map = Option::<BTreeMap<String, Option<String>>>::deserialize(deserializer)?;
    Ok(map
        .into_iter()
        .flatten()
        .filter_map(|(entity, code)| code.map(|code| (entity, code)))
        .collect())
}

/// JSONB decode shape for a stored `entity_countries` column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EntityCountries(
    #[serde(deserialize_with = "entity_countries_or_empty")] pub BTreeMap<String, String>,
);

impl RawSignals {
    pub fn field(&self, signal_type: SignalType) -> &[String] {
        match signal_type {
            SignalType::Persons => &self.persons,
            SignalType::Orgs => &self.orgs,
            SignalType::Places => &self.places,
            SignalType::Commodities => &self.commodities,
            SignalType::Policies => &self.policies,
            SignalType::Systems => &self.systems,
            SignalType::NamedEvents => &self.named_events,
        }
    }

    pub fn field_mut(&mut self, signal_type: SignalType) -> &mut Vec<String> {
        match signal_type {
            SignalType::Persons => &mut self.persons,
            SignalType::Orgs => &mut self.orgs,
            SignalType::Places => &mut self.places,
            SignalType::Commodities => &mut self.commodities,
            SignalType::Policies => &mut self.policies,
            SignalType::Systems => &mut self.systems,
            SignalType::NamedEvents => &mut self.named_events,
        }
    }

    /// Builder-style helper: append tokens to one signal type.
    pub fn with(mut self, signal_type: SignalType, tokens: &[&str]) -> Self {
        self.field_mut(signal_type)
            .extend(tokens.iter().map(|t| t.to_string()));
        self
    }
}

/// A fixed-shape, type-keyed set of normalized tokens.
///
/// Sets are ordered so that serialized anchors are byte-stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSignals", into = "RawSignals")]
pub struct SignalSet {
    sets: [BTreeSet<Token>; SignalType::COUNT],
}

impl SignalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, signal_type: SignalType) -> &BTreeSet<Token> {
        &self.sets[signal_type.slot()]
    }

    pub fn insert(&mut self, signal_type: SignalType, token: Token) -> bool {
        self.sets[signal_type.slot()].insert(token)
    }

    pub fn contains(&self, signal_type: SignalType, token: &str) -> bool {
        self.sets[signal_type.slot()].contains(token)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(BTreeSet::is_empty)
    }

    /// Total number of tokens across all types.
    pub fn len(&self) -> usize {
        self.sets.iter().map(BTreeSet::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SignalType, &BTreeSet<Token>)> {
        SignalType::ALL.into_iter().map(move |t| (t, self.get(t)))
    }

    /// Every (type, token) pair, in type order then token order.
    pub fn tokens(&self) -> impl Iterator<Item = (SignalType, &Token)> {
        self.iter()
            .flat_map(|(t, set)| set.iter().map(move |token| (t, token)))
    }

    /// Union `other` into `self`, returning how many tokens were new.
    pub fn union_with(&mut self, other: &SignalSet) -> usize {
        let mut added = 0;
        for (signal_type, token) in other.tokens() {
            if self.insert(signal_type, token.clone()) {
                added += 1;
            }
        }
        added
    }
}

impl Index<SignalType> for SignalSet {
    type Output = BTreeSet<Token>;

    fn index(&self, signal_type: SignalType) -> &Self::Output {
        self.get(signal_type)
    }
}

impl From<RawSignals> for SignalSet {
    fn from(raw: RawSignals) -> Self {
        let mut set = SignalSet::default();
        for signal_type in SignalType::ALL {
            for value in raw.field(signal_type) {
                if !value.is_empty() {
                    set.insert(signal_type, Token::new(value));
                }
            }
        }
        set
    }
}

impl From<SignalSet> for RawSignals {
    fn from(set: SignalSet) -> Self {
        let mut raw = RawSignals::default();
        for (signal_type, tokens) in set.iter() {
            *raw.field_mut(signal_type) = tokens.iter().map(|t| t.as_str().to_string()).collect();
        }
        raw
    }
}

// --- Geography ---

/// An upper-case ISO-3166 alpha-2 country code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CountryCode(String);

impl CountryCode {
    /// Parse a two-letter code, case-insensitively. Anything else is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            Some(Self(trimmed.to_ascii_uppercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CountryCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Geographic scope of a headline or topic relative to its centroid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    Domestic,
    Bilateral(CountryCode),
    OtherInternational,
}

impl Bucket {
    pub fn country(&self) -> Option<&CountryCode> {
        match self {
            Bucket::Bilateral(code) => Some(code),
            _ => None,
        }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bucket::Domestic => write!(f, "domestic"),
            Bucket::Bilateral(code) => write!(f, "bilateral-{code}"),
            Bucket::OtherInternational => write!(f, "other_international"),
        }
    }
}

impl FromStr for Bucket {
    type Err = StorylineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "domestic" => Ok(Bucket::Domestic),
            "other_international" => Ok(Bucket::OtherInternational),
            other => other
                .strip_prefix("bilateral-")
                .and_then(CountryCode::parse)
                .map(Bucket::Bilateral)
                .ok_or_else(|| StorylineError::Validation(format!("unknown bucket '{s}'"))),
        }
    }
}

impl Serialize for Bucket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Bucket {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// --- Topic Lifecycle ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Anchor still absorbs the signals of joining headlines.
    Forming,
    /// Anchor frozen for good.
    Locked,
}

impl LockState {
    pub fn as_str(self) -> &'static str {
        match self {
            LockState::Forming => "forming",
            LockState::Locked => "locked",
        }
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockState {
    type Err = StorylineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forming" => Ok(LockState::Forming),
            "locked" => Ok(LockState::Locked),
            _ => Err(StorylineError::Validation(format!("unknown lock state '{s}'"))),
        }
    }
}

// --- Inputs ---

/// A headline as handed over by the upstream tagging and gating phases.
#[derive(Debug, Clone, TypedBuilder, Serialize, Deserialize)]
pub struct Headline {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub ctm_id: Uuid,
    pub pubdate: DateTime<Utc>,
    #[builder(setter(into))]
    pub track: String,
    #[builder(default, setter(into, strip_option))]
    pub title: Option<String>,
    /// Home ISO codes of the headline's centroid.
    #[builder(default)]
    pub home_iso_codes: BTreeSet<String>,
    #[builder(default)]
    #[serde(default, deserialize_with = "signals_or_empty")]
    pub signals: RawSignals,
    /// Entity token -> ISO alpha-2 code, from the alias matcher.
    #[builder(default)]
    #[serde(default, deserialize_with = "entity_countries_or_empty")]
    pub entity_countries: BTreeMap<String, String>,
}

/// A Centroid x Track x Month partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ctm {
    pub id: Uuid,
    pub centroid_id: String,
    pub track: String,
    pub month: NaiveDate,
    pub home_iso_codes: Vec<String>,
    pub is_frozen: bool,
    pub last_clustered_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_set_round_trips_through_raw_shape() {
        let raw = RawSignals::default()
            .with(SignalType::Orgs, &["fed", "ecb"])
            .with(SignalType::NamedEvents, &["jackson hole"]);
        let set = SignalSet::from(raw);

        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["orgs"], serde_json::json!(["ecb", "fed"]));
        assert_eq!(json["persons"], serde_json::json!([]));

        let back: SignalSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn missing_signal_keys_deserialize_empty() {
        let set: SignalSet = serde_json::from_str(r#"{"places": ["gaza"]}"#).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(SignalType::Places, "gaza"));
        assert!(set.get(SignalType::Persons).is_empty());
    }

    #[test]
    fn null_signal_arrays_deserialize_empty() {
        let raw: RawSignals =
            serde_json::from_str(r#"{"persons": null, "orgs": ["fed", null]}"#).unwrap();
        assert!(raw.persons.is_empty());
        assert_eq!(raw.orgs, vec!["fed".to_string()]);

        let set: SignalSet = serde_json::from_str(r#"{"places": null}"#).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn null_entity_countries_deserialize_empty() {
        let countries: EntityCountries = serde_json::from_str("null").unwrap();
        assert!(countries.0.is_empty());

        let countries: EntityCountries =
            serde_json::from_str(r#"{"beijing": "CN", "gaza": null}"#).unwrap();
        assert_eq!(
            countries.0,
            BTreeMap::from([("beijing".to_string(), "CN".to_string())])
        );

        let headline: Headline = serde_json::from_value(serde_json::json!({
            "id": Uuid::nil(),
            "ctm_id": Uuid::nil(),
            "pubdate": "2026-03-01T00:00:00Z",
            "track": "geo_economy",
            "title": null,
            "home_iso_codes": ["US"],
            "signals": null,
            "entity_countries": null,
        }))
        .unwrap();
        assert!(headline.signals.persons.is_empty());
        assert!(headline.entity_countries.is_empty());
    }

    #[test]
    fn union_reports_only_new_tokens() {
        let mut a = SignalSet::from(RawSignals::default().with(SignalType::Orgs, &["fed"]));
        let b = SignalSet::from(
            RawSignals::default()
                .with(SignalType::Orgs, &["fed", "imf"])
                .with(SignalType::Persons, &["powell"]),
        );
        assert_eq!(a.union_with(&b), 2);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn bucket_parses_its_display_form() {
        for bucket in [
            Bucket::Domestic,
            Bucket::Bilateral(CountryCode::parse("cn").unwrap()),
            Bucket::OtherInternational,
        ] {
            assert_eq!(bucket.to_string().parse::<Bucket>().unwrap(), bucket);
        }
        assert_eq!(Bucket::Bilateral(CountryCode::parse("cn").unwrap()).to_string(), "bilateral-CN");
        assert!("bilateral-xyz".parse::<Bucket>().is_err());
    }

    #[test]
    fn country_code_rejects_malformed_values() {
        assert!(CountryCode::parse("usa").is_none());
        assert!(CountryCode::parse("1a").is_none());
        assert_eq!(CountryCode::parse(" de ").unwrap().as_str(), "DE");
    }

    #[test]
    fn signal_type_parses_wire_names() {
        assert_eq!("named_events".parse::<SignalType>().unwrap(), SignalType::NamedEvents);
        assert!("people".parse::<SignalType>().is_err());
    }
}
