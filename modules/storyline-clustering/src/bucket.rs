//! Geographic scope classification.
//!
//! A headline is `domestic` when every country it mentions is one of its
//! centroid's home countries, `bilateral-XX` when exactly one foreign country
//! appears, and `other_international` otherwise.

use std::collections::BTreeSet;

use storyline_common::{Bucket, CountryCode};

use crate::signals::NormalizedHeadline;

/// Parse a set of raw home codes, dropping malformed entries.
pub fn home_codes<'a>(raw: impl IntoIterator<Item = &'a String>) -> BTreeSet<CountryCode> {
    raw.into_iter()
        .filter_map(|code| CountryCode::parse(code))
        .collect()
}

/// Foreign countries among `entity_codes`, or `None` when any code is malformed.
pub fn foreign_countries<'a>(
    entity_codes: impl IntoIterator<Item = &'a str>,
    home: &BTreeSet<CountryCode>,
) -> Option<BTreeSet<CountryCode>> {
    let mut foreign = BTreeSet::new();
    for raw in entity_codes {
        let code = CountryCode::parse(raw)?;
        if !home.contains(&code) {
            foreign.insert(code);
        }
    }
    Some(foreign)
}

pub fn classify<'a>(
    entity_codes: impl IntoIterator<Item = &'a str>,
    home: &BTreeSet<CountryCode>,
) -> Bucket {
    let Some(foreign) = foreign_countries(entity_codes, home) else {
        return Bucket::OtherInternational;
    };

    // A centroid without home countries has nothing to be bilateral with.
    if home.is_empty() && !foreign.is_empty() {
        return Bucket::OtherInternational;
    }

    let mut iter = foreign.into_iter();
    match (iter.next(), iter.next()) {
        (None, _) => Bucket::Domestic,
        (Some(only), None) => Bucket::Bilateral(only),
        (Some(_), Some(_)) => Bucket::OtherInternational,
    }
}

pub fn classify_headline(headline: &NormalizedHeadline) -> Bucket {
    let home = home_codes(&headline.home_iso_codes);
    classify(headline.entity_countries.values().map(String::as_str), &home)
}
