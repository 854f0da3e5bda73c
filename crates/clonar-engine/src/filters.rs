//! Lexical extraction of user-stated constraints ("under $200", "in Denver",
//! "for 2 guests") into per-vertical filters the planner merges into steps.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Number, Value};

use clonar_core::intent::IntentLabel;
use clonar_core::plan::ExtractedFilters;

static MAX_PRICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:under|below|less than|max(?:imum)?|up to|cheaper than|no more than)\s*\$?\s*(\d+(?:\.\d+)?)",
    )
    .unwrap()
});

static LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?i:in|near|around)\s+([A-Z][\w'.-]*(?:\s+[A-Z][\w'.-]*)*)").unwrap()
});

static GUESTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bfor\s+(\d{1,2})\s+(?:guests?|adults?|people|persons?|travell?ers?|passengers?)")
        .unwrap()
});

static ROUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?i:from)\s+([A-Z][\w'.-]*(?:\s+[A-Z][\w'.-]*)*)\s+(?i:to)\s+([A-Z][\w'.-]*(?:\s+[A-Z][\w'.-]*)*)")
        .unwrap()
});

fn max_price(query: &str) -> Option<Value> {
    let raw = MAX_PRICE.captures(query)?.get(1)?.as_str();
    let n: f64 = raw.parse().ok()?;
    if n.fract() == 0.0 {
        Some(Value::Number(Number::from(n as u64)))
    } else {
        Number::from_f64(n).map(Value::Number)
    }
}

fn location(query: &str) -> Option<Value> {
    let loc = LOCATION.captures(query)?.get(1)?.as_str().trim_end_matches(['.', ',']);
    Some(Value::String(loc.to_string()))
}

fn guests(query: &str) -> Option<Value> {
    let n: u64 = GUESTS.captures(query)?.get(1)?.as_str().parse().ok()?;
    (n > 0).then(|| Value::Number(n.into()))
}

fn put(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(v) = value {
        let _ = map.insert(key.to_string(), v);
    }
}

fn non_empty(map: Map<String, Value>) -> Option<Map<String, Value>> {
    (!map.is_empty()).then_some(map)
}

/// Pull constraints for the vertical `intent` points at.
pub fn extract_filters(query: &str, intent: IntentLabel) -> ExtractedFilters {
    let mut filters = ExtractedFilters::default();
    match intent {
        IntentLabel::Hotel => {
            let mut m = Map::new();
            put(&mut m, "max_price", max_price(query));
            put(&mut m, "location", location(query));
            put(&mut m, "guests", guests(query));
            filters.hotel = non_empty(m);
        }
        IntentLabel::Product => {
            let mut m = Map::new();
            put(&mut m, "max_price", max_price(query));
            filters.product = non_empty(m);
        }
        IntentLabel::Flight => {
            let mut m = Map::new();
            if let Some(caps) = ROUTE.captures(query) {
                put(&mut m, "origin", caps.get(1).map(|c| Value::String(c.as_str().to_string())));
                put(
                    &mut m,
                    "destination",
                    caps.get(2).map(|c| Value::String(c.as_str().to_string())),
                );
            }
            put(&mut m, "passengers", guests(query));
            put(&mut m, "max_price", max_price(query));
            filters.flight = non_empty(m);
        }
        IntentLabel::Movie => {
            let mut m = Map::new();
            put(&mut m, "location", location(query));
            filters.movie = non_empty(m);
        }
        IntentLabel::Place | IntentLabel::General => {}
    }
    filters
}
