use serde::{Deserialize, Serialize};

use crate::plan::ToolKind;

/// Query intent categories, in the order the lexical stage tries them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentLabel {
    Hotel,
    Flight,
    Product,
    Place,
    Movie,
    General,
}

impl IntentLabel {
    pub const ALL: [IntentLabel; 6] = [
        Self::Hotel,
        Self::Flight,
        Self::Product,
        Self::Place,
        Self::Movie,
        Self::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hotel => "hotel",
            Self::Flight => "flight",
            Self::Product => "product",
            Self::Place => "place",
            Self::Movie => "movie",
            Self::General => "general",
        }
    }

    /// Lenient parse of a label emitted by a model ("Hotels", "shopping", ...).
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let s = raw.trim().trim_matches('"').to_ascii_lowercase();
        let s = s.trim_end_matches('s');
        match s {
            "hotel" | "lodging" | "accommodation" => Some(Self::Hotel),
            "flight" | "travel" => Some(Self::Flight),
            "product" | "shopping" | "shop" => Some(Self::Product),
            "place" | "local" | "restaurant" => Some(Self::Place),
            "movie" | "film" => Some(Self::Movie),
            "general" | "other" | "chat" => Some(Self::General),
            _ => None,
        }
    }

    /// The retrieval tool that serves this vertical.
    pub fn primary_tool(&self) -> ToolKind {
        match self {
            Self::Hotel => ToolKind::HotelSearch,
            Self::Flight => ToolKind::FlightSearch,
            Self::Product => ToolKind::ProductSearch,
            Self::Place => ToolKind::PlaceSearch,
            Self::Movie => ToolKind::MovieSearch,
            Self::General => ToolKind::WebSearch,
        }
    }
}

impl std::fmt::Display for IntentLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which cascade stage produced the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Lexical,
    Llm,
    Embedding,
    Default,
}

/// Immutable classification result, produced fresh per query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub label: IntentLabel,
    pub confidence: f32,
    pub source: IntentSource,
}

impl IntentResult {
    pub fn new(label: IntentLabel, confidence: f32, source: IntentSource) -> Self {
        Self {
            label,
            confidence: confidence.clamp(0.0, 1.0),
            source,
        }
    }

    /// Result when every stage was inconclusive.
    pub fn general() -> Self {
        Self::new(IntentLabel::General, 0.0, IntentSource::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_loose_accepts_synonyms() {
        assert_eq!(IntentLabel::parse_loose("Hotels"), Some(IntentLabel::Hotel));
        assert_eq!(IntentLabel::parse_loose("shopping"), Some(IntentLabel::Product));
        assert_eq!(IntentLabel::parse_loose(" \"movie\" "), Some(IntentLabel::Movie));
        assert_eq!(IntentLabel::parse_loose("weather"), None);
    }

    #[test]
    fn confidence_is_clamped() {
        let r = IntentResult::new(IntentLabel::Place, 1.7, IntentSource::Llm);
        assert_eq!(r.confidence, 1.0);
        let r = IntentResult::new(IntentLabel::Place, -0.2, IntentSource::Llm);
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn general_has_zero_confidence() {
        let r = IntentResult::general();
        assert_eq!(r.label, IntentLabel::General);
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.source, IntentSource::Default);
    }
}
