use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Hard cap on plan length.
pub const MAX_STEPS: usize = 4;

/// Closed set of retrieval tools a plan may reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    HotelSearch,
    FlightSearch,
    ProductSearch,
    PlaceSearch,
    MovieSearch,
    /// Generic search, also used as the fallback step.
    WebSearch,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        Self::HotelSearch,
        Self::FlightSearch,
        Self::ProductSearch,
        Self::PlaceSearch,
        Self::MovieSearch,
        Self::WebSearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HotelSearch => "hotel_search",
            Self::FlightSearch => "flight_search",
            Self::ProductSearch => "product_search",
            Self::PlaceSearch => "place_search",
            Self::MovieSearch => "movie_search",
            Self::WebSearch => "web_search",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Tools that take a free-text `query` argument.
    pub fn requires_query(&self) -> bool {
        !matches!(self, Self::FlightSearch)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::HotelSearch => "hotels and lodging; args: query, location, check_in, check_out, guests, max_price",
            Self::FlightSearch => "flights; args: origin, destination, depart_date, return_date, passengers, max_price",
            Self::ProductSearch => "shopping products; args: query, max_price, brand, category",
            Self::PlaceSearch => "local places, restaurants, attractions; args: query, location",
            Self::MovieSearch => "movies and showtimes; args: query, location, genre",
            Self::WebSearch => "general web search; args: query",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool invocation in a plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalStep {
    pub tool: ToolKind,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// 1-based index of an earlier step whose output feeds this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_from_step: Option<usize>,
}

impl RetrievalStep {
    pub fn new(tool: ToolKind) -> Self {
        Self {
            tool,
            args: Map::new(),
            context_from_step: None,
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        let _ = self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn with_context_from(mut self, step: usize) -> Self {
        self.context_from_step = Some(step);
        self
    }
}

/// A repair applied while validating model output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "repair", rename_all = "snake_case")]
pub enum PlanRepair {
    /// The model output could not be parsed into steps.
    Unparseable,
    DroppedUnknownTool { position: usize, tool: String },
    DroppedBadReference { position: usize, reference: usize },
    Truncated { dropped: usize },
    InjectedQuery { step: usize },
    MergedFilters { step: usize, keys: Vec<String> },
    Fallback,
}

/// Validated plan: 1..=MAX_STEPS steps, every `context_from_step` pointing
/// strictly backwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalPlan {
    pub steps: Vec<RetrievalStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<PlanRepair>,
}

impl RetrievalPlan {
    /// Single generic search step carrying the query.
    pub fn fallback(query: &str) -> Self {
        Self {
            steps: vec![RetrievalStep::new(ToolKind::WebSearch).with_arg("query", query)],
            repairs: vec![PlanRepair::Fallback],
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.repairs.contains(&PlanRepair::Fallback)
    }

    /// Whether every dependency references a strictly earlier step.
    pub fn references_are_backward(&self) -> bool {
        self.steps.iter().enumerate().all(|(i, step)| match step.context_from_step {
            Some(dep) => dep >= 1 && dep < i + 1,
            None => true,
        })
    }
}

/// User-stated constraints per vertical, extracted before planning.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotel: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flight: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movie: Option<Map<String, Value>>,
}

impl ExtractedFilters {
    /// Filters that apply to steps of the given tool.
    pub fn for_tool(&self, tool: ToolKind) -> Option<&Map<String, Value>> {
        match tool {
            ToolKind::HotelSearch => self.hotel.as_ref(),
            ToolKind::FlightSearch => self.flight.as_ref(),
            ToolKind::ProductSearch => self.product.as_ref(),
            ToolKind::MovieSearch => self.movie.as_ref(),
            ToolKind::PlaceSearch | ToolKind::WebSearch => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        [&self.hotel, &self.flight, &self.product, &self.movie]
            .iter()
            .all(|f| f.as_ref().map_or(true, |m| m.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_kind_round_trips_through_name() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ToolKind::parse("weather_search"), None);
    }

    #[test]
    fn flight_search_takes_no_free_text() {
        assert!(!ToolKind::FlightSearch.requires_query());
        assert!(ToolKind::HotelSearch.requires_query());
    }

    #[test]
    fn fallback_plan_is_single_web_search() {
        let plan = RetrievalPlan::fallback("hotels in Austin");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, ToolKind::WebSearch);
        assert_eq!(plan.steps[0].args["query"], "hotels in Austin");
        assert!(plan.is_fallback());
    }

    #[test]
    fn backward_reference_check() {
        let ok = RetrievalPlan {
            steps: vec![
                RetrievalStep::new(ToolKind::PlaceSearch),
                RetrievalStep::new(ToolKind::HotelSearch).with_context_from(1),
            ],
            repairs: vec![],
        };
        assert!(ok.references_are_backward());

        let self_ref = RetrievalPlan {
            steps: vec![RetrievalStep::new(ToolKind::PlaceSearch).with_context_from(1)],
            repairs: vec![],
        };
        assert!(!self_ref.references_are_backward());
    }

    #[test]
    fn step_deserializes_without_optional_fields() {
        let step: RetrievalStep = serde_json::from_str(r#"{"tool":"movie_search"}"#).unwrap();
        assert_eq!(step.tool, ToolKind::MovieSearch);
        assert!(step.args.is_empty());
        assert!(step.context_from_step.is_none());
    }

    #[test]
    fn filters_route_by_vertical() {
        let mut hotel = Map::new();
        hotel.insert("max_price".into(), Value::from(200));
        let filters = ExtractedFilters {
            hotel: Some(hotel),
            ..Default::default()
        };
        assert!(filters.for_tool(ToolKind::HotelSearch).is_some());
        assert!(filters.for_tool(ToolKind::ProductSearch).is_none());
        assert!(!filters.is_empty());
        assert!(ExtractedFilters::default().is_empty());
    }
}
