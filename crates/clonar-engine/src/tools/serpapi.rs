//! SerpAPI-backed retrieval tools, one per [`ToolKind`], sharing a single
//! HTTP client and a single breaker dependency.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, Local, NaiveDate};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use clonar_core::collaborators::{RetrievalTool, StepContext};
use clonar_core::errors::{CollaboratorError, ToolError};
use clonar_core::plan::ToolKind;
use clonar_settings::ToolSettings;

use crate::registry::ToolRegistry;

/// Breaker and rate-limit key for every SerpAPI call.
pub const SERPAPI_DEPENDENCY: &str = "serpapi";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SerpApiClient {
    http: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    hl: String,
    gl: String,
    max_results: usize,
}

impl SerpApiClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        settings: &ToolSettings,
    ) -> Result<Self, CollaboratorError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CollaboratorError::NotConfigured(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key,
            hl: settings.hl.clone(),
            gl: settings.gl.clone(),
            max_results: settings.max_results.max(1),
        })
    }

    /// Endpoint from settings, key from the configured env var. A missing key
    /// only surfaces when a tool is called.
    pub fn from_settings(settings: &ToolSettings) -> Result<Self, CollaboratorError> {
        let api_key = std::env::var(&settings.serpapi_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        Self::new(settings.serpapi_endpoint.clone(), api_key, settings)
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// GET the endpoint for `engine`. Provider error bodies are never copied
    /// into the returned error.
    #[instrument(skip_all, fields(engine = %engine))]
    async fn search(&self, engine: &str, params: Vec<(&str, String)>) -> Result<Value, CollaboratorError> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| CollaboratorError::NotConfigured("SerpAPI key not configured".into()))?;

        let mut query: Vec<(&str, String)> = vec![
            ("engine", engine.to_string()),
            ("hl", self.hl.clone()),
            ("gl", self.gl.clone()),
        ];
        query.extend(params);
        query.push(("api_key", key.expose_secret().to_string()));

        let resp = self
            .http
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await
            .map_err(|_| CollaboratorError::NetworkError("Network error contacting SerpAPI".into()))?;

        let status = resp.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), engine, "SerpAPI error");
            return Err(CollaboratorError::from_status(status.as_u16()));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| CollaboratorError::MalformedResponse(e.without_url().to_string()))
    }
}

/// One retrieval vertical served through SerpAPI.
pub struct SerpApiTool {
    kind: ToolKind,
    client: Arc<SerpApiClient>,
}

impl SerpApiTool {
    pub fn new(kind: ToolKind, client: Arc<SerpApiClient>) -> Self {
        Self { kind, client }
    }
}

/// Register a SerpAPI tool for every [`ToolKind`].
pub fn register_serpapi_tools(registry: &mut ToolRegistry, client: Arc<SerpApiClient>) {
    for kind in ToolKind::ALL {
        registry.register(Arc::new(SerpApiTool::new(kind, Arc::clone(&client))));
    }
}

#[async_trait]
impl RetrievalTool for SerpApiTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn dependency(&self) -> &str {
        SERPAPI_DEPENDENCY
    }

    async fn search(
        &self,
        args: &Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<Vec<Value>, ToolError> {
        let request = build_request(self.kind, args, Local::now().date_naive())?;
        debug!(
            session_id = %ctx.session_id,
            step = ctx.step,
            engine = request.engine,
            "calling SerpAPI"
        );
        let payload = self.client.search(request.engine, request.params).await?;
        if let Some(message) = payload.get("error").and_then(Value::as_str) {
            // SerpAPI reports "no results" as an error string with a 200.
            debug!(engine = request.engine, reason = message, "SerpAPI returned no results");
            return Ok(Vec::new());
        }

        let mut items = extract(self.kind, &payload);
        if let Some(max) = args.get("max_price").and_then(as_number) {
            items.retain(|item| price_of(item).map_or(true, |p| p <= max));
        }
        items.truncate(self.client.max_results);
        Ok(items)
    }
}

struct EngineRequest {
    engine: &'static str,
    params: Vec<(&'static str, String)>,
}

fn arg_str<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn arg_string(args: &Map<String, Value>, key: &str) -> Option<String> {
    match args.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_start_matches('$').replace(',', "").parse().ok(),
        _ => None,
    }
}

fn price_of(item: &Value) -> Option<f64> {
    ["extracted_price", "price"]
        .iter()
        .find_map(|key| item.get(*key).and_then(as_number))
}

/// Free-text query, optionally narrowed by location and the first context name.
fn query_text(args: &Map<String, Value>, with_context: bool) -> Result<String, ToolError> {
    let mut q = arg_str(args, "query")
        .ok_or_else(|| ToolError::InvalidArguments("missing query".into()))?
        .to_string();
    if let Some(location) = arg_str(args, "location") {
        if !q.to_lowercase().contains(&location.to_lowercase()) {
            q.push_str(" in ");
            q.push_str(location);
        }
    }
    if with_context {
        if let Some(near) = arg_str(args, "context").and_then(|c| c.split(", ").next()) {
            q.push_str(" near ");
            q.push_str(near);
        }
    }
    Ok(q)
}

fn build_request(
    kind: ToolKind,
    args: &Map<String, Value>,
    today: NaiveDate,
) -> Result<EngineRequest, ToolError> {
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    let day_after = tomorrow.checked_add_days(Days::new(1)).unwrap_or(tomorrow);

    let request = match kind {
        ToolKind::ProductSearch => EngineRequest {
            engine: "google_shopping",
            params: vec![("q", query_text(args, false)?)],
        },
        ToolKind::HotelSearch => {
            let mut params = vec![
                ("q", query_text(args, true)?),
                (
                    "check_in_date",
                    arg_string(args, "check_in").unwrap_or_else(|| tomorrow.to_string()),
                ),
                (
                    "check_out_date",
                    arg_string(args, "check_out").unwrap_or_else(|| day_after.to_string()),
                ),
                ("currency", "USD".to_string()),
            ];
            if let Some(guests) = arg_string(args, "guests") {
                params.push(("adults", guests));
            }
            if let Some(max) = arg_string(args, "max_price") {
                params.push(("max_price", max));
            }
            EngineRequest {
                engine: "google_hotels",
                params,
            }
        }
        ToolKind::FlightSearch => {
            let origin = arg_string(args, "origin")
                .ok_or_else(|| ToolError::InvalidArguments("missing origin".into()))?;
            let destination = arg_string(args, "destination")
                .ok_or_else(|| ToolError::InvalidArguments("missing destination".into()))?;
            let mut params = vec![
                ("departure_id", origin),
                ("arrival_id", destination),
                (
                    "outbound_date",
                    arg_string(args, "depart_date").unwrap_or_else(|| tomorrow.to_string()),
                ),
                ("currency", "USD".to_string()),
            ];
            match arg_string(args, "return_date") {
                Some(ret) => {
                    params.push(("return_date", ret));
                    params.push(("type", "1".to_string()));
                }
                None => params.push(("type", "2".to_string())),
            }
            if let Some(passengers) = arg_string(args, "passengers") {
                params.push(("adults", passengers));
            }
            EngineRequest {
                engine: "google_flights",
                params,
            }
        }
        ToolKind::PlaceSearch => EngineRequest {
            engine: "google_maps",
            params: vec![("type", "search".to_string()), ("q", query_text(args, true)?)],
        },
        ToolKind::MovieSearch => {
            let mut q = query_text(args, false)?;
            if let Some(genre) = arg_str(args, "genre") {
                q = format!("{genre} {q}");
            }
            EngineRequest {
                engine: "google",
                params: vec![("q", q)],
            }
        }
        ToolKind::WebSearch => EngineRequest {
            engine: "google",
            params: vec![("q", query_text(args, false)?)],
        },
    };
    Ok(request)
}

/// First present field among `keys` that is neither null nor an empty
/// string, or an empty string.
fn field(item: &Value, keys: &[&str]) -> Value {
    keys.iter()
        .find_map(|k| item.get(*k).filter(|v| !v.is_null() && v.as_str() != Some("")))
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()))
}

fn results<'a>(payload: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter())
        .into_iter()
        .flatten()
}

fn extract(kind: ToolKind, payload: &Value) -> Vec<Value> {
    match kind {
        ToolKind::ProductSearch => results(payload, "shopping_results").map(shopping_item).collect(),
        ToolKind::HotelSearch => results(payload, "properties").map(hotel_item).collect(),
        ToolKind::FlightSearch => results(payload, "best_flights")
            .chain(results(payload, "other_flights"))
            .map(flight_item)
            .collect(),
        ToolKind::PlaceSearch => results(payload, "local_results").map(place_item).collect(),
        ToolKind::MovieSearch | ToolKind::WebSearch => {
            results(payload, "organic_results").map(web_item).collect()
        }
    }
}

fn shopping_item(item: &Value) -> Value {
    json!({
        "title": field(item, &["title"]),
        "price": field(item, &["price"]),
        "link": field(item, &["link", "product_link"]),
        "source": field(item, &["source"]),
        "thumbnail": field(item, &["thumbnail"]),
        "tag": field(item, &["tag"]),
        "delivery": field(item, &["delivery"]),
        "rating": field(item, &["rating"]),
        "reviews": field(item, &["reviews"]),
        "extracted_price": field(item, &["extracted_price"]),
        "old_price": field(item, &["extracted_price_old"]),
    })
}

fn hotel_item(item: &Value) -> Value {
    let price = item
        .pointer("/rate_per_night/lowest")
        .cloned()
        .unwrap_or_else(|| field(item, &["price"]));
    let thumbnail = item
        .pointer("/images/0/thumbnail")
        .cloned()
        .unwrap_or_else(|| field(item, &["thumbnail"]));
    json!({
        "name": field(item, &["name"]),
        "address": field(item, &["address"]),
        "price": price,
        "extracted_price": item.pointer("/rate_per_night/extracted_lowest").cloned().unwrap_or(Value::Null),
        "rating": field(item, &["overall_rating", "rating"]),
        "reviews": field(item, &["reviews"]),
        "thumbnail": thumbnail,
        "link": field(item, &["link"]),
        "amenities": item.get("amenities").cloned().unwrap_or_else(|| json!([])),
        "description": field(item, &["description"]),
    })
}

fn flight_item(item: &Value) -> Value {
    let legs = item.get("flights").and_then(Value::as_array);
    let first = legs.and_then(|l| l.first());
    let last = legs.and_then(|l| l.last());
    let airline = first.map_or_else(|| Value::String(String::new()), |f| field(f, &["airline"]));
    json!({
        "title": airline.as_str().unwrap_or_default(),
        "airline": airline,
        "price": field(item, &["price"]),
        "total_duration": field(item, &["total_duration"]),
        "stops": legs.map_or(0, |l| l.len().saturating_sub(1)),
        "departure": first.and_then(|f| f.pointer("/departure_airport/time")).cloned().unwrap_or(Value::Null),
        "arrival": last.and_then(|f| f.pointer("/arrival_airport/time")).cloned().unwrap_or(Value::Null),
        "thumbnail": field(item, &["airline_logo"]),
    })
}

fn place_item(item: &Value) -> Value {
    json!({
        "title": field(item, &["title"]),
        "address": field(item, &["address"]),
        "rating": field(item, &["rating"]),
        "reviews": field(item, &["reviews"]),
        "type": field(item, &["type"]),
        "price": field(item, &["price"]),
        "thumbnail": field(item, &["thumbnail"]),
        "link": field(item, &["website", "link"]),
    })
}

fn web_item(item: &Value) -> Value {
    json!({
        "title": field(item, &["title"]),
        "link": field(item, &["link"]),
        "snippet": field(item, &["snippet"]),
        "source": field(item, &["source", "displayed_link"]),
        "thumbnail": field(item, &["thumbnail"]),
    })
}
