//! Retrieval tool implementations.

pub mod serpapi;

pub use serpapi::{register_serpapi_tools, SerpApiClient, SerpApiTool, SERPAPI_DEPENDENCY};
