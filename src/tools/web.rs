use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde_json::{Map, Value, json};

use super::{FieldSpec, FieldType, ToolDescriptor, ToolOutput};

pub const SCRAPED_RESULTS_KEY: &str = "scraped_urls_results";

const DEFAULT_SEARCH_URL: &str = "https://google.serper.dev/search";
const DEFAULT_SCRAPE_URL: &str = "https://scrape.serper.dev";
const DEFAULT_NUM_RESULTS: u64 = 5;

/// Endpoints and credentials for the serper search and scrape APIs.
#[derive(Debug, Clone)]
pub struct WebToolsConfig {
    pub search_url: String,
    pub scrape_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for WebToolsConfig {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_SEARCH_URL.to_string(),
            scrape_url: DEFAULT_SCRAPE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl WebToolsConfig {
    /// `SERPER_API_KEY` authenticates both endpoints; `SCRAPER_API_KEY`
    /// overrides it. `SERPER_SEARCH_URL` and `SCRAPER_API_URL` move the
    /// endpoints.
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();
        Self {
            search_url: var("SERPER_SEARCH_URL").unwrap_or(defaults.search_url),
            scrape_url: var("SCRAPER_API_URL").unwrap_or(defaults.scrape_url),
            api_key: var("SCRAPER_API_KEY").or_else(|| var("SERPER_API_KEY")),
            timeout: defaults.timeout,
        }
    }

    fn client(&self) -> Result<(reqwest::Client, &str), String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| "no web API key configured; set SERPER_API_KEY".to_string())?;
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| format!("failed to build HTTP client: {err}"))?;
        Ok((client, key))
    }
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    key: &str,
    body: &Value,
) -> Result<Value, String> {
    let response = client
        .post(url)
        .header("X-API-KEY", key)
        .json(body)
        .send()
        .await
        .map_err(|err| format!("request to {url} failed: {err}"))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| format!("failed to read response from {url}: {err}"))?;
    if !status.is_success() {
        return Err(format!("{url} returned {status}: {text}"));
    }
    serde_json::from_str(&text).map_err(|err| format!("{url} returned invalid JSON: {err}"))
}

pub fn web_search_tool(config: WebToolsConfig) -> ToolDescriptor {
    let config = Arc::new(config);
    ToolDescriptor::from_fn(
        "web_search",
        "Searches the web and returns the top results as title, snippet, url and domain.",
        move |params, _state| {
            let config = config.clone();
            async move {
                let query = params
                    .get("query")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let num = params
                    .get("num_results")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_NUM_RESULTS);
                let (client, key) = match config.client() {
                    Ok(pair) => pair,
                    Err(message) => return ToolOutput::error(message),
                };
                tracing::debug!(query = %query, num, "Running web search");
                match post_json(
                    &client,
                    &config.search_url,
                    key,
                    &json!({ "q": query, "num": num }),
                )
                .await
                {
                    Ok(raw) => ToolOutput::ok(summarize_search_results(&raw)),
                    Err(message) => ToolOutput::error(message),
                }
            }
        },
    )
    .with_field(FieldSpec::required("query", FieldType::String, "search query"))
    .with_field(FieldSpec::optional(
        "num_results",
        FieldType::Integer,
        "how many results to return",
    ))
}

/// Keeps the organic hits of a serper search response.
pub fn summarize_search_results(raw: &Value) -> Value {
    let results = raw
        .get("organic")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .map(|hit| {
                    let field = |name: &str| hit.get(name).and_then(Value::as_str).unwrap_or_default();
                    let url = field("link");
                    let domain = Url::parse(url)
                        .ok()
                        .and_then(|parsed| parsed.host_str().map(str::to_string))
                        .unwrap_or_default();
                    json!({
                        "title": field("title"),
                        "snippet": field("snippet"),
                        "url": url,
                        "domain": domain,
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    json!({ "results": results })
}

/// Scrapes each URL through the scrape endpoint. Per-URL failures are kept
/// in the result map; the whole map is also written to
/// `scraped_urls_results`.
pub fn scrape_pages_tool(config: WebToolsConfig) -> ToolDescriptor {
    let config = Arc::new(config);
    ToolDescriptor::from_fn(
        "scrape_pages",
        "Scrapes the readable content of each URL in the list.",
        move |params, state| {
            let config = config.clone();
            async move {
                let urls = params
                    .get("urls")
                    .and_then(Value::as_array)
                    .map(|urls| {
                        urls.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let (client, key) = match config.client() {
                    Ok(pair) => pair,
                    Err(message) => return ToolOutput::error(message),
                };

                let mut results = Map::new();
                for url in urls {
                    let outcome =
                        post_json(&client, &config.scrape_url, key, &json!({ "url": url })).await;
                    let entry = match outcome {
                        Ok(page) => page,
                        Err(message) => {
                            tracing::warn!(url = %url, error = %message, "Scrape failed");
                            json!({ "error": message })
                        }
                    };
                    results.insert(url, entry);
                }
                let results = Value::Object(results);
                state.write(SCRAPED_RESULTS_KEY, results.clone());
                ToolOutput::ok(results)
            }
        },
    )
    .with_field(FieldSpec::required("urls", FieldType::Array, "URLs to scrape"))
}
