//! Executes search URLs against the ASF API and parses the GeoJSON feature list.
use crate::error::SearchError;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_CACHE_CAPACITY: u64 = 10;

/// One scene returned by the search.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Feature {
    pub download_url: String,
    pub file_name: String,
    /// Footprint as returned by the API.
    pub geometry: Value,
    /// Remaining feature properties, passed through untouched.
    pub properties: Map<String, Value>,
}

/// Features in the order the API returned them. No deduplication is done.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct SearchResult {
    features: Vec<Feature>,
}

#[derive(Deserialize)]
struct FeatureCollection {
    features: Vec<GeoJsonFeature>,
}

#[derive(Deserialize)]
struct GeoJsonFeature {
    #[serde(default)]
    geometry: Value,
    properties: GeoJsonProperties,
}

#[derive(Deserialize)]
struct GeoJsonProperties {
    url: String,
    #[serde(rename = "fileName")]
    file_name: String,
    #[serde(flatten)]
    other: Map<String, Value>,
}

impl SearchResult {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    /// Parse a GeoJSON feature collection. Every feature must carry `url` and
    /// `fileName` properties.
    pub fn from_geojson(content: &str) -> serde_json::Result<Self> {
        let collection: FeatureCollection = serde_json::from_str(content)?;
        let features = collection
            .features
            .into_iter()
            .map(|f| Feature {
                download_url: f.properties.url,
                file_name: f.properties.file_name,
                geometry: f.geometry,
                properties: f.properties.other,
            })
            .collect();
        Ok(Self { features })
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn urls(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.download_url.as_str()).collect()
    }

    pub fn file_names(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.file_name.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs the HTTP GET for a search URL.
pub trait SearchBackend {
    async fn get(&self, url: &Url) -> Result<RawResponse, SearchError>;
}

/// The ASF search API over HTTPS.
pub struct AsfApi {
    client: reqwest::Client,
}

impl AsfApi {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for AsfApi {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchBackend for AsfApi {
    async fn get(&self, url: &Url) -> Result<RawResponse, SearchError> {
        let request_err = |source: reqwest::Error| SearchError::Request {
            url: url.to_string(),
            source,
        };
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(request_err)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(request_err)?;
        Ok(RawResponse { status, body })
    }
}

/// Search client with its own bounded result cache keyed by URL.
///
/// Entries never expire while the client lives; repeated queries for the same
/// URL return the same `Arc` without touching the backend.
pub struct SearchClient<B: SearchBackend> {
    backend: B,
    cache: Cache<String, Arc<SearchResult>>,
}

impl<B: SearchBackend> SearchClient<B> {
    pub fn new(backend: B) -> Self {
        Self::with_capacity(backend, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(backend: B, capacity: u64) -> Self {
        let cache = Cache::builder().max_capacity(capacity).build();
        Self { backend, cache }
    }

    pub async fn query(&self, url: &Url) -> Result<Arc<SearchResult>, SearchError> {
        let key = url.to_string();
        if let Some(result) = self.cache.get(&key).await {
            debug!(%url, "Search result served from cache");
            return Ok(result);
        }

        info!(%url, "Querying url");
        let response = self.backend.get(url).await?;
        if !response.is_success() {
            return Err(SearchError::Status {
                url: key,
                status: response.status,
            });
        }

        let result = SearchResult::from_geojson(&response.body).map_err(|source| {
            SearchError::Parse {
                url: key.clone(),
                source,
            }
        })?;
        info!(count = result.len(), "Search returned features");

        let result = Arc::new(result);
        self.cache.insert(key, result.clone()).await;
        Ok(result)
    }
}
