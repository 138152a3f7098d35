//! Write-through response cache + HTTP fetch utilities for Mixtape.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mixtape-storage";

/// Joins rendered parameters in a request key. Values are not escaped.
pub const KEY_SEPARATOR: &str = "_";

/// Request parameters in caller-supplied order; keys are expected to be unique.
pub type Params = Vec<(String, String)>;

/// Outbound request headers, e.g. the bearer authorization header.
pub type Headers = BTreeMap<String, String>;

pub fn param(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

pub fn bearer_headers(token: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    headers
}

/// Deterministic cache key for an endpoint plus parameter set.
///
/// Each parameter renders as `key_value`; the rendered strings are sorted and
/// joined with [`KEY_SEPARATOR`] after the endpoint, so supplying the same
/// parameters in a different order yields the same key. A value that itself
/// contains the separator can collide with a different parameter set.
pub fn request_key(endpoint: &str, params: &[(String, String)]) -> String {
    let mut rendered = params
        .iter()
        .map(|(key, value)| format!("{key}{KEY_SEPARATOR}{value}"))
        .collect::<Vec<_>>();
    rendered.sort();
    format!("{endpoint}{KEY_SEPARATOR}{}", rendered.join(KEY_SEPARATOR))
}

/// One outbound catalog call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestSpec {
    /// Endpoint queried with a parameter set (e.g. a search).
    Query { endpoint: String, params: Params },
    /// Single resource addressed purely by URL; the URL is its own cache key.
    Resource { url: String },
}

impl RequestSpec {
    pub fn query(endpoint: impl Into<String>, params: Params) -> Self {
        RequestSpec::Query {
            endpoint: endpoint.into(),
            params,
        }
    }

    pub fn resource(url: impl Into<String>) -> Self {
        RequestSpec::Resource { url: url.into() }
    }

    pub fn url(&self) -> &str {
        match self {
            RequestSpec::Query { endpoint, .. } => endpoint,
            RequestSpec::Resource { url } => url,
        }
    }

    pub fn params(&self) -> &[(String, String)] {
        match self {
            RequestSpec::Query { params, .. } => params,
            RequestSpec::Resource { .. } => &[],
        }
    }

    pub fn cache_key(&self) -> String {
        match self {
            RequestSpec::Query { endpoint, params } => request_key(endpoint, params),
            RequestSpec::Resource { url } => url.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing cache file {}", .path.display())]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a cache file could not be read. [`CacheStore::load`] treats every
/// variant as an empty cache; the distinction only feeds diagnostics.
#[derive(Debug, Error)]
pub enum CacheLoadError {
    #[error("cache file {} does not exist", .0.display())]
    Missing(PathBuf),
    #[error("reading cache file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache file {} is not a JSON object of responses", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persistent request-key -> raw JSON response mapping, backed by one file.
///
/// Entries are never evicted. The file is rewritten in full by [`flush`](Self::flush).
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    entries: BTreeMap<String, JsonValue>,
}

impl CacheStore {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Opens the cache at `path`, starting empty if the file is missing or unreadable.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = Self::load(&path).await;
        Self { path, entries }
    }

    pub async fn load(path: &Path) -> BTreeMap<String, JsonValue> {
        match Self::try_load(path).await {
            Ok(entries) => {
                debug!(path = %path.display(), entries = entries.len(), "loaded response cache");
                entries
            }
            Err(CacheLoadError::Missing(_)) => {
                debug!(path = %path.display(), "no response cache yet");
                BTreeMap::new()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable response cache");
                BTreeMap::new()
            }
        }
    }

    pub async fn try_load(path: &Path) -> Result<BTreeMap<String, JsonValue>, CacheLoadError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheLoadError::Missing(path.to_path_buf()))
            }
            Err(source) => {
                return Err(CacheLoadError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| CacheLoadError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `None` is a miss.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: impl Into<String>, value: JsonValue) -> Option<JsonValue> {
        self.entries.insert(key.into(), value)
    }

    fn discard(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Rewrites the whole cache file via a temp file and atomic rename.
    pub async fn flush(&self) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(&self.entries)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cache".to_string());
        let temp_path = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path).await?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        Ok(())
    }
}

/// The outbound HTTP collaborator shared by every fetch path.
#[async_trait]
pub trait JsonGet: Send + Sync {
    async fn get_json(
        &self,
        url: &str,
        params: &[(String, String)],
        headers: &Headers,
    ) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// reqwest-backed [`JsonGet`]. One attempt per call; failures are never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JsonGet for HttpFetcher {
    async fn get_json(
        &self,
        url: &str,
        params: &[(String, String)],
        headers: &Headers,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let mut request = self.client.get(url);
            if !params.is_empty() {
                request = request.query(params);
            }
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?;
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    pub cache_hits: usize,
    pub network_calls: usize,
}

/// [`JsonGet`] wrapped with write-through [`CacheStore`] semantics.
///
/// A hit makes no network call. A miss makes exactly one, records the body,
/// and flushes the whole cache before returning. A failed call or flush
/// leaves the cache without an entry for that key.
pub struct CachedFetcher {
    http: Box<dyn JsonGet>,
    cache: CacheStore,
    stats: FetchStats,
}

impl CachedFetcher {
    pub fn new(http: Box<dyn JsonGet>, cache: CacheStore) -> Self {
        Self {
            http,
            cache,
            stats: FetchStats::default(),
        }
    }

    pub async fn fetch(
        &mut self,
        request: &RequestSpec,
        headers: &Headers,
    ) -> Result<JsonValue, FetchError> {
        let key = request.cache_key();
        if let Some(hit) = self.cache.get(&key) {
            debug!(key = %key, "using cache");
            self.stats.cache_hits += 1;
            return Ok(hit.clone());
        }

        debug!(key = %key, "fetching");
        self.stats.network_calls += 1;
        let body = self
            .http
            .get_json(request.url(), request.params(), headers)
            .await?;

        self.cache.put(key.clone(), body.clone());
        if let Err(source) = self.cache.flush().await {
            self.cache.discard(&key);
            return Err(FetchError::CacheWrite {
                path: self.cache.path().to_path_buf(),
                source,
            });
        }
        Ok(body)
    }

    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn into_cache(self) -> CacheStore {
        self.cache
    }
}
