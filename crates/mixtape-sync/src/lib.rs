//! Sync pipeline: categories -> tracks -> artists -> features, de-duplicated,
//! classified, and written to the relational store.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mixtape_adapters::{
    map_artist, map_feature_profile, map_track, track_page_items, CatalogApi, MappingError,
    DEFAULT_CATALOG_BASE, DEFAULT_SEARCH_LIMIT,
};
use mixtape_core::{render_tags, Artist, FeatureProfile, Genre, GenreLabel, Identified, Track};
use mixtape_storage::{
    bearer_headers, CacheStore, CachedFetcher, FetchError, Headers, HttpClientConfig,
    HttpFetcher, RequestSpec,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mixtape-sync";

pub const CATEGORIES_FILE: &str = "categories.yaml";

/// What to do with a single record whose payload does not map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedRecordPolicy {
    /// Abort the run before anything is persisted.
    #[default]
    Abort,
    /// Drop the record, log it, and keep going.
    Skip,
}

impl FromStr for MalformedRecordPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => anyhow::bail!("unknown malformed-record policy `{other}` (expected abort|skip)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub cache_file: PathBuf,
    pub catalog_base: String,
    pub access_token: String,
    pub fetch_features: bool,
    pub search_limit: u32,
    pub malformed_records: MalformedRecordPolicy,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://music.sqlite?mode=rwc".to_string()),
            cache_file: lookup("MIXTAPE_CACHE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("music_cache.json")),
            catalog_base: lookup("CATALOG_API_BASE")
                .unwrap_or_else(|| DEFAULT_CATALOG_BASE.to_string()),
            access_token: lookup("CATALOG_ACCESS_TOKEN").unwrap_or_default(),
            fetch_features: lookup("MIXTAPE_FETCH_FEATURES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            search_limit: lookup("MIXTAPE_SEARCH_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SEARCH_LIMIT),
            malformed_records: match lookup("MIXTAPE_MALFORMED_RECORDS") {
                Some(v) => v.parse().context("parsing MIXTAPE_MALFORMED_RECORDS")?,
                None => MalformedRecordPolicy::default(),
            },
            http_timeout_secs: lookup("MIXTAPE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: lookup("MIXTAPE_USER_AGENT").unwrap_or_else(|| "mixtape/0.1".to_string()),
            workspace_root: lookup("MIXTAPE_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }

    pub fn options(&self) -> PipelineOptions {
        PipelineOptions {
            search_limit: self.search_limit,
            fetch_features: self.fetch_features,
            malformed_records: self.malformed_records,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRegistry {
    pub categories: Vec<CategoryConfig>,
}

/// One catalog search (e.g. `genre:emo`) whose results feed the track list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub query: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl CategoryConfig {
    pub fn genre(name: &str) -> Self {
        Self {
            name: name.to_string(),
            query: format!("genre:{name}"),
            enabled: true,
        }
    }
}

impl Default for CategoryRegistry {
    fn default() -> Self {
        Self {
            categories: ["folk", "indie", "punk", "emo"]
                .into_iter()
                .map(CategoryConfig::genre)
                .collect(),
        }
    }
}

impl CategoryRegistry {
    /// Reads `categories.yaml` under `workspace_root`; the built-in list applies when the file is absent.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(CATEGORIES_FILE);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> Vec<CategoryConfig> {
        self.categories.iter().filter(|c| c.enabled).cloned().collect()
    }
}

/// Keeps the first occurrence of each natural id, in input order.
pub fn dedup_first_seen<T: Identified>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.natural_id().to_string()))
        .collect()
}

/// One entry of the ordered classification rule list.
#[derive(Debug, Clone, Copy)]
pub struct GenreRule {
    pub label: GenreLabel,
    pub contains_any: &'static [&'static str],
}

/// Evaluated top to bottom; the first rule with a matching substring wins.
pub const GENRE_RULES: [GenreRule; 6] = [
    GenreRule {
        label: GenreLabel::Emo,
        contains_any: &["emo", "pop punk"],
    },
    GenreRule {
        label: GenreLabel::Alternative,
        contains_any: &["alternative"],
    },
    GenreRule {
        label: GenreLabel::Indie,
        contains_any: &["indie folk", "indie"],
    },
    GenreRule {
        label: GenreLabel::Rock,
        contains_any: &["rock"],
    },
    // Exact "hip hop" with a space; hyphenated tags fall through on purpose.
    GenreRule {
        label: GenreLabel::HipHop,
        contains_any: &["hip hop"],
    },
    GenreRule {
        label: GenreLabel::Pop,
        contains_any: &["pop"],
    },
];

/// Case-sensitive substring match against the rendered tag list.
pub fn classify_tags(tags: &[String]) -> Option<GenreLabel> {
    let rendered = render_tags(tags);
    GENRE_RULES
        .iter()
        .find(|rule| rule.contains_any.iter().any(|needle| rendered.contains(needle)))
        .map(|rule| rule.label)
}

/// Returns the artist with its label set, or unchanged when no rule matches.
pub fn classify_artist(artist: Artist) -> Artist {
    match classify_tags(&artist.genre_tags) {
        Some(label) => artist.with_genre(Genre::Classified(label)),
        None => artist,
    }
}

#[derive(Debug, Error)]
#[error("persisting {entity} `{id}`")]
pub struct PersistenceError {
    pub entity: &'static str,
    pub id: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl PersistenceError {
    pub fn new(
        entity: &'static str,
        id: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            entity,
            id: id.into(),
            source: source.into(),
        }
    }
}

/// Receives normalized rows. Table creation is not its concern.
#[async_trait]
pub trait RelationalSink: Send {
    async fn insert_artist(&mut self, artist: &Artist) -> Result<(), PersistenceError>;
    async fn insert_track(&mut self, track: &Track) -> Result<(), PersistenceError>;
    async fn insert_feature(&mut self, feature: &FeatureProfile) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")
    }
}

#[async_trait]
impl RelationalSink for SqliteSink {
    async fn insert_artist(&mut self, artist: &Artist) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO artists (spotify_artist_id, artist_name, genre, image_url)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(spotify_artist_id) DO UPDATE SET
                artist_name = excluded.artist_name,
                genre = excluded.genre,
                image_url = excluded.image_url
            "#,
        )
        .bind(&artist.id)
        .bind(&artist.name)
        .bind(artist.genre.storage_value())
        .bind(&artist.image_url)
        .execute(&self.pool)
        .await
        .map_err(|err| PersistenceError::new("artist", &artist.id, err))?;
        Ok(())
    }

    async fn insert_track(&mut self, track: &Track) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO tracks (
                spotify_track_id, track_name, artist_name, album_name,
                preview_url, spotify_url, spotify_artist_id, popularity
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(spotify_track_id) DO UPDATE SET
                track_name = excluded.track_name,
                artist_name = excluded.artist_name,
                album_name = excluded.album_name,
                preview_url = excluded.preview_url,
                spotify_url = excluded.spotify_url,
                spotify_artist_id = excluded.spotify_artist_id,
                popularity = excluded.popularity
            "#,
        )
        .bind(&track.id)
        .bind(&track.name)
        .bind(&track.artist_name)
        .bind(&track.album_name)
        .bind(&track.preview_url)
        .bind(&track.play_url)
        .bind(&track.artist_id)
        .bind(i64::from(track.popularity))
        .execute(&self.pool)
        .await
        .map_err(|err| PersistenceError::new("track", &track.id, err))?;
        Ok(())
    }

    async fn insert_feature(&mut self, feature: &FeatureProfile) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO features (spotify_track_id, acousticness, danceability, tempo)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(spotify_track_id) DO UPDATE SET
                acousticness = excluded.acousticness,
                danceability = excluded.danceability,
                tempo = excluded.tempo
            "#,
        )
        .bind(&feature.track_id)
        .bind(feature.acousticness)
        .bind(feature.danceability)
        .bind(feature.tempo)
        .execute(&self.pool)
        .await
        .map_err(|err| PersistenceError::new("features", &feature.track_id, err))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    FetchCategories,
    MapTracks,
    DeduplicateTracks,
    FetchArtistsPerTrack,
    MapArtists,
    DeduplicateArtists,
    ClassifyArtists,
    PersistArtists,
    PersistTracks,
    FetchFeatures,
    MapFeatures,
    PersistFeatures,
}

impl SyncStage {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStage::FetchCategories => "fetch_categories",
            SyncStage::MapTracks => "map_tracks",
            SyncStage::DeduplicateTracks => "deduplicate_tracks",
            SyncStage::FetchArtistsPerTrack => "fetch_artists_per_track",
            SyncStage::MapArtists => "map_artists",
            SyncStage::DeduplicateArtists => "deduplicate_artists",
            SyncStage::ClassifyArtists => "classify_artists",
            SyncStage::PersistArtists => "persist_artists",
            SyncStage::PersistTracks => "persist_tracks",
            SyncStage::FetchFeatures => "fetch_features",
            SyncStage::MapFeatures => "map_features",
            SyncStage::PersistFeatures => "persist_features",
        }
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetch failed during {stage}")]
    Fetch {
        stage: SyncStage,
        #[source]
        source: FetchError,
    },
    #[error("malformed catalog record")]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("writing run report: {0:#}")]
    Report(anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub search_limit: u32,
    pub fetch_features: bool,
    pub malformed_records: MalformedRecordPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            search_limit: DEFAULT_SEARCH_LIMIT,
            fetch_features: true,
            malformed_records: MalformedRecordPolicy::Abort,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub categories: usize,
    pub fetched_tracks: usize,
    pub distinct_tracks: usize,
    pub artist_lookups: usize,
    pub distinct_artists: usize,
    pub classified_artists: usize,
    pub persisted_artists: usize,
    pub persisted_tracks: usize,
    pub persisted_features: usize,
    pub skipped_records: usize,
    pub cache_hits: usize,
    pub network_calls: usize,
    pub completed_stages: Vec<SyncStage>,
}

/// Strictly ordered, single-flight run of the whole pipeline.
pub struct SyncPipeline {
    api: CatalogApi,
    fetcher: CachedFetcher,
    headers: Headers,
    categories: Vec<CategoryConfig>,
    options: PipelineOptions,
}

struct RunState {
    skipped_records: usize,
    completed_stages: Vec<SyncStage>,
}

impl RunState {
    fn finish(&mut self, stage: SyncStage, produced: usize) {
        info!(stage = %stage, produced, "stage complete");
        self.completed_stages.push(stage);
    }
}

fn stage_span(stage: SyncStage) -> Span {
    info_span!("sync_stage", stage = %stage)
}

/// Tracks whose artist lookup was skipped would violate the artist reference.
fn drop_orphaned_tracks(tracks: Vec<Track>, unmapped_artist_ids: &HashSet<String>) -> Vec<Track> {
    if unmapped_artist_ids.is_empty() {
        return tracks;
    }
    tracks
        .into_iter()
        .filter(|track| {
            let keep = !unmapped_artist_ids.contains(&track.artist_id);
            if !keep {
                warn!(track_id = %track.id, artist_id = %track.artist_id, "dropping track whose artist was skipped");
            }
            keep
        })
        .collect()
}

impl SyncPipeline {
    pub fn new(
        api: CatalogApi,
        fetcher: CachedFetcher,
        headers: Headers,
        categories: Vec<CategoryConfig>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            api,
            fetcher,
            headers,
            categories,
            options,
        }
    }

    pub fn fetcher(&self) -> &CachedFetcher {
        &self.fetcher
    }

    pub fn into_fetcher(self) -> CachedFetcher {
        self.fetcher
    }

    pub async fn run_once(
        &mut self,
        sink: &mut dyn RelationalSink,
    ) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let stats_before = self.fetcher.stats();
        let span = info_span!("sync_run", %run_id);

        let mut summary = self.run_stages(sink).instrument(span).await?;

        let stats_after = self.fetcher.stats();
        summary.run_id = run_id;
        summary.started_at = started_at;
        summary.finished_at = Utc::now();
        summary.cache_hits = stats_after.cache_hits - stats_before.cache_hits;
        summary.network_calls = stats_after.network_calls - stats_before.network_calls;
        Ok(summary)
    }

    async fn run_stages(
        &mut self,
        sink: &mut dyn RelationalSink,
    ) -> Result<SyncRunSummary, SyncError> {
        let mut state = RunState {
            skipped_records: 0,
            completed_stages: Vec::new(),
        };
        let categories = self.categories.clone();

        let pages = async {
            let mut pages = Vec::with_capacity(categories.len());
            for category in &categories {
                let request = self.api.track_search(&category.query, self.options.search_limit);
                info!(category = %category.name, "searching category");
                pages.push(self.fetch(SyncStage::FetchCategories, &request).await?);
            }
            Ok::<_, SyncError>(pages)
        }
        .instrument(stage_span(SyncStage::FetchCategories))
        .await?;
        state.finish(SyncStage::FetchCategories, pages.len());

        let tracks = stage_span(SyncStage::MapTracks).in_scope(|| {
            let mut tracks = Vec::new();
            for page in &pages {
                for item in track_page_items(page)? {
                    if let Some(track) = self.admit(map_track(item), &mut state)? {
                        tracks.push(track);
                    }
                }
            }
            Ok::<_, SyncError>(tracks)
        })?;
        let fetched_tracks = tracks.len();
        state.finish(SyncStage::MapTracks, fetched_tracks);

        let tracks = stage_span(SyncStage::DeduplicateTracks).in_scope(|| dedup_first_seen(tracks));
        let distinct_tracks = tracks.len();
        state.finish(SyncStage::DeduplicateTracks, distinct_tracks);

        // One lookup per track; repeats of an artist are served from the cache.
        let artist_payloads = async {
            let mut payloads = Vec::with_capacity(tracks.len());
            for track in &tracks {
                let request = self.api.artist(&track.artist_id);
                let payload = self.fetch(SyncStage::FetchArtistsPerTrack, &request).await?;
                payloads.push((track.artist_id.clone(), payload));
            }
            Ok::<_, SyncError>(payloads)
        }
        .instrument(stage_span(SyncStage::FetchArtistsPerTrack))
        .await?;
        let artist_lookups = artist_payloads.len();
        state.finish(SyncStage::FetchArtistsPerTrack, artist_lookups);

        let mut unmapped_artist_ids = HashSet::new();
        let artists = stage_span(SyncStage::MapArtists).in_scope(|| {
            let mut artists = Vec::with_capacity(artist_payloads.len());
            for (requested_id, payload) in &artist_payloads {
                match self.admit(map_artist(payload), &mut state)? {
                    Some(artist) => artists.push(artist),
                    None => {
                        unmapped_artist_ids.insert(requested_id.clone());
                    }
                }
            }
            Ok::<_, SyncError>(artists)
        })?;
        state.finish(SyncStage::MapArtists, artists.len());

        let artists = stage_span(SyncStage::DeduplicateArtists).in_scope(|| dedup_first_seen(artists));
        state.finish(SyncStage::DeduplicateArtists, artists.len());

        let artists = stage_span(SyncStage::ClassifyArtists)
            .in_scope(|| artists.into_iter().map(classify_artist).collect::<Vec<_>>());
        let classified_artists = artists.iter().filter(|a| a.genre.label().is_some()).count();
        state.finish(SyncStage::ClassifyArtists, classified_artists);

        let tracks = drop_orphaned_tracks(tracks, &unmapped_artist_ids);

        async {
            for artist in &artists {
                sink.insert_artist(artist).await?;
            }
            Ok::<_, SyncError>(())
        }
        .instrument(stage_span(SyncStage::PersistArtists))
        .await?;
        state.finish(SyncStage::PersistArtists, artists.len());

        async {
            for track in &tracks {
                sink.insert_track(track).await?;
            }
            Ok::<_, SyncError>(())
        }
        .instrument(stage_span(SyncStage::PersistTracks))
        .await?;
        state.finish(SyncStage::PersistTracks, tracks.len());

        let mut persisted_features = 0;
        if self.options.fetch_features {
            let feature_payloads = async {
                let mut payloads = Vec::with_capacity(tracks.len());
                for track in &tracks {
                    let request = self.api.audio_features(&track.id);
                    payloads.push(self.fetch(SyncStage::FetchFeatures, &request).await?);
                }
                Ok::<_, SyncError>(payloads)
            }
            .instrument(stage_span(SyncStage::FetchFeatures))
            .await?;
            state.finish(SyncStage::FetchFeatures, feature_payloads.len());

            let features = stage_span(SyncStage::MapFeatures).in_scope(|| {
                let mut features = Vec::with_capacity(feature_payloads.len());
                for payload in &feature_payloads {
                    if let Some(feature) = self.admit(map_feature_profile(payload), &mut state)? {
                        features.push(feature);
                    }
                }
                Ok::<_, SyncError>(features)
            })?;
            state.finish(SyncStage::MapFeatures, features.len());

            async {
                for feature in &features {
                    sink.insert_feature(feature).await?;
                }
                Ok::<_, SyncError>(())
            }
            .instrument(stage_span(SyncStage::PersistFeatures))
            .await?;
            persisted_features = features.len();
            state.finish(SyncStage::PersistFeatures, persisted_features);
        }

        Ok(SyncRunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            categories: categories.len(),
            fetched_tracks,
            distinct_tracks,
            artist_lookups,
            distinct_artists: artists.len(),
            classified_artists,
            persisted_artists: artists.len(),
            persisted_tracks: tracks.len(),
            persisted_features,
            skipped_records: state.skipped_records,
            cache_hits: 0,
            network_calls: 0,
            completed_stages: state.completed_stages,
        })
    }

    async fn fetch(&mut self, stage: SyncStage, request: &RequestSpec) -> Result<JsonValue, SyncError> {
        self.fetcher
            .fetch(request, &self.headers)
            .await
            .map_err(|source| SyncError::Fetch { stage, source })
    }

    fn admit<T>(
        &self,
        mapped: Result<T, MappingError>,
        state: &mut RunState,
    ) -> Result<Option<T>, SyncError> {
        match mapped {
            Ok(value) => Ok(Some(value)),
            Err(err) => match self.options.malformed_records {
                MalformedRecordPolicy::Abort => Err(err.into()),
                MalformedRecordPolicy::Skip => {
                    warn!(error = %err, entity = %err.entity(), "skipping malformed record");
                    state.skipped_records += 1;
                    Ok(None)
                }
            },
        }
    }
}

/// Writes `reports/<run_id>/run_summary.json` under `workspace_root`.
pub async fn write_run_report(workspace_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let reports_dir = workspace_root.join("reports").join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let path = reports_dir.join("run_summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub summary: SyncRunSummary,
    pub report_path: PathBuf,
}

pub async fn run_sync_once_from_env() -> Result<SyncOutcome> {
    let config = SyncConfig::from_env()?;
    let registry = CategoryRegistry::load(&config.workspace_root).await?;

    if config.access_token.is_empty() {
        warn!("CATALOG_ACCESS_TOKEN is empty; only cached responses will succeed");
    }

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let cache = CacheStore::open(&config.cache_file).await;
    let fetcher = CachedFetcher::new(Box::new(http), cache);

    let mut sink = SqliteSink::connect(&config.database_url).await?;
    sink.migrate().await?;

    let mut pipeline = SyncPipeline::new(
        CatalogApi::new(config.catalog_base.clone()),
        fetcher,
        bearer_headers(&config.access_token),
        registry.enabled(),
        config.options(),
    );
    let summary = pipeline.run_once(&mut sink).await?;
    let report_path = write_run_report(&config.workspace_root, &summary)
        .await
        .map_err(SyncError::Report)?;

    Ok(SyncOutcome {
        summary,
        report_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: &'static str,
        tag: &'static str,
    }

    impl Identified for Item {
        fn natural_id(&self) -> &str {
            self.id
        }
    }

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn dedup_keeps_first_occurrence_in_order() {
        let items = vec![
            Item { id: "1", tag: "A" },
            Item { id: "2", tag: "B" },
            Item { id: "1", tag: "C" },
        ];
        let deduped = dedup_first_seen(items);
        assert_eq!(
            deduped,
            vec![Item { id: "1", tag: "A" }, Item { id: "2", tag: "B" }]
        );
    }

    #[test]
    fn dedup_of_empty_list_is_empty() {
        assert!(dedup_first_seen(Vec::<Item>::new()).is_empty());
    }

    #[test]
    fn first_matching_rule_wins() {
        assert_eq!(classify_tags(&tags(&["pop punk", "rock"])), Some(GenreLabel::Emo));
        assert_eq!(
            classify_tags(&tags(&["alternative rock", "emo"])),
            Some(GenreLabel::Emo)
        );
        assert_eq!(
            classify_tags(&tags(&["modern rock", "alternative metal"])),
            Some(GenreLabel::Alternative)
        );
        assert_eq!(
            classify_tags(&tags(&["art pop", "indie rock"])),
            Some(GenreLabel::Indie)
        );
        assert_eq!(
            classify_tags(&tags(&["hip hop", "pop rap"])),
            Some(GenreLabel::HipHop)
        );
        assert_eq!(classify_tags(&tags(&["k-pop"])), Some(GenreLabel::Pop));
    }

    #[test]
    fn matching_is_case_sensitive_and_literal() {
        assert_eq!(classify_tags(&tags(&["Rock"])), None);
        assert_eq!(classify_tags(&tags(&["hip-hop"])), None);
    }

    #[test]
    fn unmatched_artist_keeps_raw_tags() {
        let empty = Artist::new("a1", "Nobody", vec![], None);
        let classified = classify_artist(empty.clone());
        assert_eq!(classified, empty);
        assert_eq!(classified.genre, Genre::Unclassified(vec![]));

        let folk = Artist::new("a2", "Folkies", tags(&["folk", "stomp and holler"]), None);
        assert_eq!(
            classify_artist(folk).genre.storage_value(),
            r#"["folk","stomp and holler"]"#
        );
    }

    #[test]
    fn classification_returns_a_new_value() {
        let artist = Artist::new("a1", "Band", tags(&["midwest emo"]), None);
        let classified = classify_artist(artist.clone());
        assert_eq!(classified.genre, Genre::Classified(GenreLabel::Emo));
        assert_eq!(artist.genre, Genre::Unclassified(tags(&["midwest emo"])));
        assert_eq!(classified.genre_tags, artist.genre_tags);
    }

    #[test]
    fn malformed_policy_parses() {
        assert_eq!("skip".parse::<MalformedRecordPolicy>().unwrap(), MalformedRecordPolicy::Skip);
        assert_eq!(" Abort ".parse::<MalformedRecordPolicy>().unwrap(), MalformedRecordPolicy::Abort);
        assert!("retry".parse::<MalformedRecordPolicy>().is_err());
    }

    #[tokio::test]
    async fn missing_registry_file_uses_default_categories() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CategoryRegistry::load(dir.path()).await.unwrap();
        let names = registry
            .enabled()
            .into_iter()
            .map(|c| c.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["folk", "indie", "punk", "emo"]);
    }

    #[tokio::test]
    async fn registry_file_respects_enabled_flags() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CATEGORIES_FILE),
            "categories:\n  - name: emo\n    query: \"genre:emo\"\n  - name: folk\n    query: \"genre:folk\"\n    enabled: false\n",
        )
        .unwrap();
        let registry = CategoryRegistry::load(dir.path()).await.unwrap();
        assert_eq!(registry.enabled(), vec![CategoryConfig::genre("emo")]);
    }

    #[tokio::test]
    async fn malformed_registry_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CATEGORIES_FILE), "categories: [oops").unwrap();
        assert!(CategoryRegistry::load(dir.path()).await.is_err());
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<std::collections::HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_defaults_apply_when_nothing_is_set() {
        let config = SyncConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.database_url, "sqlite://music.sqlite?mode=rwc");
        assert_eq!(config.cache_file, PathBuf::from("music_cache.json"));
        assert_eq!(config.catalog_base, DEFAULT_CATALOG_BASE);
        assert_eq!(config.access_token, "");
        assert!(config.fetch_features);
        assert_eq!(config.search_limit, 50);
        assert_eq!(config.malformed_records, MalformedRecordPolicy::Abort);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.user_agent, "mixtape/0.1");
        assert_eq!(config.workspace_root, PathBuf::from("."));
    }

    #[test]
    fn config_reads_overrides() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("MIXTAPE_FETCH_FEATURES", "false"),
            ("MIXTAPE_SEARCH_LIMIT", "10"),
            ("MIXTAPE_MALFORMED_RECORDS", "skip"),
            ("CATALOG_ACCESS_TOKEN", "tok"),
        ]))
        .unwrap();
        assert!(!config.fetch_features);
        assert_eq!(config.options().search_limit, 10);
        assert_eq!(config.options().malformed_records, MalformedRecordPolicy::Skip);
        assert_eq!(config.access_token, "tok");
    }

    #[test]
    fn unknown_malformed_policy_is_a_config_error() {
        let err = SyncConfig::from_lookup(lookup_from(&[("MIXTAPE_MALFORMED_RECORDS", "retry")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("MIXTAPE_MALFORMED_RECORDS"));
    }

    #[tokio::test]
    async fn run_report_lands_under_the_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let summary = SyncRunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            categories: 2,
            fetched_tracks: 4,
            distinct_tracks: 3,
            artist_lookups: 3,
            distinct_artists: 3,
            classified_artists: 3,
            persisted_artists: 3,
            persisted_tracks: 3,
            persisted_features: 3,
            skipped_records: 0,
            cache_hits: 1,
            network_calls: 7,
            completed_stages: vec![SyncStage::FetchCategories, SyncStage::MapTracks],
        };

        let path = write_run_report(dir.path(), &summary).await.unwrap();
        assert_eq!(
            path,
            dir.path()
                .join("reports")
                .join(summary.run_id.to_string())
                .join("run_summary.json")
        );

        let written: JsonValue = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["run_id"], summary.run_id.to_string());
        assert_eq!(written["distinct_tracks"], 3);
        assert_eq!(written["network_calls"], 7);
        assert_eq!(written["completed_stages"][1], "map_tracks");
    }
}
