//! Catalog endpoint construction + mapping of raw catalog payloads into entities.

use std::fmt;

use mixtape_core::{Artist, FeatureProfile, Track};
use mixtape_storage::{param, RequestSpec};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "mixtape-adapters";

pub const DEFAULT_CATALOG_BASE: &str = "https://api.spotify.com/v1";
pub const DEFAULT_SEARCH_LIMIT: u32 = 50;

/// Builds the three kinds of catalog requests the pipeline issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogApi {
    base_url: String,
}

impl Default for CatalogApi {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOG_BASE)
    }
}

impl CatalogApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn track_search(&self, query: &str, limit: u32) -> RequestSpec {
        RequestSpec::query(
            format!("{}/search", self.base_url),
            vec![param("q", query), param("type", "track"), param("limit", limit)],
        )
    }

    pub fn artist(&self, artist_id: &str) -> RequestSpec {
        RequestSpec::resource(format!("{}/artists/{artist_id}", self.base_url))
    }

    pub fn audio_features(&self, track_id: &str) -> RequestSpec {
        RequestSpec::resource(format!("{}/audio-features/{track_id}", self.base_url))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    TrackPage,
    Track,
    Artist,
    FeatureProfile,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::TrackPage => "track search page",
            EntityKind::Track => "track",
            EntityKind::Artist => "artist",
            EntityKind::FeatureProfile => "audio features",
        })
    }
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("{entity} payload{} is missing `{path}`", describe_record(.record_id))]
    MissingStructure {
        entity: EntityKind,
        record_id: Option<String>,
        path: &'static str,
    },
    #[error("{entity} payload{} does not match the expected shape", describe_record(.record_id))]
    Shape {
        entity: EntityKind,
        record_id: Option<String>,
        #[source]
        source: serde_json::Error,
    },
    #[error("{entity} payload{} has an empty `{field}`", describe_record(.record_id))]
    EmptyIdentifier {
        entity: EntityKind,
        record_id: Option<String>,
        field: &'static str,
    },
}

impl MappingError {
    pub fn entity(&self) -> EntityKind {
        match self {
            MappingError::MissingStructure { entity, .. }
            | MappingError::Shape { entity, .. }
            | MappingError::EmptyIdentifier { entity, .. } => *entity,
        }
    }

    pub fn record_id(&self) -> Option<&str> {
        match self {
            MappingError::MissingStructure { record_id, .. }
            | MappingError::Shape { record_id, .. }
            | MappingError::EmptyIdentifier { record_id, .. } => record_id.as_deref(),
        }
    }
}

fn describe_record(record_id: &Option<String>) -> String {
    match record_id {
        Some(id) => format!(" for `{id}`"),
        None => String::new(),
    }
}

#[derive(Debug, Deserialize)]
struct RawTrack {
    id: String,
    name: String,
    popularity: u32,
    preview_url: Option<String>,
    album: RawNamed,
    external_urls: RawExternalUrls,
    artists: Vec<RawArtistRef>,
}

#[derive(Debug, Deserialize)]
struct RawNamed {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawExternalUrls {
    spotify: String,
}

#[derive(Debug, Deserialize)]
struct RawArtistRef {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawArtist {
    id: String,
    name: String,
    genres: Vec<String>,
    #[serde(default)]
    images: Option<Vec<RawImage>>,
}

#[derive(Debug, Deserialize)]
struct RawImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RawFeatures {
    id: String,
    acousticness: f64,
    danceability: f64,
    tempo: f64,
}

fn record_id_of(payload: &JsonValue) -> Option<String> {
    payload.get("id")?.as_str().map(ToString::to_string)
}

fn decode<'a, T: Deserialize<'a>>(
    entity: EntityKind,
    payload: &'a JsonValue,
) -> Result<T, MappingError> {
    T::deserialize(payload).map_err(|source| MappingError::Shape {
        entity,
        record_id: record_id_of(payload),
        source,
    })
}

/// `record_id` names the record being mapped, which differs from `id` for nested fields.
fn require_id(
    entity: EntityKind,
    field: &'static str,
    id: &str,
    record_id: Option<&str>,
) -> Result<(), MappingError> {
    if id.trim().is_empty() {
        return Err(MappingError::EmptyIdentifier {
            entity,
            record_id: record_id.filter(|r| !r.trim().is_empty()).map(ToString::to_string),
            field,
        });
    }
    Ok(())
}

/// Items of a track search response (`tracks.items`).
pub fn track_page_items(payload: &JsonValue) -> Result<&[JsonValue], MappingError> {
    payload
        .get("tracks")
        .and_then(|tracks| tracks.get("items"))
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .ok_or(MappingError::MissingStructure {
            entity: EntityKind::TrackPage,
            record_id: None,
            path: "tracks.items",
        })
}

/// Maps one search-result item. Only the first listed artist is kept.
pub fn map_track(item: &JsonValue) -> Result<Track, MappingError> {
    let raw: RawTrack = decode(EntityKind::Track, item)?;
    require_id(EntityKind::Track, "id", &raw.id, None)?;
    let artist = raw
        .artists
        .into_iter()
        .next()
        .ok_or_else(|| MappingError::MissingStructure {
            entity: EntityKind::Track,
            record_id: Some(raw.id.clone()),
            path: "artists[0]",
        })?;
    require_id(EntityKind::Track, "artists[0].id", &artist.id, Some(&raw.id))?;

    Ok(Track {
        id: raw.id,
        name: raw.name,
        album_name: raw.album.name,
        artist_name: artist.name,
        artist_id: artist.id,
        popularity: raw.popularity,
        preview_url: raw.preview_url,
        play_url: raw.external_urls.spotify,
    })
}

/// Maps an artist lookup. A missing or empty image list yields no image URL.
pub fn map_artist(payload: &JsonValue) -> Result<Artist, MappingError> {
    let raw: RawArtist = decode(EntityKind::Artist, payload)?;
    require_id(EntityKind::Artist, "id", &raw.id, None)?;
    let image_url = raw
        .images
        .and_then(|images| images.into_iter().next())
        .map(|image| image.url);
    Ok(Artist::new(raw.id, raw.name, raw.genres, image_url))
}

pub fn map_feature_profile(payload: &JsonValue) -> Result<FeatureProfile, MappingError> {
    let raw: RawFeatures = decode(EntityKind::FeatureProfile, payload)?;
    require_id(EntityKind::FeatureProfile, "id", &raw.id, None)?;
    Ok(FeatureProfile {
        track_id: raw.id,
        acousticness: raw.acousticness,
        danceability: raw.danceability,
        tempo: raw.tempo,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixtape_core::Genre;
    use serde_json::json;

    fn track_item() -> JsonValue {
        json!({
            "album": { "name": "Punisher" },
            "artists": [
                { "id": "art-1", "name": "Phoebe Bridgers" },
                { "id": "art-2", "name": "Conor Oberst" }
            ],
            "external_urls": { "spotify": "https://open.spotify.com/track/trk-1" },
            "id": "trk-1",
            "name": "Halloween",
            "popularity": 61,
            "preview_url": null
        })
    }

    #[test]
    fn search_request_carries_query_type_and_limit() {
        let api = CatalogApi::new("https://api.example/v1/");
        let spec = api.track_search("genre:emo", 50);
        assert_eq!(spec.url(), "https://api.example/v1/search");
        assert_eq!(
            spec.cache_key(),
            "https://api.example/v1/search_limit_50_q_genre:emo_type_track"
        );
        assert_eq!(
            api.artist("abc").cache_key(),
            "https://api.example/v1/artists/abc"
        );
        assert_eq!(
            api.audio_features("t1").url(),
            "https://api.example/v1/audio-features/t1"
        );
    }

    #[test]
    fn track_mapping_keeps_first_artist_and_null_preview() {
        let track = map_track(&track_item()).unwrap();
        assert_eq!(track.id, "trk-1");
        assert_eq!(track.album_name, "Punisher");
        assert_eq!(track.artist_id, "art-1");
        assert_eq!(track.artist_name, "Phoebe Bridgers");
        assert_eq!(track.popularity, 61);
        assert_eq!(track.preview_url, None);
        assert_eq!(track.play_url, "https://open.spotify.com/track/trk-1");
    }

    #[test]
    fn track_without_album_is_a_mapping_error() {
        let mut item = track_item();
        item.as_object_mut().unwrap().remove("album");
        let err = map_track(&item).unwrap_err();
        assert_eq!(err.entity(), EntityKind::Track);
        assert_eq!(err.record_id(), Some("trk-1"));
        assert!(err.to_string().contains("`trk-1`"));
    }

    #[test]
    fn track_without_artists_is_a_mapping_error() {
        let mut item = track_item();
        item["artists"] = json!([]);
        let err = map_track(&item).unwrap_err();
        assert!(matches!(err, MappingError::MissingStructure { path: "artists[0]", .. }));
        assert_eq!(err.record_id(), Some("trk-1"));
        assert!(err.to_string().contains("`trk-1`"));
    }

    #[test]
    fn empty_artist_id_names_the_track() {
        let mut item = track_item();
        item["artists"][0]["id"] = json!("");
        let err = map_track(&item).unwrap_err();
        assert!(matches!(
            err,
            MappingError::EmptyIdentifier { field: "artists[0].id", .. }
        ));
        assert_eq!(err.record_id(), Some("trk-1"));
    }

    #[test]
    fn empty_track_id_is_rejected() {
        let mut item = track_item();
        item["id"] = json!("");
        assert!(matches!(
            map_track(&item),
            Err(MappingError::EmptyIdentifier { field: "id", .. })
        ));
    }

    #[test]
    fn page_without_items_is_a_mapping_error() {
        let err = track_page_items(&json!({ "error": { "status": 401 } })).unwrap_err();
        assert_eq!(err.entity(), EntityKind::TrackPage);
    }

    #[test]
    fn artist_mapping_falls_back_when_images_are_absent() {
        let with_images = map_artist(&json!({
            "id": "a1", "name": "Band", "genres": ["rock"],
            "images": [{ "url": "https://img/1" }, { "url": "https://img/2" }]
        }))
        .unwrap();
        assert_eq!(with_images.image_url.as_deref(), Some("https://img/1"));
        assert_eq!(with_images.genre, Genre::Unclassified(vec!["rock".to_string()]));

        let empty = map_artist(&json!({ "id": "a2", "name": "B", "genres": [], "images": [] })).unwrap();
        assert_eq!(empty.image_url, None);

        let absent = map_artist(&json!({ "id": "a3", "name": "C", "genres": [] })).unwrap();
        assert_eq!(absent.image_url, None);
    }

    #[test]
    fn artist_without_genres_is_a_mapping_error() {
        let err = map_artist(&json!({ "id": "a1", "name": "Band" })).unwrap_err();
        assert_eq!(err.entity(), EntityKind::Artist);
    }

    #[test]
    fn feature_mapping_reads_numbers_as_floats() {
        let profile = map_feature_profile(&json!({
            "id": "t1", "acousticness": 0.5, "danceability": 1, "tempo": 120
        }))
        .unwrap();
        assert_eq!(profile.track_id, "t1");
        assert_eq!(profile.danceability, 1.0);
        assert_eq!(profile.tempo, 120.0);

        assert!(map_feature_profile(&json!({ "id": "t1", "acousticness": 0.5 })).is_err());
        assert!(map_feature_profile(&JsonValue::Null).is_err());
    }
}
