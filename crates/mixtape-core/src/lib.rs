//! Core domain model for Mixtape: the normalized catalog entities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mixtape-core";

/// Entities that carry a stable natural identifier from the catalog.
pub trait Identified {
    fn natural_id(&self) -> &str;
}

/// A catalog track, normalized from one search-result item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub album_name: String,
    pub artist_name: String,
    pub artist_id: String,
    pub popularity: u32,
    /// `None` when the catalog has no preview clip for the track.
    pub preview_url: Option<String>,
    pub play_url: String,
}

impl Identified for Track {
    fn natural_id(&self) -> &str {
        &self.id
    }
}

/// Closed taxonomy produced by genre classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenreLabel {
    #[serde(rename = "emo")]
    Emo,
    #[serde(rename = "alternative")]
    Alternative,
    #[serde(rename = "indie")]
    Indie,
    #[serde(rename = "rock")]
    Rock,
    #[serde(rename = "hip-hop")]
    HipHop,
    #[serde(rename = "pop")]
    Pop,
}

impl GenreLabel {
    pub const ALL: [GenreLabel; 6] = [
        GenreLabel::Emo,
        GenreLabel::Alternative,
        GenreLabel::Indie,
        GenreLabel::Rock,
        GenreLabel::HipHop,
        GenreLabel::Pop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GenreLabel::Emo => "emo",
            GenreLabel::Alternative => "alternative",
            GenreLabel::Indie => "indie",
            GenreLabel::Rock => "rock",
            GenreLabel::HipHop => "hip-hop",
            GenreLabel::Pop => "pop",
        }
    }
}

impl fmt::Display for GenreLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenreLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GenreLabel::ALL
            .into_iter()
            .find(|label| label.as_str() == s)
            .ok_or_else(|| format!("unknown genre label `{s}`"))
    }
}

/// Genre state of an artist: a taxonomy label, or the untouched raw tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Genre {
    Classified(GenreLabel),
    Unclassified(Vec<String>),
}

impl Genre {
    pub fn label(&self) -> Option<GenreLabel> {
        match self {
            Genre::Classified(label) => Some(*label),
            Genre::Unclassified(_) => None,
        }
    }

    /// Text stored in the relational genre column.
    pub fn storage_value(&self) -> String {
        match self {
            Genre::Classified(label) => label.as_str().to_string(),
            Genre::Unclassified(tags) => render_tags(tags),
        }
    }
}

/// Renders a raw tag list as one string (a JSON array), e.g. `["pop punk","rock"]`.
pub fn render_tags(tags: &[String]) -> String {
    serde_json::Value::from(tags.to_vec()).to_string()
}

/// A catalog artist. `genre` starts as the raw tag list and is replaced by classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub genre_tags: Vec<String>,
    pub genre: Genre,
    pub image_url: Option<String>,
}

impl Artist {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        genre_tags: Vec<String>,
        image_url: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            genre: Genre::Unclassified(genre_tags.clone()),
            genre_tags,
            image_url,
        }
    }

    pub fn with_genre(self, genre: Genre) -> Self {
        Self { genre, ..self }
    }
}

impl Identified for Artist {
    fn natural_id(&self) -> &str {
        &self.id
    }
}

/// Audio features for one track, keyed by the catalog track id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureProfile {
    pub track_id: String,
    pub acousticness: f64,
    pub danceability: f64,
    pub tempo: f64,
}

impl Identified for FeatureProfile {
    fn natural_id(&self) -> &str {
        &self.track_id
    }
}
