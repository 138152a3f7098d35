//! Read side over the relational store: genre lookup, ordering, tempo filter.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

pub const CRATE_NAME: &str = "mixtape-browse";

/// Rows shown per result page.
pub const DEFAULT_PAGE_SIZE: usize = 11;

pub const FAST_TEMPO_MIN: f64 = 150.0;
pub const SLOW_TEMPO_MAX: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrowseRow {
    pub track_name: String,
    pub artist_name: String,
    pub genre: String,
    pub image_url: Option<String>,
    pub album_name: String,
    pub popularity: i64,
    pub tempo: f64,
    pub danceability: f64,
    pub acousticness: f64,
    pub spotify_url: String,
}

/// Tracks whose artist genre contains `genre`. Only tracks with stored
/// features are returned.
pub async fn load_tracks_by_genre(pool: &SqlitePool, genre: &str) -> anyhow::Result<Vec<BrowseRow>> {
    let rows = sqlx::query(
        r#"
        SELECT t.track_name, t.artist_name, a.genre, a.image_url, t.album_name,
               t.popularity, f.tempo, f.danceability, f.acousticness, t.spotify_url
          FROM tracks t
          JOIN artists a ON t.spotify_artist_id = a.spotify_artist_id
          JOIN features f ON t.spotify_track_id = f.spotify_track_id
         WHERE a.genre LIKE ?
         ORDER BY t.rowid
        "#,
    )
    .bind(format!("%{genre}%"))
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(BrowseRow {
            track_name: row.try_get("track_name")?,
            artist_name: row.try_get("artist_name")?,
            genre: row.try_get("genre")?,
            image_url: row.try_get("image_url")?,
            album_name: row.try_get("album_name")?,
            popularity: row.try_get("popularity")?,
            tempo: row.try_get("tempo")?,
            danceability: row.try_get("danceability")?,
            acousticness: row.try_get("acousticness")?,
            spotify_url: row.try_get("spotify_url")?,
        });
    }
    Ok(out)
}

pub async fn play_url_for_track(pool: &SqlitePool, track_name: &str) -> anyhow::Result<Option<String>> {
    let url = sqlx::query_scalar::<_, String>(
        "SELECT spotify_url FROM tracks WHERE track_name = ? ORDER BY rowid LIMIT 1",
    )
    .bind(track_name)
    .fetch_optional(pool)
    .await?;
    Ok(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    /// Most popular first.
    Popularity,
    /// Least popular first.
    Obscurity,
    /// Most danceable first.
    Danceability,
    /// Slowest tempo first.
    Slowest,
    Random,
}

impl FromStr for SortMode {
    type Err = std::convert::Infallible;

    /// Unrecognized input falls back to [`SortMode::Random`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "popularity" => SortMode::Popularity,
            "obscurity" => SortMode::Obscurity,
            "danceability" => SortMode::Danceability,
            "speed (slow)" | "slowest" => SortMode::Slowest,
            _ => SortMode::Random,
        })
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortMode::Popularity => "popularity",
            SortMode::Obscurity => "obscurity",
            SortMode::Danceability => "danceability",
            SortMode::Slowest => "slowest",
            SortMode::Random => "random",
        })
    }
}

/// Orders rows in place. All deterministic modes are stable.
pub fn sort_rows<R: Rng + ?Sized>(rows: &mut [BrowseRow], mode: SortMode, rng: &mut R) {
    match mode {
        SortMode::Popularity => rows.sort_by(|a, b| b.popularity.cmp(&a.popularity)),
        SortMode::Obscurity => rows.sort_by(|a, b| a.popularity.cmp(&b.popularity)),
        SortMode::Danceability => rows.sort_by(|a, b| b.danceability.total_cmp(&a.danceability)),
        SortMode::Slowest => rows.sort_by(|a, b| a.tempo.total_cmp(&b.tempo)),
        SortMode::Random => rows.shuffle(rng),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TempoFilter {
    Fast,
    Slow,
    #[default]
    Any,
}

impl TempoFilter {
    pub fn admits(self, tempo: f64) -> bool {
        match self {
            TempoFilter::Fast => tempo >= FAST_TEMPO_MIN,
            TempoFilter::Slow => tempo <= SLOW_TEMPO_MAX,
            TempoFilter::Any => true,
        }
    }
}

impl FromStr for TempoFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(TempoFilter::Fast),
            "slow" => Ok(TempoFilter::Slow),
            "any" | "" => Ok(TempoFilter::Any),
            other => anyhow::bail!("unknown tempo filter `{other}` (expected fast|slow|any)"),
        }
    }
}

pub fn filter_by_tempo(rows: Vec<BrowseRow>, filter: TempoFilter) -> Vec<BrowseRow> {
    rows.into_iter().filter(|row| filter.admits(row.tempo)).collect()
}

/// Artist names in first-seen order.
pub fn distinct_artists(rows: &[BrowseRow]) -> Vec<String> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter(|row| seen.insert(row.artist_name.as_str()))
        .map(|row| row.artist_name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn row(track: &str, artist: &str, popularity: i64, tempo: f64, danceability: f64) -> BrowseRow {
        BrowseRow {
            track_name: track.to_string(),
            artist_name: artist.to_string(),
            genre: "emo".to_string(),
            image_url: None,
            album_name: "LP".to_string(),
            popularity,
            tempo,
            danceability,
            acousticness: 0.1,
            spotify_url: format!("https://open.spotify.com/track/{track}"),
        }
    }

    fn sample() -> Vec<BrowseRow> {
        vec![
            row("a", "One", 40, 150.0, 0.3),
            row("b", "Two", 80, 99.5, 0.9),
            row("c", "One", 40, 120.0, 0.5),
            row("d", "Three", 10, 100.0, 0.9),
        ]
    }

    fn names(rows: &[BrowseRow]) -> Vec<&str> {
        rows.iter().map(|r| r.track_name.as_str()).collect()
    }

    #[test]
    fn sort_mode_parses_form_values() {
        assert_eq!("popularity".parse::<SortMode>(), Ok(SortMode::Popularity));
        assert_eq!("Obscurity".parse::<SortMode>(), Ok(SortMode::Obscurity));
        assert_eq!("danceability".parse::<SortMode>(), Ok(SortMode::Danceability));
        assert_eq!("speed (slow)".parse::<SortMode>(), Ok(SortMode::Slowest));
        assert_eq!("slowest".parse::<SortMode>(), Ok(SortMode::Slowest));
        assert_eq!("whatever".parse::<SortMode>(), Ok(SortMode::Random));
    }

    #[test]
    fn deterministic_sorts_are_stable() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut rows = sample();

        sort_rows(&mut rows, SortMode::Popularity, &mut rng);
        assert_eq!(names(&rows), vec!["b", "a", "c", "d"]);

        sort_rows(&mut rows, SortMode::Obscurity, &mut rng);
        assert_eq!(names(&rows), vec!["d", "a", "c", "b"]);

        let mut rows = sample();
        sort_rows(&mut rows, SortMode::Danceability, &mut rng);
        assert_eq!(names(&rows), vec!["b", "d", "c", "a"]);

        sort_rows(&mut rows, SortMode::Slowest, &mut rng);
        assert_eq!(names(&rows), vec!["b", "d", "c", "a"]);
    }

    #[test]
    fn random_sort_is_a_permutation() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut rows = sample();
        sort_rows(&mut rows, SortMode::Random, &mut rng);
        let mut shuffled = names(&rows);
        shuffled.sort_unstable();
        assert_eq!(shuffled, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn tempo_filter_bounds_are_inclusive() {
        assert_eq!(names(&filter_by_tempo(sample(), TempoFilter::Fast)), vec!["a"]);
        assert_eq!(names(&filter_by_tempo(sample(), TempoFilter::Slow)), vec!["b", "d"]);
        assert_eq!(filter_by_tempo(sample(), TempoFilter::Any).len(), 4);
        assert!("medium".parse::<TempoFilter>().is_err());
    }

    #[test]
    fn distinct_artists_keeps_first_seen_order() {
        assert_eq!(distinct_artists(&sample()), vec!["One", "Two", "Three"]);
        assert!(distinct_artists(&[]).is_empty());
    }
}
