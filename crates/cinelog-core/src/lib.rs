//! Core domain model and pure engines for the cinelog film diary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cinelog-core";

/// Ratings are half-star values on a 0–5 scale.
pub const RATING_SCALE: f64 = 5.0;
/// Cast is truncated to the first entries in provider order.
pub const MAX_CAST: usize = 10;
/// Upper bound on curated similar-film entries per record.
pub const MAX_SIMILAR: usize = 5;

/// Canonical film URL for a catalog slug. The trailing slash matters: duplicate
/// detection matches on the `/{slug}/` suffix.
pub fn film_url_for_slug(slug: &str) -> String {
    format!("https://letterboxd.com/film/{slug}/")
}

/// One persisted film in the shared collection. Field names mirror the on-disk
/// store consumed by the site frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilmRecord {
    pub id: u64,
    #[serde(rename = "Film_title")]
    pub title: String,
    #[serde(rename = "Poster_Movie")]
    pub poster: String,
    #[serde(rename = "Release_year")]
    pub release_year: u16,
    #[serde(rename = "Director")]
    pub director: String,
    #[serde(rename = "Cast")]
    pub cast: Vec<String>,
    #[serde(rename = "Average_rating")]
    pub average_rating: f64,
    #[serde(rename = "Genres")]
    pub genres: Vec<String>,
    #[serde(rename = "Themes")]
    pub themes: Vec<String>,
    #[serde(rename = "Nanogenres")]
    pub nanogenres: Vec<String>,
    #[serde(rename = "Runtime")]
    pub runtime: u32,
    #[serde(rename = "Countries")]
    pub countries: Vec<String>,
    #[serde(rename = "Original_language")]
    pub original_language: String,
    #[serde(rename = "Spoken_languages")]
    pub spoken_languages: Vec<String>,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Studios")]
    pub studios: Vec<String>,
    #[serde(rename = "Film_URL")]
    pub film_url: String,
    #[serde(rename = "Rating_A")]
    pub rating_a: f64,
    #[serde(rename = "Rating_B")]
    pub rating_b: f64,
    #[serde(rename = "Similar_films", skip_serializing_if = "Option::is_none")]
    pub similar_films: Option<Vec<SimilarFilmEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimilarFilmEntry {
    pub slug: String,
    pub title: String,
    pub url: String,
    pub poster: String,
}

/// Collection-wide summary, derived from the film records and never mutated
/// independently. Persisted as a single-element list for frontend compatibility.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeneralStats {
    #[serde(rename = "Total_Films")]
    pub total_films: usize,
    #[serde(rename = "Compatibility")]
    pub compatibility: f64,
    #[serde(rename = "Sum_Rating_A")]
    pub sum_rating_a: f64,
    #[serde(rename = "Sum_Rating_B")]
    pub sum_rating_b: f64,
    #[serde(rename = "Avatar_A")]
    pub avatar_a: String,
    #[serde(rename = "Avatar_B")]
    pub avatar_b: String,
}

/// One queued film waiting for ingestion, with the ratings to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingItem {
    pub slug: String,
    pub rating_a: f64,
    pub rating_b: f64,
}

/// A job whose retries were exhausted, parked for out-of-band reprocessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub slug: String,
    pub rating_a: f64,
    pub rating_b: f64,
    pub failed_at: DateTime<Utc>,
}

/// Set of already-watched slugs. Backed by an insertion-ordered list so the
/// persisted form is stable, but the order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchedSet {
    slugs: Vec<String>,
}

impl WatchedSet {
    pub fn contains(&self, slug: &str) -> bool {
        self.slugs.iter().any(|s| s == slug)
    }

    /// Inserts a slug, returning `false` when it was already present.
    pub fn insert(&mut self, slug: &str) -> bool {
        if self.contains(slug) {
            return false;
        }
        self.slugs.push(slug.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.slugs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slugs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.slugs.iter().map(String::as_str)
    }
}

impl FromIterator<String> for WatchedSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set = WatchedSet::default();
        for slug in iter {
            set.insert(&slug);
        }
        set
    }
}

/// Provider tag with its type discriminator, the key for bucket partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilmTag {
    pub name: String,
    pub kind: TagKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagKind {
    Genre,
    Theme,
    MiniTheme,
}

/// Pre-normalized handoff contract from the catalog client into the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilmMetadata {
    pub title: String,
    pub year: u16,
    pub director: Option<String>,
    pub cast: Vec<String>,
    pub tags: Vec<FilmTag>,
    pub average_rating: f64,
    pub runtime: u32,
    pub description: String,
    pub poster: Option<String>,
    pub tmdb_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedDetails {
    pub countries: Vec<String>,
    pub languages: Vec<String>,
    pub studios: Vec<String>,
}

/// Raw similar-film candidate as the provider lists it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarCandidate {
    pub title: Option<String>,
    pub url: Option<String>,
}

/// Exact-suffix duplicate check against each record's canonical URL. A slug that
/// merely appears elsewhere in a longer URL does not count.
pub fn collection_contains(films: &[FilmRecord], slug: &str) -> bool {
    let suffix = format!("/{slug}/");
    films.iter().any(|f| f.film_url.ends_with(&suffix))
}

/// Next identifier: running maximum plus one. Monotonic but not dense; gaps left
/// by earlier partial runs are never refilled.
pub fn next_film_id(films: &[FilmRecord]) -> u64 {
    films.iter().map(|f| f.id).max().unwrap_or(0) + 1
}

/// Builds the persisted record from fetched metadata and the queued ratings.
pub fn build_record(
    slug: &str,
    id: u64,
    core: FilmMetadata,
    extended: ExtendedDetails,
    poster: String,
    rating_a: f64,
    rating_b: f64,
) -> FilmRecord {
    let mut genres = Vec::new();
    let mut themes = Vec::new();
    let mut nanogenres = Vec::new();
    for tag in core.tags {
        match tag.kind {
            TagKind::Genre => genres.push(tag.name),
            TagKind::Theme => themes.push(tag.name),
            TagKind::MiniTheme => nanogenres.push(tag.name),
        }
    }

    let mut cast = core.cast;
    cast.truncate(MAX_CAST);

    let original_language = extended
        .languages
        .first()
        .cloned()
        .unwrap_or_else(|| "English".to_string());
    let mut spoken_languages = Vec::new();
    for language in extended.languages {
        if !spoken_languages.contains(&language) {
            spoken_languages.push(language);
        }
    }

    FilmRecord {
        id,
        title: core.title,
        poster,
        release_year: core.year,
        director: core.director.unwrap_or_else(|| "N/A".to_string()),
        cast,
        average_rating: core.average_rating,
        genres,
        themes,
        nanogenres,
        runtime: core.runtime,
        countries: extended.countries,
        original_language,
        spoken_languages,
        description: core.description,
        studios: extended.studios,
        film_url: film_url_for_slug(slug),
        rating_a,
        rating_b,
        similar_films: None,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Recomputes the collection summary from scratch. Per-film compatibility is
/// `1 - |ra - rb| / 5`; the overall figure is the mean expressed as a percentage,
/// 0 for an empty collection.
pub fn recompute_stats(films: &[FilmRecord], avatar_a: &str, avatar_b: &str) -> GeneralStats {
    let total_films = films.len();
    let compatibility = if films.is_empty() {
        0.0
    } else {
        let sum: f64 = films
            .iter()
            .map(|f| 1.0 - (f.rating_a - f.rating_b).abs() / RATING_SCALE)
            .sum();
        round2(sum / total_films as f64 * 100.0)
    };

    GeneralStats {
        total_films,
        compatibility,
        sum_rating_a: round1(films.iter().map(|f| f.rating_a).sum()),
        sum_rating_b: round1(films.iter().map(|f| f.rating_b).sum()),
        avatar_a: avatar_a.to_string(),
        avatar_b: avatar_b.to_string(),
    }
}
