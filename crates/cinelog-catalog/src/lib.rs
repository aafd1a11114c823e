//! External catalog and poster-provider seam, plus the retry/backoff engine
//! that wraps every catalog fetch.
//!
//! Failures are explicit result variants, never panics: a fetch ends in
//! `Fetched`, `NotFound`, or `Exhausted`, and the orchestrator branches on all
//! three.

use std::future::Future;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use cinelog_core::{ExtendedDetails, FilmMetadata, FilmTag, SimilarCandidate, TagKind};
use rand::Rng;
use reqwest::{header::USER_AGENT, StatusCode};
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cinelog-catalog";

/// Single-attempt failure taxonomy for both providers.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network or page-layout trouble; worth retrying.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// The catalog has no such film; retrying cannot help.
    #[error("not found in catalog: {0}")]
    NotFound(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Everything one ingestion needs from the catalog, fetched as a unit.
#[derive(Debug, Clone)]
pub struct FetchedFilm {
    pub core: FilmMetadata,
    pub extended: ExtendedDetails,
    /// Provider iteration order is preserved; the curator depends on it.
    pub similar: Vec<(String, SimilarCandidate)>,
}

/// Per-call configuration handed to every provider call. Identity is explicit
/// here rather than process-global so runs stay reproducible.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub user_agent: String,
}

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Pool of client identities; each attempt draws one at random to decorrelate
/// throttling across retries.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    user_agents: Vec<String>,
}

impl IdentityPool {
    pub fn new(user_agents: Vec<String>) -> Self {
        Self { user_agents }
    }

    pub fn draw(&self) -> CallContext {
        if self.user_agents.is_empty() {
            return CallContext {
                user_agent: DEFAULT_USER_AGENT.to_string(),
            };
        }
        let index = rand::rng().random_range(0..self.user_agents.len());
        CallContext {
            user_agent: self.user_agents[index].clone(),
        }
    }
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn fetch_core(&self, ctx: &CallContext, slug: &str) -> Result<FilmMetadata, FetchError>;

    async fn fetch_extended(
        &self,
        ctx: &CallContext,
        slug: &str,
    ) -> Result<ExtendedDetails, FetchError>;

    async fn fetch_similar(
        &self,
        ctx: &CallContext,
        slug: &str,
    ) -> Result<Vec<(String, SimilarCandidate)>, FetchError>;
}

#[async_trait]
pub trait PosterResolver: Send + Sync {
    /// Resolves a poster from a provider deep link; `None` when unmatched.
    async fn resolve_by_link(&self, link: &str) -> Result<Option<String>, FetchError>;

    /// Free-text search. Yields `(poster_url, canonical_title)` or `None`.
    async fn resolve_by_text(&self, query: &str) -> Result<Option<(String, String)>, FetchError>;
}

/// Bounded exponential backoff with uniform jitter, plus a randomized pre-call
/// delay so request patterns never burst.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_jitter: Duration,
    pub precall_min: Duration,
    pub precall_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(30),
            max_jitter: Duration::from_secs(10),
            precall_min: Duration::from_secs(2),
            precall_max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Deterministic backoff component after `failed_attempt` (1-based) failed:
    /// `initial_delay * 2^(failed_attempt - 1)`.
    pub fn deterministic_delay(&self, failed_attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(failed_attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    fn jitter(&self) -> Duration {
        random_duration_up_to(self.max_jitter)
    }

    fn precall_delay(&self) -> Duration {
        random_duration_between(self.precall_min, self.precall_max)
    }
}

fn random_duration_up_to(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max.as_millis() as u64))
}

fn random_duration_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    Duration::from_millis(
        rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64),
    )
}

/// Terminal result of a retried fetch. A single transient failure never escapes
/// the engine; only exhaustion or a definitive miss does.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Fetched(T),
    NotFound { reason: String },
    Exhausted { attempts: u32, last_error: FetchError },
}

/// Drives `op` through the policy: attempt 1 runs immediately, later attempts
/// sleep the deterministic backoff plus jitter first. Every attempt draws a
/// fresh identity and waits the randomized pre-call delay.
pub async fn retry_fetch<T, F, Fut>(
    policy: &RetryPolicy,
    identities: &IdentityPool,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(CallContext) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        if attempt > 1 {
            let delay = policy.deterministic_delay(attempt - 1) + policy.jitter();
            debug!(attempt, ?delay, "backing off before retry");
            tokio::time::sleep(delay).await;
        }
        let precall = policy.precall_delay();
        if !precall.is_zero() {
            tokio::time::sleep(precall).await;
        }

        match op(identities.draw()).await {
            Ok(value) => return RetryOutcome::Fetched(value),
            Err(FetchError::NotFound(reason)) => return RetryOutcome::NotFound { reason },
            Err(err) => {
                warn!(attempt, %err, "catalog attempt failed");
                last_error = Some(err);
            }
        }
    }

    RetryOutcome::Exhausted {
        attempts: policy.max_attempts.max(1),
        last_error: last_error.expect("retry loop always records the final transient error"),
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> FetchError {
    FetchError::Transient(err.to_string())
}

fn selector(input: &str) -> Result<Selector, FetchError> {
    // A selector that fails to parse is a bug, but it surfaces the same way a
    // shifted page layout does.
    Selector::parse(input).map_err(|e| FetchError::Transient(e.to_string()))
}

fn select_first_text(document: &Html, sel: &str) -> Result<Option<String>, FetchError> {
    let sel = selector(sel)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_all_texts(document: &Html, sel: &str) -> Result<Vec<String>, FetchError> {
    let sel = selector(sel)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

fn select_first_attr(
    document: &Html,
    sel: &str,
    attr: &str,
) -> Result<Option<String>, FetchError> {
    let sel = selector(sel)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_integer(text: &str) -> Option<u32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Parses a film page into the handoff metadata. A page without a recognizable
/// title is treated as a layout failure, i.e. transient.
pub fn parse_film_page(html: &str) -> Result<FilmMetadata, FetchError> {
    let document = Html::parse_document(html);

    let title = select_first_text(&document, "h1.headline-1 span.name")?
        .or(select_first_text(&document, "h1.headline-1")?)
        .ok_or_else(|| FetchError::Transient("film page missing title".to_string()))?;

    let year = select_first_text(&document, ".releaseyear a")?
        .and_then(|t| t.parse::<u16>().ok())
        .unwrap_or(0);

    let director = select_first_text(&document, "span.directorlist a.contributor")?;

    let cast = select_all_texts(&document, "#tab-cast .cast-list a.text-slug")?;

    let mut tags = Vec::new();
    let anchor_sel = selector("#tab-genres a[href]")?;
    for node in document.select(&anchor_sel) {
        let Some(href) = node.value().attr("href") else {
            continue;
        };
        let Some(name) = text_or_none(node.text().collect::<String>()) else {
            continue;
        };
        let kind = if href.contains("/films/genre/") {
            TagKind::Genre
        } else if href.contains("/films/mini-theme/") || href.contains("/films/nanogenre/") {
            TagKind::MiniTheme
        } else if href.contains("/films/theme/") {
            TagKind::Theme
        } else {
            continue;
        };
        tags.push(FilmTag { name, kind });
    }

    // Rendered as e.g. "3.85 out of 5".
    let average_rating = select_first_attr(&document, r#"meta[name="twitter:data2"]"#, "content")?
        .and_then(|t| t.split_whitespace().next().and_then(|v| v.parse().ok()))
        .unwrap_or(0.0);

    let runtime = select_first_text(&document, "p.text-link.text-footer")?
        .as_deref()
        .filter(|t| t.contains("min"))
        .and_then(first_integer)
        .unwrap_or(0);

    let description = select_first_attr(&document, r#"meta[property="og:description"]"#, "content")?
        .or(select_first_text(&document, ".truncate p")?)
        .unwrap_or_default();

    let poster = select_first_attr(&document, r#"meta[property="og:image"]"#, "content")?;

    let tmdb_link = select_first_attr(&document, r#"a[href*="themoviedb.org/movie/"]"#, "href")?;

    Ok(FilmMetadata {
        title,
        year,
        director,
        cast,
        tags,
        average_rating,
        runtime,
        description,
        poster,
        tmdb_link,
    })
}

pub fn parse_details_page(html: &str) -> Result<ExtendedDetails, FetchError> {
    let document = Html::parse_document(html);
    Ok(ExtendedDetails {
        countries: select_all_texts(&document, r#"#tab-details a[href*="/films/country/"]"#)?,
        languages: select_all_texts(&document, r#"#tab-details a[href*="/films/language/"]"#)?,
        studios: select_all_texts(&document, r#"#tab-details a[href*="/studio/"]"#)?,
    })
}

/// Extracts similar-film candidates in page order. `base_url` absolutizes the
/// relative film links the provider emits.
pub fn parse_similar_page(
    html: &str,
    base_url: &str,
) -> Result<Vec<(String, SimilarCandidate)>, FetchError> {
    let document = Html::parse_document(html);
    let poster_sel = selector("div.film-poster")?;
    let img_sel = selector("img")?;

    let mut candidates = Vec::new();
    for node in document.select(&poster_sel) {
        let Some(slug) = node.value().attr("data-film-slug") else {
            continue;
        };
        let url = node
            .value()
            .attr("data-target-link")
            .map(|link| format!("{}{link}", base_url.trim_end_matches('/')));
        let title = node
            .select(&img_sel)
            .next()
            .and_then(|img| img.value().attr("alt"))
            .and_then(|alt| text_or_none(alt.to_string()));
        candidates.push((slug.to_string(), SimilarCandidate { title, url }));
    }
    Ok(candidates)
}

/// Catalog client scraping the provider's film pages over HTTP.
#[derive(Debug)]
pub struct HttpCatalogClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building catalog http client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_html(&self, ctx: &CallContext, url: &str) -> Result<String, FetchError> {
        let response = self
            .http
            .get(url)
            .header(USER_AGENT, &ctx.user_agent)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("http {status} for {url}")));
        }
        response.text().await.map_err(classify_reqwest_error)
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn fetch_core(&self, ctx: &CallContext, slug: &str) -> Result<FilmMetadata, FetchError> {
        let url = format!("{}/film/{slug}/", self.base_url);
        let html = self.get_html(ctx, &url).await?;
        parse_film_page(&html)
    }

    async fn fetch_extended(
        &self,
        ctx: &CallContext,
        slug: &str,
    ) -> Result<ExtendedDetails, FetchError> {
        let url = format!("{}/film/{slug}/details/", self.base_url);
        let html = self.get_html(ctx, &url).await?;
        parse_details_page(&html)
    }

    async fn fetch_similar(
        &self,
        ctx: &CallContext,
        slug: &str,
    ) -> Result<Vec<(String, SimilarCandidate)>, FetchError> {
        let url = format!("{}/film/{slug}/similar/", self.base_url);
        let html = self.get_html(ctx, &url).await?;
        parse_similar_page(&html, &self.base_url)
    }
}

pub const TMDB_API_BASE: &str = "https://api.themoviedb.org/3";
pub const TMDB_IMAGE_BASE: &str = "https://image.tmdb.org/t/p/w300_and_h450_bestv2";

#[derive(Debug, Deserialize)]
struct TmdbMovie {
    title: String,
    poster_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmdbSearchResponse {
    results: Vec<TmdbMovie>,
}

/// Poster resolver backed by the TMDB API.
#[derive(Debug)]
pub struct TmdbPosterResolver {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl TmdbPosterResolver {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building tmdb http client")?;
        Ok(Self {
            http,
            base_url: TMDB_API_BASE.to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, FetchError> {
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("http {status} for {url}")));
        }
        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(classify_reqwest_error)
    }
}

/// Trailing numeric path segment of a TMDB deep link, if it has one.
pub fn tmdb_id_from_link(link: &str) -> Option<&str> {
    link.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()))
}

#[async_trait]
impl PosterResolver for TmdbPosterResolver {
    async fn resolve_by_link(&self, link: &str) -> Result<Option<String>, FetchError> {
        let Some(id) = tmdb_id_from_link(link) else {
            return Ok(None);
        };
        let url = format!("{}/movie/{id}", self.base_url);
        let movie: Option<TmdbMovie> = self
            .get_json(&url, &[("api_key", self.api_key.as_str())])
            .await?;
        Ok(movie
            .and_then(|m| m.poster_path)
            .map(|path| format!("{TMDB_IMAGE_BASE}{path}")))
    }

    async fn resolve_by_text(&self, query: &str) -> Result<Option<(String, String)>, FetchError> {
        let url = format!("{}/search/movie", self.base_url);
        let response: Option<TmdbSearchResponse> = self
            .get_json(&url, &[("api_key", self.api_key.as_str()), ("query", query)])
            .await?;
        let Some(response) = response else {
            return Ok(None);
        };
        // Poster and title come as a pair; a hit without either is no match.
        Ok(response.results.into_iter().find_map(|movie| {
            movie
                .poster_path
                .map(|path| (format!("{TMDB_IMAGE_BASE}{path}"), movie.title))
        }))
    }
}
