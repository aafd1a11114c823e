//! Ingestion orchestration: pulls pending films through
//! fetch → dedup → curate → recompute → persist → dequeue, escalating jobs
//! whose retries are exhausted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cinelog_catalog::{
    retry_fetch, CatalogClient, FetchedFilm, HttpCatalogClient, IdentityPool, PosterResolver,
    RetryOutcome, RetryPolicy, TmdbPosterResolver,
};
use cinelog_core::{
    build_record, collection_contains, film_url_for_slug, next_film_id, recompute_stats,
    PendingItem, SimilarCandidate, SimilarFilmEntry, WatchedSet, MAX_SIMILAR,
};
use cinelog_store::{
    CollectionStore, FailedQueueStore, PendingQueueStore, StorePaths, WatchedSetStore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cinelog-ingest";

pub const CONFIG_FILE: &str = "cinelog.yaml";
pub const ROOT_ENV_VAR: &str = "CINELOG_ROOT";

fn default_catalog_base_url() -> String {
    "https://letterboxd.com".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_secs() -> u64 {
    30
}

fn default_curation_delay_ms() -> u64 {
    1200
}

fn default_http_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantConfig {
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

/// Run configuration, read from `cinelog.yaml` under the workspace root.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_catalog_base_url")]
    pub catalog_base_url: String,
    #[serde(default)]
    pub tmdb_api_key: String,
    /// Identity pool for catalog calls; empty means a single built-in agent.
    #[serde(default)]
    pub user_agents: Vec<String>,
    pub participant_a: ParticipantConfig,
    pub participant_b: ParticipantConfig,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_curation_delay_ms")]
    pub curation_delay_ms: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(skip)]
    pub root: PathBuf,
}

impl IngestConfig {
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let path = root.join(CONFIG_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: IngestConfig =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.root = root;
        Ok(config)
    }

    pub fn root_from_env() -> PathBuf {
        std::env::var(ROOT_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
    }

    pub fn store_paths(&self) -> StorePaths {
        StorePaths::under(&self.root)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            ..RetryPolicy::default()
        }
    }

    pub fn curation_delay(&self) -> Duration {
        Duration::from_millis(self.curation_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Builds up to [`MAX_SIMILAR`] related-film entries from the provider's
/// candidates, in provider order, skipping anything already watched. Candidates
/// the resolver cannot name are dropped outright; a resolver failure counts as
/// "no match" and never aborts the ingestion.
pub async fn curate_similar(
    candidates: &[(String, SimilarCandidate)],
    watched: &WatchedSet,
    resolver: &dyn PosterResolver,
    throttle: Duration,
) -> Vec<SimilarFilmEntry> {
    let mut entries = Vec::new();
    for (slug, candidate) in candidates {
        if entries.len() == MAX_SIMILAR {
            break;
        }
        if watched.contains(slug) {
            debug!(slug, "similar candidate already watched; skipping");
            continue;
        }

        let query = slug.replace(['-', '_'], " ");
        match resolver.resolve_by_text(&query).await {
            Ok(Some((poster, title))) => entries.push(SimilarFilmEntry {
                slug: slug.clone(),
                title,
                url: candidate
                    .url
                    .clone()
                    .unwrap_or_else(|| film_url_for_slug(slug)),
                poster,
            }),
            Ok(None) => debug!(slug, "no poster match; dropping candidate"),
            Err(err) => warn!(slug, %err, "poster resolution failed; dropping candidate"),
        }

        if !throttle.is_zero() {
            tokio::time::sleep(throttle).await;
        }
    }
    entries
}

/// Decision for the calling automation: start a run or skip this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueGate {
    Proceed { queued: usize },
    Skip,
}

pub fn queue_gate(queue: &[PendingItem]) -> QueueGate {
    if queue.is_empty() {
        QueueGate::Skip
    } else {
        QueueGate::Proceed {
            queued: queue.len(),
        }
    }
}

/// Loads the pending queue under `root` and gates on it. A missing queue file
/// reads as empty, so a fresh workspace gates to [`QueueGate::Skip`].
pub async fn check_queue(root: impl AsRef<Path>) -> Result<QueueGate> {
    let paths = StorePaths::under(root);
    let queue = PendingQueueStore::new(&paths.pending).load().await?;
    Ok(queue_gate(&queue))
}

/// Outcome of one pending item, reported as the item completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Ingested { id: u64 },
    SkippedDuplicate,
    Escalated,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub ingested: usize,
    pub skipped: usize,
    pub escalated: usize,
}

/// The single owner of the in-memory collection during a run. Items are
/// processed strictly one at a time; the only suspension points are the
/// engine's backoff sleeps and the curator's throttle delays.
pub struct IngestPipeline {
    config: IngestConfig,
    collection: CollectionStore,
    pending: PendingQueueStore,
    failed: FailedQueueStore,
    watched_a: WatchedSetStore,
    watched_b: WatchedSetStore,
    watched_couple: WatchedSetStore,
    catalog: Box<dyn CatalogClient>,
    posters: Box<dyn PosterResolver>,
    identities: IdentityPool,
    policy: RetryPolicy,
}

impl IngestPipeline {
    pub fn new(
        config: IngestConfig,
        catalog: Box<dyn CatalogClient>,
        posters: Box<dyn PosterResolver>,
    ) -> Self {
        let paths = config.store_paths();
        let identities = IdentityPool::new(config.user_agents.clone());
        let policy = config.retry_policy();
        Self {
            collection: CollectionStore::new(&paths.collection, &paths.backup),
            pending: PendingQueueStore::new(&paths.pending),
            failed: FailedQueueStore::new(&paths.failed),
            watched_a: WatchedSetStore::new(&paths.watched_a),
            watched_b: WatchedSetStore::new(&paths.watched_b),
            watched_couple: WatchedSetStore::new(&paths.watched_couple),
            catalog,
            posters,
            identities,
            policy,
            config,
        }
    }

    /// Wires up the production HTTP collaborators.
    pub fn from_config(config: IngestConfig) -> Result<Self> {
        let catalog = HttpCatalogClient::new(&config.catalog_base_url, config.http_timeout())?;
        let posters = TmdbPosterResolver::new(&config.tmdb_api_key, config.http_timeout())?;
        Ok(Self::new(config, Box::new(catalog), Box::new(posters)))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Processes only the head-of-queue item, if any.
    pub async fn process_next(&self) -> Result<RunSummary> {
        self.run(false).await
    }

    /// Processes every currently pending item, sequentially.
    pub async fn process_all(&self) -> Result<RunSummary> {
        self.run(true).await
    }

    async fn run(&self, batch: bool) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let queue = self.pending.load().await?;
        let items: Vec<PendingItem> = if batch {
            queue
        } else {
            queue.into_iter().take(1).collect()
        };

        let mut ingested = 0usize;
        let mut skipped = 0usize;
        let mut escalated = 0usize;

        for item in &items {
            match self.process_item(run_id, item).await? {
                ItemOutcome::Ingested { id } => {
                    ingested += 1;
                    self.pending.remove(&item.slug).await?;
                    info!(%run_id, slug = %item.slug, id, "ingested and dequeued");
                }
                ItemOutcome::SkippedDuplicate => {
                    skipped += 1;
                    self.pending.remove(&item.slug).await?;
                    info!(%run_id, slug = %item.slug, "duplicate skipped and dequeued");
                }
                ItemOutcome::Escalated => {
                    // Pending entry stays put so the rating is not lost.
                    escalated += 1;
                    warn!(%run_id, slug = %item.slug, "escalated to failed queue");
                }
            }
        }

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            processed: items.len(),
            ingested,
            skipped,
            escalated,
        })
    }

    async fn process_item(&self, run_id: Uuid, item: &PendingItem) -> Result<ItemOutcome> {
        let mut collection = self.collection.load().await?;
        if collection_contains(&collection.movies_info, &item.slug) {
            info!(%run_id, slug = %item.slug, "already in collection; skipping");
            return Ok(ItemOutcome::SkippedDuplicate);
        }

        let fetched = match self.fetch_with_retry(&item.slug).await {
            RetryOutcome::Fetched(fetched) => fetched,
            RetryOutcome::NotFound { reason } => {
                warn!(%run_id, slug = %item.slug, reason, "film not found in catalog");
                self.failed.escalate(item, Utc::now()).await?;
                return Ok(ItemOutcome::Escalated);
            }
            RetryOutcome::Exhausted { attempts, last_error } => {
                warn!(%run_id, slug = %item.slug, attempts, %last_error, "retries exhausted");
                self.failed.escalate(item, Utc::now()).await?;
                return Ok(ItemOutcome::Escalated);
            }
        };

        let poster = self.resolve_poster(&fetched).await;
        let id = next_film_id(&collection.movies_info);
        let mut record = build_record(
            &item.slug,
            id,
            fetched.core,
            fetched.extended,
            poster,
            item.rating_a,
            item.rating_b,
        );

        let watched = self.watched_couple.load().await?;
        record.similar_films = Some(
            curate_similar(
                &fetched.similar,
                &watched,
                self.posters.as_ref(),
                self.config.curation_delay(),
            )
            .await,
        );

        collection.movies_info.push(record);
        let stats = recompute_stats(
            &collection.movies_info,
            &self.config.participant_a.avatar,
            &self.config.participant_b.avatar,
        );
        collection.set_stats(stats);
        self.collection.commit(&collection).await?;

        self.watched_a.append(&item.slug).await?;
        self.watched_b.append(&item.slug).await?;
        self.watched_couple.append(&item.slug).await?;

        Ok(ItemOutcome::Ingested { id })
    }

    async fn fetch_with_retry(&self, slug: &str) -> RetryOutcome<FetchedFilm> {
        retry_fetch(&self.policy, &self.identities, |ctx| {
            let catalog = self.catalog.as_ref();
            async move {
                let core = catalog.fetch_core(&ctx, slug).await?;
                let extended = catalog.fetch_extended(&ctx, slug).await?;
                let similar = catalog.fetch_similar(&ctx, slug).await?;
                Ok(FetchedFilm {
                    core,
                    extended,
                    similar,
                })
            }
        })
        .await
    }

    /// Poster preference: provider deep link through the resolver, falling back
    /// to whatever the catalog page itself advertised.
    async fn resolve_poster(&self, fetched: &FetchedFilm) -> String {
        let resolved = match &fetched.core.tmdb_link {
            Some(link) => match self.posters.resolve_by_link(link).await {
                Ok(poster) => poster,
                Err(err) => {
                    warn!(%err, "poster link resolution failed; using catalog poster");
                    None
                }
            },
            None => None,
        };
        resolved
            .or_else(|| fetched.core.poster.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cinelog_catalog::FetchError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MapResolver {
        by_query: HashMap<String, (String, String)>,
        failing_queries: Vec<String>,
        calls: AtomicU32,
    }

    impl MapResolver {
        fn new(by_query: HashMap<String, (String, String)>) -> Self {
            Self {
                by_query,
                failing_queries: Vec::new(),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PosterResolver for MapResolver {
        async fn resolve_by_link(&self, _link: &str) -> Result<Option<String>, FetchError> {
            Ok(None)
        }

        async fn resolve_by_text(
            &self,
            query: &str,
        ) -> Result<Option<(String, String)>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_queries.iter().any(|q| q == query) {
                return Err(FetchError::Transient("resolver down".to_string()));
            }
            Ok(self.by_query.get(query).cloned())
        }
    }

    fn candidate(slug: &str) -> (String, SimilarCandidate) {
        (
            slug.to_string(),
            SimilarCandidate {
                title: Some(slug.to_string()),
                url: Some(format!("https://letterboxd.com/film/{slug}/")),
            },
        )
    }

    fn resolved(slug: &str) -> (String, (String, String)) {
        (
            slug.replace(['-', '_'], " "),
            (format!("https://img.example/{slug}.jpg"), slug.to_string()),
        )
    }

    #[tokio::test]
    async fn curator_caps_entries_and_keeps_provider_order() {
        let candidates: Vec<_> = (0..8).map(|i| candidate(&format!("film-{i}"))).collect();
        let resolver =
            MapResolver::new((0..8).map(|i| resolved(&format!("film-{i}"))).collect());

        let entries = curate_similar(
            &candidates,
            &WatchedSet::default(),
            &resolver,
            Duration::ZERO,
        )
        .await;

        assert_eq!(entries.len(), MAX_SIMILAR);
        let slugs: Vec<_> = entries.iter().map(|e| e.slug.as_str()).collect();
        assert_eq!(slugs, vec!["film-0", "film-1", "film-2", "film-3", "film-4"]);
    }

    #[tokio::test]
    async fn curator_skips_watched_and_keeps_examining_past_them() {
        let candidates: Vec<_> = (0..8).map(|i| candidate(&format!("film-{i}"))).collect();
        let resolver =
            MapResolver::new((0..8).map(|i| resolved(&format!("film-{i}"))).collect());
        let watched: WatchedSet = ["film-0", "film-2"]
            .into_iter()
            .map(String::from)
            .collect();

        let entries = curate_similar(&candidates, &watched, &resolver, Duration::ZERO).await;

        let slugs: Vec<_> = entries.iter().map(|e| e.slug.as_str()).collect();
        assert_eq!(slugs, vec!["film-1", "film-3", "film-4", "film-5", "film-6"]);
    }

    #[tokio::test]
    async fn curator_drops_unresolved_and_failing_candidates_entirely() {
        let candidates = vec![candidate("good-one"), candidate("no-match"), candidate("broken")];
        let mut resolver = MapResolver::new([resolved("good-one")].into_iter().collect());
        resolver.failing_queries.push("broken".to_string());

        let entries = curate_similar(
            &candidates,
            &WatchedSet::default(),
            &resolver,
            Duration::ZERO,
        )
        .await;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].slug, "good-one");
        assert_eq!(entries[0].title, "good-one");
        assert!(!entries[0].poster.is_empty());
    }

    #[test]
    fn gate_skips_empty_queue_and_counts_otherwise() {
        assert_eq!(queue_gate(&[]), QueueGate::Skip);

        let queue = vec![
            PendingItem { slug: "a".into(), rating_a: 1.0, rating_b: 1.0 },
            PendingItem { slug: "b".into(), rating_a: 2.0, rating_b: 2.0 },
        ];
        assert_eq!(queue_gate(&queue), QueueGate::Proceed { queued: 2 });
    }

    #[tokio::test]
    async fn check_queue_treats_missing_file_as_nothing_to_do() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(check_queue(dir.path()).await.expect("check"), QueueGate::Skip);

        let paths = StorePaths::under(dir.path());
        PendingQueueStore::new(&paths.pending)
            .save(&[PendingItem { slug: "film-x".into(), rating_a: 4.0, rating_b: 3.5 }])
            .await
            .expect("seed queue");
        assert_eq!(
            check_queue(dir.path()).await.expect("check"),
            QueueGate::Proceed { queued: 1 }
        );
    }

    #[test]
    fn config_parses_with_defaults() {
        let yaml = r#"
participant_a:
  name: Ana
  avatar: https://a.example/ana.jpg
participant_b:
  name: Bruno
tmdb_api_key: k
"#;
        let config: IngestConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.catalog_base_url, "https://letterboxd.com");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay_secs, 30);
        assert_eq!(config.curation_delay_ms, 1200);
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.participant_b.avatar, "");

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(30));
    }
}
