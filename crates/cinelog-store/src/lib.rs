//! Durable JSON stores for the cinelog data files.
//!
//! Every store follows the same discipline: a missing file is the first-run case
//! and reads as empty, while the collection store additionally snapshots the
//! current primary file to a backup path before every overwrite.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cinelog_core::{FailedItem, FilmRecord, GeneralStats, PendingItem, WatchedSet};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "cinelog-store";

/// File layout under a workspace root. All stores live in `data/`.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub collection: PathBuf,
    pub backup: PathBuf,
    pub pending: PathBuf,
    pub failed: PathBuf,
    pub watched_a: PathBuf,
    pub watched_b: PathBuf,
    pub watched_couple: PathBuf,
}

impl StorePaths {
    pub fn under(root: impl AsRef<Path>) -> Self {
        let data = root.as_ref().join("data");
        Self {
            collection: data.join("films_stats.json"),
            backup: data.join("films_stats_bkp.json"),
            pending: data.join("pending_films.json"),
            failed: data.join("failed_films.json"),
            watched_a: data.join("watched_a.json"),
            watched_b: data.join("watched_b.json"),
            watched_couple: data.join("watched_couple.json"),
        }
    }
}

/// On-disk collection shape. `General_Info` keeps its single-element-list
/// wrapping for compatibility with the frontend that reads this file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionFile {
    #[serde(rename = "General_Info")]
    pub general_info: Vec<GeneralStats>,
    #[serde(rename = "Movies_Info")]
    pub movies_info: Vec<FilmRecord>,
}

impl CollectionFile {
    pub fn stats(&self) -> Option<&GeneralStats> {
        self.general_info.first()
    }

    pub fn set_stats(&mut self, stats: GeneralStats) {
        self.general_info = vec![stats];
    }
}

async fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read_to_string(path).await {
        Ok(text) => {
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

async fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// The collection store and the sole writer of its backup snapshot.
#[derive(Debug, Clone)]
pub struct CollectionStore {
    primary: PathBuf,
    backup: PathBuf,
}

impl CollectionStore {
    pub fn new(primary: impl Into<PathBuf>, backup: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            backup: backup.into(),
        }
    }

    pub async fn load(&self) -> Result<CollectionFile> {
        read_json_or_default(&self.primary).await
    }

    /// Backup-then-overwrite commit. The backup copy is best-effort only in the
    /// sense that a missing primary (first run) is not an error; any other copy
    /// failure, and any primary-write failure, aborts the commit.
    pub async fn commit(&self, file: &CollectionFile) -> Result<()> {
        if let Some(parent) = self.backup.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        match fs::copy(&self.primary, &self.backup).await {
            Ok(_) => debug!(backup = %self.backup.display(), "collection backup written"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("no prior collection file; starting fresh without backup");
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "copying {} -> {}",
                        self.primary.display(),
                        self.backup.display()
                    )
                });
            }
        }
        write_json_pretty(&self.primary, file).await
    }
}

/// Ordered queue of films awaiting ingestion. Consumed from the head; a missing
/// file is the legitimate "nothing to do" case.
#[derive(Debug, Clone)]
pub struct PendingQueueStore {
    path: PathBuf,
}

impl PendingQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<Vec<PendingItem>> {
        read_json_or_default(&self.path).await
    }

    pub async fn save(&self, queue: &[PendingItem]) -> Result<()> {
        write_json_pretty(&self.path, &queue).await
    }

    /// Removes the first entry matching `slug`, if any, and persists the queue.
    pub async fn remove(&self, slug: &str) -> Result<bool> {
        let mut queue = self.load().await?;
        let Some(pos) = queue.iter().position(|item| item.slug == slug) else {
            return Ok(false);
        };
        queue.remove(pos);
        self.save(&queue).await?;
        Ok(true)
    }
}

/// Escalation store for exhausted jobs, deduplicated by slug.
#[derive(Debug, Clone)]
pub struct FailedQueueStore {
    path: PathBuf,
}

impl FailedQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<Vec<FailedItem>> {
        read_json_or_default(&self.path).await
    }

    /// Appends the item unless an entry with the same slug already exists.
    /// Returns whether a new entry was written.
    pub async fn escalate(&self, item: &PendingItem, failed_at: DateTime<Utc>) -> Result<bool> {
        let mut failed = self.load().await?;
        if failed.iter().any(|f| f.slug == item.slug) {
            debug!(slug = %item.slug, "already escalated; leaving failed queue untouched");
            return Ok(false);
        }
        failed.push(FailedItem {
            slug: item.slug.clone(),
            rating_a: item.rating_a,
            rating_b: item.rating_b,
            failed_at,
        });
        write_json_pretty(&self.path, &failed).await?;
        Ok(true)
    }
}

/// Append-only slug set persisted as a plain JSON array.
#[derive(Debug, Clone)]
pub struct WatchedSetStore {
    path: PathBuf,
}

impl WatchedSetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<WatchedSet> {
        read_json_or_default(&self.path).await
    }

    /// Appends a slug unless present. Returns whether the set grew.
    pub async fn append(&self, slug: &str) -> Result<bool> {
        let mut set = self.load().await?;
        if !set.insert(slug) {
            return Ok(false);
        }
        write_json_pretty(&self.path, &set).await?;
        Ok(true)
    }
}
