//! Durable batch storage + conditional HTTP fetch utilities for CASA.
//!
//! Two interchangeable backends implement [`StorageBackend`]: flat per-date
//! CSV files and a row-oriented SQLite store. Both guarantee that a reader
//! of a date observes either the fully-old or fully-new batch, never a mix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use casa_core::{
    rows_to_csv, AuctionBatch, AuctionRow, BatchDraft, BatchMeta, BatchPayload, SheetDate,
    SHEET_FILENAME_PREFIX,
};
use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "casa-storage";

/// Content fingerprint: SHA-256 over the exact raw bytes, independent of
/// transport validators and of parsing.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Revalidation cache
// ---------------------------------------------------------------------------

/// Validators last observed for a source URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Per-URL store of the most recently observed entity-tag and last-modified
/// validators. Owned by the process, read and written only through the
/// [`ConditionalFetcher`]; optionally backed by a JSON file that survives
/// restarts (saved with temp-write-then-rename).
#[derive(Debug)]
pub struct RevalidationCache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl RevalidationCache {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Load from a JSON file. A missing or unreadable file yields an empty
    /// cache; the next successful fetch rewrites it.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "ignoring corrupt revalidation cache");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    pub async fn entry_for(&self, url: &str) -> Option<CacheEntry> {
        self.entries.lock().await.get(url).cloned()
    }

    /// Record fresh validators for a URL. Persisted while the map lock is
    /// held so a concurrent commit cannot leave the file behind the map.
    pub async fn commit(&self, url: &str, entry: CacheEntry) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(url.to_string(), entry);
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec_pretty(&*entries).context("serializing revalidation cache")?;
            write_atomic(path, &bytes).await?;
        }
        Ok(())
    }
}

/// Write bytes to a temp file next to `path`, then rename over it.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Conditional fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Upstream answered 304; stored validators remain the baseline.
    Unchanged,
    Changed {
        body: Vec<u8>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport-level failure; the caller may retry against the same
    /// validator baseline.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// Upstream returned a status outside 2xx/304; fatal for this attempt.
    #[error("upstream status {status} for {url}")]
    Upstream { status: u16, url: String },
}

/// Conditional GET against a source URL using cached validators.
///
/// Validator state is committed only after the response body has been read
/// in full; a failed read leaves the previous baseline intact so the next
/// attempt revalidates against it.
pub struct ConditionalFetcher {
    client: reqwest::Client,
    cache: Arc<RevalidationCache>,
}

impl ConditionalFetcher {
    pub fn new(config: FetchConfig, cache: Arc<RevalidationCache>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, cache })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchOutcome, FetchError> {
        let mut request = self.client.get(url);
        if let Some(entry) = self.cache.entry_for(url).await {
            if let Some(etag) = entry.etag.as_deref() {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = entry.last_modified.as_deref() {
                request = request.header(header::IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            info!(url, "upstream not modified");
            return Ok(FetchOutcome::Unchanged);
        }
        if !status.is_success() {
            return Err(FetchError::Upstream {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let header_value = |name: header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header_value(header::ETAG);
        let last_modified = header_value(header::LAST_MODIFIED);

        let body = response.bytes().await?.to_vec();

        let entry = CacheEntry {
            etag: etag.clone(),
            last_modified: last_modified.clone(),
            fetched_at: Some(Utc::now()),
        };
        if let Err(err) = self.cache.commit(url, entry).await {
            // A stale cache only costs a redundant refetch next time.
            warn!(url, error = %err, "failed to persist revalidation cache");
        }

        info!(url, bytes = body.len(), "fetched full response");
        Ok(FetchOutcome::Changed {
            body,
            etag,
            last_modified,
        })
    }
}

// ---------------------------------------------------------------------------
// Storage backends
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no stored batch for date {0}")]
    NotFound(SheetDate),
    #[error("storage read failed: {0:#}")]
    Read(anyhow::Error),
    #[error("storage write failed: {0:#}")]
    Write(anyhow::Error),
}

/// Durable per-date batch store. The ingestion pipeline is the sole writer;
/// implementations enforce the one-current-batch-per-date invariant at the
/// storage boundary.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Whether a current batch exists for `date`. No side effects.
    async fn exists(&self, date: SheetDate) -> Result<bool, StorageError>;

    /// Metadata of the current batch without loading its rows, or `None`.
    async fn read_meta(&self, date: SheetDate) -> Result<Option<BatchMeta>, StorageError>;

    async fn read_current(&self, date: SheetDate) -> Result<AuctionBatch, StorageError>;

    /// Atomically replace the current batch for the draft's date. Concurrent
    /// readers observe the old batch or the new one, never a mix; concurrent
    /// replaces serialize to last-writer-wins.
    async fn replace_current(
        &self,
        draft: &BatchDraft,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Append an immutable audit copy of the draft. Strictly additive.
    async fn append_history(
        &self,
        draft: &BatchDraft,
        ingested_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Reconstruct the CSV text for a stored date, equivalent to the
    /// ingested content in row order and field values.
    async fn serialize_csv(&self, date: SheetDate) -> Result<Vec<u8>, StorageError>;

    /// Dates with a current batch, newest first.
    async fn list_dates(&self) -> Result<Vec<SheetDate>, StorageError>;
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SidecarMeta {
    date: SheetDate,
    source_filename: String,
    row_count: u32,
    updated_at: DateTime<Utc>,
}

/// Flat-file backend: one `auction_data_YYMMDD.csv` per date under a root
/// directory, plus a JSON sidecar carrying the row count and bookkeeping so
/// reads never re-parse the sheet. Replacement is temp-write-then-rename;
/// the CSV file alone is authoritative for content and fingerprint, the
/// sidecar is descriptive.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn csv_path(&self, date: SheetDate) -> PathBuf {
        self.root.join(date.sheet_filename())
    }

    fn meta_path(&self, date: SheetDate) -> PathBuf {
        self.root
            .join(format!("{SHEET_FILENAME_PREFIX}{}.meta.json", date.yymmdd()))
    }

    fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    async fn read_sidecar(&self, date: SheetDate) -> anyhow::Result<SidecarMeta> {
        let path = self.meta_path(date);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading sidecar {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing sidecar {}", path.display()))
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn exists(&self, date: SheetDate) -> Result<bool, StorageError> {
        let path = self.csv_path(date);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))
            .map_err(StorageError::Read)
    }

    async fn read_meta(&self, date: SheetDate) -> Result<Option<BatchMeta>, StorageError> {
        let content = match fs::read(self.csv_path(date)).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StorageError::Read(anyhow::Error::new(err).context(format!(
                    "reading sheet for {date}"
                ))))
            }
        };
        let sidecar = self.read_sidecar(date).await.map_err(StorageError::Read)?;
        Ok(Some(BatchMeta {
            date,
            source_filename: sidecar.source_filename,
            row_count: sidecar.row_count,
            fingerprint: sha256_hex(&content),
            updated_at: sidecar.updated_at,
        }))
    }

    async fn read_current(&self, date: SheetDate) -> Result<AuctionBatch, StorageError> {
        let content = match fs::read(self.csv_path(date)).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(date))
            }
            Err(err) => {
                return Err(StorageError::Read(anyhow::Error::new(err).context(format!(
                    "reading sheet for {date}"
                ))))
            }
        };
        let sidecar = self.read_sidecar(date).await.map_err(StorageError::Read)?;
        Ok(AuctionBatch {
            meta: BatchMeta {
                date,
                source_filename: sidecar.source_filename,
                row_count: sidecar.row_count,
                fingerprint: sha256_hex(&content),
                updated_at: sidecar.updated_at,
            },
            payload: BatchPayload::RawCsv(content),
        })
    }

    async fn replace_current(
        &self,
        draft: &BatchDraft,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        write_atomic(&self.csv_path(draft.date), &draft.raw_csv)
            .await
            .map_err(StorageError::Write)?;
        let sidecar = SidecarMeta {
            date: draft.date,
            source_filename: draft.source_filename.clone(),
            row_count: draft.rows.len() as u32,
            updated_at,
        };
        let bytes = serde_json::to_vec_pretty(&sidecar)
            .context("serializing sidecar")
            .map_err(StorageError::Write)?;
        write_atomic(&self.meta_path(draft.date), &bytes)
            .await
            .map_err(StorageError::Write)?;
        Ok(())
    }

    async fn append_history(
        &self,
        draft: &BatchDraft,
        ingested_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let dir = self.history_dir();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))
            .map_err(StorageError::Write)?;
        let path = dir.join(format!(
            "{SHEET_FILENAME_PREFIX}{}_{}.csv",
            draft.date.yymmdd(),
            ingested_at.format("%Y%m%dT%H%M%S%9f")
        ));
        // create_new keeps history strictly additive.
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("creating history entry {}", path.display()))
            .map_err(StorageError::Write)?;
        file.write_all(&draft.raw_csv)
            .await
            .with_context(|| format!("writing history entry {}", path.display()))
            .map_err(StorageError::Write)?;
        file.flush()
            .await
            .with_context(|| format!("flushing history entry {}", path.display()))
            .map_err(StorageError::Write)?;
        Ok(())
    }

    async fn serialize_csv(&self, date: SheetDate) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.csv_path(date)).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(date))
            }
            Err(err) => Err(StorageError::Read(anyhow::Error::new(err).context(format!(
                "reading sheet for {date}"
            )))),
        }
    }

    async fn list_dates(&self) -> Result<Vec<SheetDate>, StorageError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StorageError::Read(anyhow::Error::new(err).context(format!(
                    "listing {}",
                    self.root.display()
                ))))
            }
        };

        let mut dates = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))
            .map_err(StorageError::Read)?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name
                .strip_prefix(SHEET_FILENAME_PREFIX)
                .and_then(|rest| rest.strip_suffix(".csv"))
            else {
                continue;
            };
            if let Ok(date) = SheetDate::parse_yymmdd(stem) {
                dates.push(date);
            }
        }
        dates.sort_unstable_by(|a, b| b.cmp(a));
        Ok(dates)
    }
}

// ---------------------------------------------------------------------------
// Relational backend (SQLite)
// ---------------------------------------------------------------------------

const SQLITE_SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS auction_batches (
        date TEXT PRIMARY KEY,
        source_filename TEXT NOT NULL,
        row_count INTEGER NOT NULL,
        fingerprint TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS auction_rows (
        date TEXT NOT NULL,
        row_idx INTEGER NOT NULL,
        sell_number TEXT NOT NULL,
        auction_house TEXT NOT NULL,
        car_number TEXT NOT NULL,
        vin TEXT NOT NULL,
        post_title TEXT NOT NULL,
        title TEXT NOT NULL,
        year TEXT NOT NULL,
        km TEXT NOT NULL,
        price TEXT NOT NULL,
        color TEXT NOT NULL,
        fuel TEXT NOT NULL,
        transmission TEXT NOT NULL,
        score TEXT NOT NULL,
        image_url TEXT NOT NULL,
        PRIMARY KEY (date, row_idx)
    )",
    "CREATE TABLE IF NOT EXISTS auction_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        date TEXT NOT NULL,
        source_filename TEXT NOT NULL,
        row_count INTEGER NOT NULL,
        fingerprint TEXT NOT NULL,
        content TEXT NOT NULL,
        ingested_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_auction_history_date ON auction_history(date)",
];

/// Row-oriented backend: one table row per [`AuctionRow`] keyed by
/// (date, row index), batch metadata keyed by date, and an append-only
/// history table with a surrogate key. Replacement runs as a single
/// transaction so readers never observe an interleaved row set.
pub struct RelationalBackend {
    pool: SqlitePool,
}

impl RelationalBackend {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .context("parsing sqlite options")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        // WAL keeps readers concurrent with the single active writer; the
        // busy timeout serializes competing replace transactions.
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .context("opening sqlite pool")?;
        let backend = Self { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SQLITE_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("applying sqlite schema")?;
        }
        Ok(())
    }

    /// Number of history entries recorded for a date.
    pub async fn history_count(&self, date: SheetDate) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM auction_history WHERE date = ?1")
            .bind(date.yymmdd())
            .fetch_one(&self.pool)
            .await
            .context("counting history entries")
            .map_err(StorageError::Read)?;
        let n: i64 = row.try_get("n").context("reading count").map_err(StorageError::Read)?;
        Ok(n as u64)
    }

    fn meta_from_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<BatchMeta> {
        let date_text: String = row.try_get("date")?;
        let updated_at_text: String = row.try_get("updated_at")?;
        Ok(BatchMeta {
            date: SheetDate::parse_yymmdd(&date_text)
                .with_context(|| format!("stored date key {date_text:?}"))?,
            source_filename: row.try_get("source_filename")?,
            row_count: row.try_get::<i64, _>("row_count")? as u32,
            fingerprint: row.try_get("fingerprint")?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at_text)
                .with_context(|| format!("stored timestamp {updated_at_text:?}"))?
                .with_timezone(&Utc),
        })
    }

    async fn load_rows(&self, date: SheetDate) -> anyhow::Result<Vec<AuctionRow>> {
        let rows = sqlx::query(
            "SELECT row_idx, sell_number, auction_house, car_number, vin, post_title, title,
                    year, km, price, color, fuel, transmission, score, image_url
               FROM auction_rows
              WHERE date = ?1
              ORDER BY row_idx",
        )
        .bind(date.yymmdd())
        .fetch_all(&self.pool)
        .await
        .context("loading auction rows")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AuctionRow {
                row_index: row.try_get::<i64, _>("row_idx")? as u32,
                sell_number: row.try_get("sell_number")?,
                auction_house: row.try_get("auction_house")?,
                car_number: row.try_get("car_number")?,
                vin: row.try_get("vin")?,
                post_title: row.try_get("post_title")?,
                title: row.try_get("title")?,
                year: row.try_get("year")?,
                km: row.try_get("km")?,
                price: row.try_get("price")?,
                color: row.try_get("color")?,
                fuel: row.try_get("fuel")?,
                transmission: row.try_get("transmission")?,
                score: row.try_get("score")?,
                image_url: row.try_get("image_url")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl StorageBackend for RelationalBackend {
    async fn exists(&self, date: SheetDate) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM auction_batches WHERE date = ?1")
            .bind(date.yymmdd())
            .fetch_optional(&self.pool)
            .await
            .context("probing batch existence")
            .map_err(StorageError::Read)?;
        Ok(row.is_some())
    }

    async fn read_meta(&self, date: SheetDate) -> Result<Option<BatchMeta>, StorageError> {
        let row = sqlx::query(
            "SELECT date, source_filename, row_count, fingerprint, updated_at
               FROM auction_batches WHERE date = ?1",
        )
        .bind(date.yymmdd())
        .fetch_optional(&self.pool)
        .await
        .context("loading batch metadata")
        .map_err(StorageError::Read)?;
        row.map(|row| Self::meta_from_row(&row))
            .transpose()
            .map_err(StorageError::Read)
    }

    async fn read_current(&self, date: SheetDate) -> Result<AuctionBatch, StorageError> {
        let meta = self
            .read_meta(date)
            .await?
            .ok_or(StorageError::NotFound(date))?;
        let rows = self
            .load_rows(date)
            .await
            .map_err(StorageError::Read)?;
        Ok(AuctionBatch {
            meta,
            payload: BatchPayload::Rows(rows),
        })
    }

    async fn replace_current(
        &self,
        draft: &BatchDraft,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let date_key = draft.date.yymmdd();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning replace transaction")
            .map_err(StorageError::Write)?;

        sqlx::query("DELETE FROM auction_rows WHERE date = ?1")
            .bind(&date_key)
            .execute(&mut *tx)
            .await
            .context("clearing previous rows")
            .map_err(StorageError::Write)?;

        sqlx::query(
            "INSERT INTO auction_batches (date, source_filename, row_count, fingerprint, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(date) DO UPDATE SET
                 source_filename = excluded.source_filename,
                 row_count = excluded.row_count,
                 fingerprint = excluded.fingerprint,
                 updated_at = excluded.updated_at",
        )
        .bind(&date_key)
        .bind(&draft.source_filename)
        .bind(draft.rows.len() as i64)
        .bind(&draft.fingerprint)
        .bind(updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("upserting batch metadata")
        .map_err(StorageError::Write)?;

        for row in &draft.rows {
            sqlx::query(
                "INSERT INTO auction_rows (date, row_idx, sell_number, auction_house, car_number,
                     vin, post_title, title, year, km, price, color, fuel, transmission, score,
                     image_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )
            .bind(&date_key)
            .bind(row.row_index as i64)
            .bind(&row.sell_number)
            .bind(&row.auction_house)
            .bind(&row.car_number)
            .bind(&row.vin)
            .bind(&row.post_title)
            .bind(&row.title)
            .bind(&row.year)
            .bind(&row.km)
            .bind(&row.price)
            .bind(&row.color)
            .bind(&row.fuel)
            .bind(&row.transmission)
            .bind(&row.score)
            .bind(&row.image_url)
            .execute(&mut *tx)
            .await
            .context("inserting auction row")
            .map_err(StorageError::Write)?;
        }

        tx.commit()
            .await
            .context("committing replace transaction")
            .map_err(StorageError::Write)?;
        Ok(())
    }

    async fn append_history(
        &self,
        draft: &BatchDraft,
        ingested_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO auction_history (date, source_filename, row_count, fingerprint, content,
                 ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(draft.date.yymmdd())
        .bind(&draft.source_filename)
        .bind(draft.rows.len() as i64)
        .bind(&draft.fingerprint)
        .bind(String::from_utf8_lossy(&draft.raw_csv).into_owned())
        .bind(ingested_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("appending history entry")
        .map_err(StorageError::Write)?;
        Ok(())
    }

    async fn serialize_csv(&self, date: SheetDate) -> Result<Vec<u8>, StorageError> {
        if !self.exists(date).await? {
            return Err(StorageError::NotFound(date));
        }
        let rows = self
            .load_rows(date)
            .await
            .map_err(StorageError::Read)?;
        let text = rows_to_csv(&rows)
            .context("serializing stored rows")
            .map_err(StorageError::Read)?;
        Ok(text.into_bytes())
    }

    async fn list_dates(&self) -> Result<Vec<SheetDate>, StorageError> {
        let rows = sqlx::query("SELECT date FROM auction_batches ORDER BY date DESC")
            .fetch_all(&self.pool)
            .await
            .context("listing batch dates")
            .map_err(StorageError::Read)?;
        let mut dates = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row
                .try_get("date")
                .context("reading date key")
                .map_err(StorageError::Read)?;
            let date = SheetDate::parse_yymmdd(&text)
                .with_context(|| format!("stored date key {text:?}"))
                .map_err(StorageError::Read)?;
            dates.push(date);
        }
        Ok(dates)
    }
}
