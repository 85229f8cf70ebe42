//! Ingestion pipeline orchestration for CASA: fetch the published sheet,
//! resolve its business date, parse and fingerprint it, then upsert into
//! the configured storage backend.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use casa_core::{
    parse_sheet, BatchDraft, ParseWarning, SheetDate, SourceDocument, SHEET_FILENAME_PREFIX,
};
use casa_storage::{
    sha256_hex, ConditionalFetcher, FetchConfig, FetchError, FetchOutcome, FilesystemBackend,
    RelationalBackend, RevalidationCache, StorageBackend, StorageError,
};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "casa-ingest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Files,
    Sqlite,
}

impl FromStr for BackendChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "files" | "fs" => Ok(Self::Files),
            "sqlite" | "relational" => Ok(Self::Sqlite),
            other => Err(format!("unknown backend {other:?} (expected files or sqlite)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub source_url: String,
    pub backend: BackendChoice,
    pub files_root: PathBuf,
    pub sqlite_path: PathBuf,
    pub history_enabled: bool,
    pub cache_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub admin_token: Option<String>,
}

impl ArchiveConfig {
    pub fn from_env() -> Self {
        let files_root = std::env::var("CASA_SOURCES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("sources"));
        Self {
            source_url: std::env::var("CASA_SOURCE_URL").unwrap_or_default(),
            backend: std::env::var("CASA_BACKEND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(BackendChoice::Files),
            sqlite_path: std::env::var("CASA_SQLITE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("casa.db")),
            history_enabled: std::env::var("CASA_HISTORY_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cache_path: std::env::var("CASA_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| files_root.join(".crawl_cache.json")),
            user_agent: std::env::var("CASA_USER_AGENT")
                .unwrap_or_else(|_| "casa-archiver/0.1".to_string()),
            http_timeout_secs: std::env::var("CASA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            admin_token: std::env::var("CASA_ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            files_root,
        }
    }
}

/// Build the backend selected by configuration. The choice is made once at
/// process start; everything downstream works through the trait object.
pub async fn build_backend(config: &ArchiveConfig) -> Result<Arc<dyn StorageBackend>> {
    match config.backend {
        BackendChoice::Files => Ok(Arc::new(FilesystemBackend::new(&config.files_root))),
        BackendChoice::Sqlite => Ok(Arc::new(
            RelationalBackend::open(&config.sqlite_path)
                .await
                .context("opening relational backend")?,
        )),
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("sheet parse failed: {0}")]
    Parse(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Terminal state of one ingestion attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Upstream revalidated unchanged; storage was never touched.
    Skipped,
    /// Full response whose content fingerprint matched the stored batch.
    NoOpWrite { date: SheetDate },
    Written {
        date: SheetDate,
        row_count: u32,
        warnings: Vec<ParseWarning>,
        history_appended: bool,
        history_error: Option<String>,
    },
}

/// Runs one fetch-resolve-ingest attempt to completion:
/// `Fetching -> (Skipped | Parsing) -> Resolving -> Comparing ->
/// (NoOpWrite | Writing) -> (HistoryAppending) -> Done`, with failures out
/// of fetching, parsing and writing. No implicit retry; retry policy
/// belongs to whatever triggers the pipeline.
pub struct IngestionPipeline {
    fetcher: ConditionalFetcher,
    backend: Arc<dyn StorageBackend>,
    source_url: String,
    history_enabled: bool,
}

impl IngestionPipeline {
    pub fn new(
        fetcher: ConditionalFetcher,
        backend: Arc<dyn StorageBackend>,
        source_url: String,
        history_enabled: bool,
    ) -> Self {
        Self {
            fetcher,
            backend,
            source_url,
            history_enabled,
        }
    }

    /// Fetch the configured source and ingest it. `claimed_override` pins
    /// the claimed sheet date (administrative re-crawls); otherwise the
    /// claimed date is today's UTC date.
    pub async fn run(&self, claimed_override: Option<SheetDate>) -> Result<IngestOutcome, IngestError> {
        debug!(url = %self.source_url, stage = "fetching");
        match self.fetcher.fetch(&self.source_url).await? {
            FetchOutcome::Unchanged => {
                info!(url = %self.source_url, "ingestion skipped, upstream unchanged");
                Ok(IngestOutcome::Skipped)
            }
            FetchOutcome::Changed {
                body,
                etag,
                last_modified,
            } => {
                let claimed = claimed_override
                    .unwrap_or_else(|| SheetDate::from_naive(Utc::now().date_naive()));
                let document = SourceDocument {
                    filename: claimed.sheet_filename(),
                    claimed_date: claimed,
                    body,
                    etag,
                    last_modified,
                };
                self.ingest_document(document).await
            }
        }
    }

    /// Ingest an already-fetched sheet. Shared by the crawl path and the
    /// backfill tooling, which reads sheets from disk instead of HTTP.
    pub async fn ingest_document(
        &self,
        document: SourceDocument,
    ) -> Result<IngestOutcome, IngestError> {
        debug!(claimed = %document.claimed_date, stage = "parsing");
        let sheet = parse_sheet(&document.body).map_err(|err| IngestError::Parse(err.to_string()))?;
        for warning in &sheet.warnings {
            warn!(line = warning.line, reason = %warning.reason, "row excluded from sheet");
        }
        if sheet.rows.is_empty() {
            // Never overwrite a previously good batch with an empty one.
            return Err(IngestError::Parse("no valid data rows".to_string()));
        }

        debug!(claimed = %document.claimed_date, stage = "resolving");
        let date = document.claimed_date.next_business_day();

        debug!(%date, stage = "comparing");
        let fingerprint = sha256_hex(&document.body);
        if let Some(prior) = self.backend.read_meta(date).await? {
            if prior.fingerprint == fingerprint {
                info!(%date, "content unchanged, skipping write");
                return Ok(IngestOutcome::NoOpWrite { date });
            }
            if prior.row_count > sheet.row_count() {
                warn!(
                    %date,
                    prior = prior.row_count,
                    new = sheet.row_count(),
                    "replacing batch with fewer rows than stored"
                );
            }
        }

        debug!(%date, stage = "writing");
        let warnings = sheet.warnings;
        let draft = BatchDraft {
            date,
            source_filename: document.filename,
            fingerprint,
            raw_csv: document.body,
            rows: sheet.rows,
        };
        let updated_at = Utc::now();
        self.backend.replace_current(&draft, updated_at).await?;
        info!(%date, rows = draft.rows.len(), "batch written");

        let mut history_appended = false;
        let mut history_error = None;
        if self.history_enabled {
            debug!(%date, stage = "history");
            // Best-effort audit copy; a failure here never rolls back the
            // committed batch.
            match self.backend.append_history(&draft, Utc::now()).await {
                Ok(()) => history_appended = true,
                Err(err) => {
                    warn!(%date, error = %err, "history append failed");
                    history_error = Some(err.to_string());
                }
            }
        }

        Ok(IngestOutcome::Written {
            date,
            row_count: draft.rows.len() as u32,
            warnings,
            history_appended,
            history_error,
        })
    }
}

/// Process-wide service surface handed to the web layer and the CLI.
pub struct ArchiveService {
    config: ArchiveConfig,
    backend: Arc<dyn StorageBackend>,
    pipeline: IngestionPipeline,
}

impl ArchiveService {
    pub async fn from_config(config: ArchiveConfig) -> Result<Self> {
        let backend = build_backend(&config).await?;
        let cache = Arc::new(RevalidationCache::load(&config.cache_path).await);
        let fetcher = ConditionalFetcher::new(
            FetchConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
            },
            cache,
        )?;
        let pipeline = IngestionPipeline::new(
            fetcher,
            Arc::clone(&backend),
            config.source_url.clone(),
            config.history_enabled,
        );
        Ok(Self {
            config,
            backend,
            pipeline,
        })
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Dates with a current batch, newest first.
    pub async fn list_dates(&self) -> Result<Vec<SheetDate>, StorageError> {
        self.backend.list_dates().await
    }

    /// CSV content and download filename for a stored date.
    pub async fn get_csv(&self, date: SheetDate) -> Result<(Vec<u8>, String), StorageError> {
        let content = self.backend.serialize_csv(date).await?;
        Ok((content, date.sheet_filename()))
    }

    /// Idempotent existence probe used by administrative tooling. Never
    /// fabricates an empty batch.
    pub async fn ensure_date(&self, date: SheetDate) -> Result<bool, StorageError> {
        self.backend.exists(date).await
    }

    pub async fn trigger_ingestion(
        &self,
        claimed_override: Option<SheetDate>,
    ) -> Result<IngestOutcome, IngestError> {
        self.pipeline.run(claimed_override).await
    }

    pub async fn ingest_document(
        &self,
        document: SourceDocument,
    ) -> Result<IngestOutcome, IngestError> {
        self.pipeline.ingest_document(document).await
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillSummary {
    pub ingested: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Ingest `auction_data_YYMMDD.csv` sheets already on disk, oldest first.
/// Each file's embedded date is its claimed date; business-date resolution
/// applies exactly as for a fetched sheet.
pub async fn backfill_dir(service: &ArchiveService, dir: &Path) -> Result<BackfillSummary> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading backfill directory {}", dir.display()))?;

    let mut sheets = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading backfill directory {}", dir.display()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stem) = name
            .strip_prefix(SHEET_FILENAME_PREFIX)
            .and_then(|rest| rest.strip_suffix(".csv"))
        else {
            continue;
        };
        if let Ok(date) = SheetDate::parse_yymmdd(stem) {
            sheets.push((date, name, entry.path()));
        }
    }
    sheets.sort_by_key(|(date, _, _)| *date);

    let mut summary = BackfillSummary::default();
    for (date, name, path) in sheets {
        let body = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let document = SourceDocument {
            claimed_date: date,
            filename: name.clone(),
            body,
            etag: None,
            last_modified: None,
        };
        match service.ingest_document(document).await {
            Ok(IngestOutcome::Written { .. }) => summary.ingested += 1,
            Ok(_) => summary.unchanged += 1,
            Err(err) => {
                warn!(file = %name, error = %err, "backfill ingest failed");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrateSummary {
    pub copied: usize,
    pub skipped: usize,
}

/// Copy every stored date from one backend to another, oldest first.
/// Dates already present in the target with the same fingerprint are
/// skipped, so a migration can be re-run after an interruption.
pub async fn migrate_backends(
    source: &dyn StorageBackend,
    target: &dyn StorageBackend,
) -> Result<MigrateSummary> {
    let mut dates = source.list_dates().await.context("listing source dates")?;
    dates.sort_unstable();

    let mut summary = MigrateSummary::default();
    for date in dates {
        let Some(meta) = source
            .read_meta(date)
            .await
            .with_context(|| format!("reading source meta for {date}"))?
        else {
            continue;
        };
        if let Some(existing) = target
            .read_meta(date)
            .await
            .with_context(|| format!("reading target meta for {date}"))?
        {
            if existing.fingerprint == meta.fingerprint {
                summary.skipped += 1;
                continue;
            }
        }

        let raw = source
            .serialize_csv(date)
            .await
            .with_context(|| format!("serializing source sheet for {date}"))?;
        let sheet = parse_sheet(&raw).with_context(|| format!("parsing stored sheet for {date}"))?;
        let draft = BatchDraft {
            date,
            source_filename: meta.source_filename,
            fingerprint: meta.fingerprint,
            raw_csv: raw,
            rows: sheet.rows,
        };
        target
            .replace_current(&draft, meta.updated_at)
            .await
            .with_context(|| format!("writing target batch for {date}"))?;
        summary.copied += 1;
        info!(%date, "batch migrated");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_csv(marker: &str) -> Vec<u8> {
        format!(
            "{}\n1001,Lotte,12가3456,VIN0001,2021 Avante,{marker},2021,45000,1250,white,gasoline,auto,A,http://img/1.jpg\n\
             1002,Lotte,34나5678,VIN0002,2019 Sonata,Sonata,2019,81000,980,black,lpg,auto,B,http://img/2.jpg\n",
            casa_core::SHEET_COLUMNS.join(",")
        )
        .into_bytes()
    }

    fn document(claimed: &str, body: Vec<u8>) -> SourceDocument {
        let claimed_date = SheetDate::parse_yymmdd(claimed).expect("date");
        SourceDocument {
            filename: claimed_date.sheet_filename(),
            claimed_date,
            body,
            etag: None,
            last_modified: None,
        }
    }

    async fn files_service(root: &Path, history_enabled: bool) -> ArchiveService {
        let config = ArchiveConfig {
            source_url: "http://127.0.0.1:9/auction.csv".to_string(),
            backend: BackendChoice::Files,
            files_root: root.to_path_buf(),
            sqlite_path: root.join("unused.db"),
            history_enabled,
            cache_path: root.join(".crawl_cache.json"),
            user_agent: "casa-test/0".to_string(),
            http_timeout_secs: 5,
            admin_token: None,
        };
        ArchiveService::from_config(config).await.expect("service")
    }

    #[tokio::test]
    async fn ingest_files_sheet_under_resolved_business_date() {
        let dir = tempdir().expect("tempdir");
        let service = files_service(dir.path(), false).await;

        // Claimed Friday 2025-09-05 files under Monday 2025-09-08.
        let outcome = service
            .ingest_document(document("250905", sample_csv("Avante")))
            .await
            .expect("ingest");
        match outcome {
            IngestOutcome::Written {
                date, row_count, ..
            } => {
                assert_eq!(date.yymmdd(), "250908");
                assert_eq!(row_count, 2);
            }
            other => panic!("expected written outcome, got {other:?}"),
        }

        let dates = service.list_dates().await.expect("list");
        assert_eq!(dates.len(), 1);
        assert_eq!(dates[0].yymmdd(), "250908");
        assert!(service.ensure_date(dates[0]).await.expect("ensure"));
    }

    #[tokio::test]
    async fn second_identical_ingest_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let service = files_service(dir.path(), true).await;
        let stored = SheetDate::parse_yymmdd("250908").expect("date");

        service
            .ingest_document(document("250905", sample_csv("Avante")))
            .await
            .expect("first ingest");
        let first_meta = service
            .backend()
            .read_meta(stored)
            .await
            .expect("meta")
            .expect("present");

        let outcome = service
            .ingest_document(document("250905", sample_csv("Avante")))
            .await
            .expect("second ingest");
        assert!(matches!(outcome, IngestOutcome::NoOpWrite { .. }));

        // The stored batch, its fingerprint and its updated-at are untouched,
        // and no second history entry exists.
        let second_meta = service
            .backend()
            .read_meta(stored)
            .await
            .expect("meta")
            .expect("present");
        assert_eq!(first_meta, second_meta);
        let history_entries = std::fs::read_dir(dir.path().join("history"))
            .expect("history dir")
            .count();
        assert_eq!(history_entries, 1);
    }

    #[tokio::test]
    async fn changed_content_replaces_and_appends_history() {
        let dir = tempdir().expect("tempdir");
        let service = files_service(dir.path(), true).await;
        let stored = SheetDate::parse_yymmdd("250908").expect("date");

        service
            .ingest_document(document("250905", sample_csv("Avante")))
            .await
            .expect("first ingest");
        let outcome = service
            .ingest_document(document("250905", sample_csv("Grandeur")))
            .await
            .expect("second ingest");
        match outcome {
            IngestOutcome::Written {
                history_appended,
                history_error,
                ..
            } => {
                assert!(history_appended);
                assert!(history_error.is_none());
            }
            other => panic!("expected written outcome, got {other:?}"),
        }

        let (content, _) = service.get_csv(stored).await.expect("csv");
        assert_eq!(content, sample_csv("Grandeur"));
        let history_entries = std::fs::read_dir(dir.path().join("history"))
            .expect("history dir")
            .count();
        assert_eq!(history_entries, 2);
    }

    #[tokio::test]
    async fn history_disabled_never_creates_entries() {
        let dir = tempdir().expect("tempdir");
        let service = files_service(dir.path(), false).await;

        service
            .ingest_document(document("250905", sample_csv("Avante")))
            .await
            .expect("first ingest");
        service
            .ingest_document(document("250905", sample_csv("Grandeur")))
            .await
            .expect("second ingest");

        assert!(!dir.path().join("history").exists());
    }

    #[tokio::test]
    async fn malformed_rows_are_reported_not_fatal() {
        let dir = tempdir().expect("tempdir");
        let service = files_service(dir.path(), false).await;

        let mut body = sample_csv("Avante");
        body.extend_from_slice(b"9999,broken\n");
        let outcome = service
            .ingest_document(document("250903", body))
            .await
            .expect("ingest");
        match outcome {
            IngestOutcome::Written {
                row_count,
                warnings,
                ..
            } => {
                assert_eq!(row_count, 2);
                assert_eq!(warnings.len(), 1);
            }
            other => panic!("expected written outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_sheet_fails_and_preserves_prior_batch() {
        let dir = tempdir().expect("tempdir");
        let service = files_service(dir.path(), false).await;
        let stored = SheetDate::parse_yymmdd("250908").expect("date");

        service
            .ingest_document(document("250905", sample_csv("Avante")))
            .await
            .expect("good ingest");

        let header_only = casa_core::SHEET_COLUMNS.join(",").into_bytes();
        let err = service
            .ingest_document(document("250905", header_only))
            .await
            .expect_err("empty sheet must fail");
        assert!(matches!(err, IngestError::Parse(_)));

        let (content, _) = service.get_csv(stored).await.expect("prior batch intact");
        assert_eq!(content, sample_csv("Avante"));
    }

    #[tokio::test]
    async fn backfill_ingests_sheets_from_disk() {
        let data_dir = tempdir().expect("tempdir");
        let store_dir = tempdir().expect("tempdir");
        std::fs::write(
            data_dir.path().join("auction_data_250903.csv"),
            sample_csv("Avante"),
        )
        .expect("write sheet");
        std::fs::write(
            data_dir.path().join("auction_data_250905.csv"),
            sample_csv("Grandeur"),
        )
        .expect("write sheet");
        std::fs::write(data_dir.path().join("notes.txt"), b"ignored").expect("write junk");

        let service = files_service(store_dir.path(), false).await;
        let summary = backfill_dir(&service, data_dir.path()).await.expect("backfill");
        assert_eq!(summary.ingested, 2);
        assert_eq!(summary.failed, 0);

        let dates: Vec<String> = service
            .list_dates()
            .await
            .expect("list")
            .iter()
            .map(SheetDate::yymmdd)
            .collect();
        // Wed 250903 -> 250904, Fri 250905 -> 250908, newest first.
        assert_eq!(dates, vec!["250908", "250904"]);
    }
}
