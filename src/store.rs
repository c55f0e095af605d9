//! Durable job and queue-order persistence over SQLite.
//!
//! The store owns writer serialization; callers never coordinate writes
//! themselves. Reopening after any shutdown (clean or crashed) rewrites
//! `running` jobs back to `pending` before workers start.

use crate::encoder::EncoderKind;
use crate::error::Result;
use crate::media::probe::ProbeResult;
use crate::preset::Preset;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{info, warn};

const SCHEMA_VERSION: i64 = 2;
pub const DB_FILE: &str = "shrinkray.db";
pub const LEGACY_QUEUE_FILE: &str = "queue.json";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[derive(sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Only meaningful while a job is running.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[derive(sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    #[default]
    #[sqlx(rename = "")]
    #[serde(rename = "")]
    Idle,
    Analyzing,
    Encoding,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub input_path: String,
    pub preset_id: String,

    // Source snapshot, captured at enqueue and never mutated.
    pub input_size: i64,
    pub duration_ms: i64,
    pub bitrate_bps: i64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub video_codec: String,
    pub profile: String,
    pub bit_depth: u32,
    pub is_hdr: bool,
    pub color_transfer: String,

    pub encoder: EncoderKind,
    pub is_hardware: bool,

    pub status: JobStatus,
    pub phase: JobPhase,
    pub progress: f64,
    pub speed: f64,
    pub eta_text: String,
    pub temp_path: String,

    pub output_path: String,
    pub output_size: i64,
    pub space_saved: i64,
    pub transcode_secs: i64,
    pub error: String,
    pub skip_reason: String,

    pub vmaf_score: Option<f64>,
    pub selected_crf: Option<i64>,
    pub quality_mod: Option<f64>,
    pub smartshrink_quality: String,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// New pending job from an enqueue-time probe snapshot.
    pub fn from_probe(id: i64, probe: &ProbeResult, preset: &Preset) -> Self {
        Self {
            id,
            input_path: probe.path.to_string_lossy().into_owned(),
            preset_id: preset.id.as_str().to_string(),
            input_size: probe.size as i64,
            duration_ms: (probe.duration_secs * 1000.0) as i64,
            bitrate_bps: probe.bitrate_bps as i64,
            width: probe.width,
            height: probe.height,
            frame_rate: probe.frame_rate,
            video_codec: probe.video_codec.clone(),
            profile: probe.profile.clone(),
            bit_depth: probe.bit_depth as u32,
            is_hdr: probe.is_hdr,
            color_transfer: probe.color_transfer.clone(),
            encoder: preset.encoder,
            is_hardware: preset.encoder.is_hardware(),
            status: JobStatus::Pending,
            phase: JobPhase::Idle,
            progress: 0.0,
            speed: 0.0,
            eta_text: String::new(),
            temp_path: String::new(),
            output_path: String::new(),
            output_size: 0,
            space_saved: 0,
            transcode_secs: 0,
            error: String::new(),
            skip_reason: String::new(),
            vmaf_score: None,
            selected_crf: None,
            quality_mod: None,
            smartshrink_quality: String::new(),
            created_at: Utc::now().trunc_subsecs(0),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Strictly monotonic job id: nanosecond clock with a CAS tie-break so
/// concurrent creation still yields a total order.
pub fn next_job_id() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    loop {
        let last = LAST.load(Ordering::SeqCst);
        let candidate = now.max(last + 1);
        if LAST
            .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return candidate;
        }
    }
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub complete: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub skipped: i64,
    pub total: i64,
    pub session_saved: i64,
    pub lifetime_saved: i64,
    pub total_saved: i64,
}

#[derive(Debug, Deserialize, Default)]
struct LegacyQueueFile {
    #[serde(default)]
    jobs: Vec<Job>,
    #[serde(default)]
    order: Vec<i64>,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database in `config_dir`. Imports a legacy
    /// `queue.json` exactly once, then rewrites any `running` jobs left
    /// behind by the previous process back to `pending`.
    pub async fn open(config_dir: &Path) -> Result<Self> {
        let db_path = config_dir.join(DB_FILE);
        let legacy_path = config_dir.join(LEGACY_QUEUE_FILE);
        let wants_import = legacy_path.exists() && !db_path.exists();

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;

        if wants_import {
            store.import_legacy_queue(&legacy_path).await?;
        }

        let recovered = store.reset_running_jobs().await?;
        if recovered > 0 {
            info!("Recovered {} interrupted jobs back to pending", recovered);
        }

        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY,
                input_path TEXT NOT NULL,
                preset_id TEXT NOT NULL,
                input_size INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                bitrate_bps INTEGER NOT NULL DEFAULT 0,
                width INTEGER NOT NULL DEFAULT 0,
                height INTEGER NOT NULL DEFAULT 0,
                frame_rate REAL NOT NULL DEFAULT 0,
                video_codec TEXT NOT NULL DEFAULT '',
                profile TEXT NOT NULL DEFAULT '',
                bit_depth INTEGER NOT NULL DEFAULT 8,
                is_hdr INTEGER NOT NULL DEFAULT 0,
                color_transfer TEXT NOT NULL DEFAULT '',
                encoder TEXT NOT NULL DEFAULT 'none',
                is_hardware INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                phase TEXT NOT NULL DEFAULT '',
                progress REAL NOT NULL DEFAULT 0,
                speed REAL NOT NULL DEFAULT 0,
                eta_text TEXT NOT NULL DEFAULT '',
                temp_path TEXT NOT NULL DEFAULT '',
                output_path TEXT NOT NULL DEFAULT '',
                output_size INTEGER NOT NULL DEFAULT 0,
                space_saved INTEGER NOT NULL DEFAULT 0,
                transcode_secs INTEGER NOT NULL DEFAULT 0,
                error TEXT NOT NULL DEFAULT '',
                skip_reason TEXT NOT NULL DEFAULT '',
                vmaf_score REAL,
                selected_crf INTEGER,
                quality_mod REAL,
                smartshrink_quality TEXT NOT NULL DEFAULT '',
                created_at DATETIME NOT NULL,
                started_at DATETIME,
                completed_at DATETIME
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS job_order (
                job_id INTEGER PRIMARY KEY,
                position INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stats_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                session_saved INTEGER NOT NULL DEFAULT 0,
                lifetime_saved INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("INSERT OR IGNORE INTO stats_metadata (id) VALUES (1)")
            .execute(&self.pool)
            .await?;

        self.upgrade_schema().await?;
        Ok(())
    }

    /// Forward-only column additions keyed by the stored version.
    async fn upgrade_schema(&self) -> Result<()> {
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_optional(&self.pool)
            .await?;

        let Some(version) = version else {
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(SCHEMA_VERSION)
                .execute(&self.pool)
                .await?;
            return Ok(());
        };

        if version < 2 {
            // v2 added the SmartShrink result columns.
            let _ = sqlx::query("ALTER TABLE jobs ADD COLUMN vmaf_score REAL")
                .execute(&self.pool)
                .await;
            let _ = sqlx::query("ALTER TABLE jobs ADD COLUMN selected_crf INTEGER")
                .execute(&self.pool)
                .await;
            let _ = sqlx::query("ALTER TABLE jobs ADD COLUMN quality_mod REAL")
                .execute(&self.pool)
                .await;
            let _ = sqlx::query(
                "ALTER TABLE jobs ADD COLUMN smartshrink_quality TEXT NOT NULL DEFAULT ''",
            )
            .execute(&self.pool)
            .await;
        }

        if version != SCHEMA_VERSION {
            sqlx::query("UPDATE schema_version SET version = ?")
                .bind(SCHEMA_VERSION)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn import_legacy_queue(&self, legacy_path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(legacy_path).unwrap_or_default();

        if content.trim().is_empty() {
            info!("Legacy queue file is empty; starting fresh");
            rename_legacy(legacy_path, "backup");
            return Ok(());
        }

        let legacy: LegacyQueueFile = match serde_json::from_str(&content) {
            Ok(legacy) => legacy,
            Err(e) => {
                warn!("Legacy queue file is corrupt ({}); starting empty", e);
                rename_legacy(legacy_path, "corrupt");
                return Ok(());
            }
        };

        let imported = legacy.jobs.len();
        self.save_jobs(&legacy.jobs).await?;

        let known: std::collections::HashSet<i64> = legacy.jobs.iter().map(|j| j.id).collect();
        let valid: Vec<i64> = legacy
            .order
            .iter()
            .copied()
            .filter(|id| known.contains(id))
            .collect();
        let dangling = legacy.order.len() - valid.len();
        self.set_order(&valid).await?;

        info!(
            "Imported {} jobs from legacy queue ({} dangling order refs skipped)",
            imported, dangling
        );
        rename_legacy(legacy_path, "backup");
        Ok(())
    }

    pub async fn save_job(&self, job: &Job) -> Result<()> {
        bind_job(sqlx::query(UPSERT_JOB_SQL), job)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_jobs(&self, jobs: &[Job]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            bind_job(sqlx::query(UPSERT_JOB_SQL), job)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Idempotent; removes the job from the order list as well.
    pub async fn delete_job(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM job_order WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Jobs in queue order plus the raw order list. Jobs missing from the
    /// order table sort last by creation time.
    pub async fn get_all_jobs(&self) -> Result<(Vec<Job>, Vec<i64>)> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT j.* FROM jobs j
             LEFT JOIN job_order o ON o.job_id = j.id
             ORDER BY (o.position IS NULL), o.position ASC, j.created_at ASC, j.id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let order: Vec<i64> =
            sqlx::query_scalar("SELECT job_id FROM job_order ORDER BY position ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok((jobs, order))
    }

    pub async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT j.* FROM jobs j
             LEFT JOIN job_order o ON o.job_id = j.id
             WHERE j.status = ?
             ORDER BY (o.position IS NULL), o.position ASC, j.created_at ASC, j.id ASC",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// First pending job in queue order, or none.
    pub async fn get_next_pending_job(&self) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT j.* FROM jobs j
             LEFT JOIN job_order o ON o.job_id = j.id
             WHERE j.status = 'pending'
             ORDER BY (o.position IS NULL), o.position ASC, j.created_at ASC, j.id ASC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn append_to_order(&self, id: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO job_order (job_id, position)
             VALUES (?, COALESCE((SELECT MAX(position) FROM job_order), 0) + 1)",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_from_order(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM job_order WHERE job_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace the entire order list, preserving the given sequence.
    pub async fn set_order(&self, ids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM job_order").execute(&mut *tx).await?;
        for (position, id) in ids.iter().enumerate() {
            sqlx::query("INSERT INTO job_order (job_id, position) VALUES (?, ?)")
                .bind(id)
                .bind(position as i64 + 1)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Give the job a position below the current minimum so it pops next.
    pub async fn move_to_front(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM job_order WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO job_order (job_id, position)
             VALUES (?, COALESCE((SELECT MIN(position) FROM job_order), 0) - 1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Crash recovery: no `running` job may survive a restart.
    pub async fn reset_running_jobs(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'pending', phase = '', progress = 0, speed = 0,
                 eta_text = '', temp_path = ''
             WHERE status = 'running'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(JobStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.total += count;
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Complete => stats.complete = count,
                JobStatus::Failed => stats.failed = count,
                JobStatus::Cancelled => stats.cancelled = count,
                JobStatus::Skipped => stats.skipped = count,
            }
        }

        let (session_saved, lifetime_saved): (i64, i64) =
            sqlx::query_as("SELECT session_saved, lifetime_saved FROM stats_metadata WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        stats.session_saved = session_saved;
        stats.lifetime_saved = lifetime_saved;
        stats.total_saved = session_saved;
        Ok(stats)
    }

    /// Increments both the session and lifetime counters atomically.
    pub async fn add_to_lifetime_saved(&self, bytes: i64) -> Result<()> {
        sqlx::query(
            "UPDATE stats_metadata
             SET session_saved = session_saved + ?, lifetime_saved = lifetime_saved + ?
             WHERE id = 1",
        )
        .bind(bytes)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_session(&self) -> Result<()> {
        sqlx::query("UPDATE stats_metadata SET session_saved = 0 WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn rename_legacy(path: &Path, suffix: &str) {
    let mut renamed = path.as_os_str().to_owned();
    renamed.push(format!(".{}", suffix));
    if let Err(e) = std::fs::rename(path, &renamed) {
        warn!("Failed to rename legacy queue file: {}", e);
    }
}

const UPSERT_JOB_SQL: &str = "INSERT INTO jobs (
        id, input_path, preset_id, input_size, duration_ms, bitrate_bps,
        width, height, frame_rate, video_codec, profile, bit_depth, is_hdr,
        color_transfer, encoder, is_hardware, status, phase, progress, speed,
        eta_text, temp_path, output_path, output_size, space_saved,
        transcode_secs, error, skip_reason, vmaf_score, selected_crf,
        quality_mod, smartshrink_quality, created_at, started_at, completed_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        input_path = excluded.input_path,
        preset_id = excluded.preset_id,
        input_size = excluded.input_size,
        duration_ms = excluded.duration_ms,
        bitrate_bps = excluded.bitrate_bps,
        width = excluded.width,
        height = excluded.height,
        frame_rate = excluded.frame_rate,
        video_codec = excluded.video_codec,
        profile = excluded.profile,
        bit_depth = excluded.bit_depth,
        is_hdr = excluded.is_hdr,
        color_transfer = excluded.color_transfer,
        encoder = excluded.encoder,
        is_hardware = excluded.is_hardware,
        status = excluded.status,
        phase = excluded.phase,
        progress = excluded.progress,
        speed = excluded.speed,
        eta_text = excluded.eta_text,
        temp_path = excluded.temp_path,
        output_path = excluded.output_path,
        output_size = excluded.output_size,
        space_saved = excluded.space_saved,
        transcode_secs = excluded.transcode_secs,
        error = excluded.error,
        skip_reason = excluded.skip_reason,
        vmaf_score = excluded.vmaf_score,
        selected_crf = excluded.selected_crf,
        quality_mod = excluded.quality_mod,
        smartshrink_quality = excluded.smartshrink_quality,
        created_at = excluded.created_at,
        started_at = excluded.started_at,
        completed_at = excluded.completed_at";

fn bind_job<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    job: &'q Job,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(job.id)
        .bind(&job.input_path)
        .bind(&job.preset_id)
        .bind(job.input_size)
        .bind(job.duration_ms)
        .bind(job.bitrate_bps)
        .bind(job.width)
        .bind(job.height)
        .bind(job.frame_rate)
        .bind(&job.video_codec)
        .bind(&job.profile)
        .bind(job.bit_depth)
        .bind(job.is_hdr)
        .bind(&job.color_transfer)
        .bind(job.encoder)
        .bind(job.is_hardware)
        .bind(job.status)
        .bind(job.phase)
        .bind(job.progress)
        .bind(job.speed)
        .bind(&job.eta_text)
        .bind(&job.temp_path)
        .bind(&job.output_path)
        .bind(job.output_size)
        .bind(job.space_saved)
        .bind(job.transcode_secs)
        .bind(&job.error)
        .bind(&job.skip_reason)
        .bind(job.vmaf_score)
        .bind(job.selected_crf)
        .bind(job.quality_mod)
        .bind(&job.smartshrink_quality)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_job_id_strictly_increasing() {
        let mut last = 0;
        for _ in 0..10_000 {
            let id = next_job_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
    }
}
