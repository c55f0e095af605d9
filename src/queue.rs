//! In-process job lifecycle API over the store.
//!
//! Every state transition flows through a store write and broadcasts a
//! `QueueEvent`. The event channel is bounded and lossy; subscribers that
//! fall behind must resynchronize with `get_all`.

use crate::error::{Result, ShrinkrayError};
use crate::media::probe::ProbeResult;
use crate::preset::{Codec, Preset, Presets};
use crate::store::{next_job_id, Job, JobPhase, JobStatus, QueueStats, Store};
use chrono::{SubsecRound, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum QueueEvent {
    Added {
        job: Job,
    },
    Started {
        job_id: i64,
    },
    Progress {
        job_id: i64,
        progress: f64,
        speed: f64,
        eta: String,
    },
    Complete {
        job: Job,
    },
    Failed {
        job_id: i64,
        error: String,
    },
    Cancelled {
        job_id: i64,
    },
    Skipped {
        job_id: i64,
        reason: String,
    },
    JobsAdded {
        count: usize,
    },
    DiscoveryProgress {
        probed: usize,
        total: usize,
    },
}

/// Why a file doesn't need this preset, or `None` to proceed.
/// Downscale presets ignore the codec: an already-HEVC 4K file still needs
/// to be scaled down.
pub fn skip_reason(probe: &ProbeResult, preset: &Preset, allow_same_codec: bool) -> Option<String> {
    if preset.max_height > 0 {
        if probe.height <= preset.max_height {
            return Some(format!(
                "already at or below target resolution ({}p)",
                preset.max_height
            ));
        }
        return None;
    }

    if allow_same_codec {
        return None;
    }

    match preset.codec {
        Codec::Hevc if probe.is_hevc() => Some("already HEVC".to_string()),
        Codec::Av1 if probe.is_av1() => Some("already AV1".to_string()),
        _ => None,
    }
}

pub struct Queue {
    store: Arc<Store>,
    presets: Arc<Presets>,
    events: broadcast::Sender<QueueEvent>,
    allow_same_codec: bool,
}

impl Queue {
    pub fn new(store: Arc<Store>, presets: Arc<Presets>, allow_same_codec: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store,
            presets,
            events,
            allow_same_codec,
        }
    }

    /// Bounded, lossy subscription. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn broadcast(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    /// Enqueue one probed file, evaluating the skip predicate first.
    pub async fn add(&self, probe: &ProbeResult, preset_id: &str) -> Result<Job> {
        let preset = self
            .presets
            .get(preset_id)
            .ok_or_else(|| ShrinkrayError::UnknownPreset(preset_id.to_string()))?;

        let mut job = Job::from_probe(next_job_id(), probe, preset);
        if let Some(reason) = skip_reason(probe, preset, self.allow_same_codec) {
            debug!("Skipping {:?}: {}", probe.path, reason);
            job.status = JobStatus::Skipped;
            job.skip_reason = reason;
        }

        self.store.save_job(&job).await?;
        self.store.append_to_order(job.id).await?;
        self.broadcast(QueueEvent::Added { job: job.clone() });
        Ok(job)
    }

    /// Enqueue a batch in one persistence write and a single `jobs_added`
    /// broadcast, so a large discovery doesn't flood subscribers.
    pub async fn add_multiple(&self, probes: &[ProbeResult], preset_id: &str) -> Result<Vec<Job>> {
        let preset = self
            .presets
            .get(preset_id)
            .ok_or_else(|| ShrinkrayError::UnknownPreset(preset_id.to_string()))?;

        let mut jobs = Vec::with_capacity(probes.len());
        for probe in probes {
            let mut job = Job::from_probe(next_job_id(), probe, preset);
            if let Some(reason) = skip_reason(probe, preset, self.allow_same_codec) {
                job.status = JobStatus::Skipped;
                job.skip_reason = reason;
            }
            jobs.push(job);
        }

        self.store.save_jobs(&jobs).await?;
        for job in &jobs {
            self.store.append_to_order(job.id).await?;
        }
        self.broadcast(QueueEvent::JobsAdded { count: jobs.len() });
        Ok(jobs)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Job>> {
        self.store.get_job(id).await
    }

    pub async fn get_all(&self) -> Result<(Vec<Job>, Vec<i64>)> {
        self.store.get_all_jobs().await
    }

    pub async fn get_next_pending(&self) -> Result<Option<Job>> {
        self.store.get_next_pending_job().await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.stats().await
    }

    pub async fn reset_session(&self) -> Result<()> {
        self.store.reset_session().await
    }

    /// Claim a pending job for a worker.
    pub async fn start_job(&self, id: i64, temp_path: &Path) -> Result<Job> {
        let mut job = self.require(id).await?;
        if job.status != JobStatus::Pending {
            return Err(ShrinkrayError::InvalidTransition {
                id,
                status: job.status.to_string(),
                expected: "pending".to_string(),
            });
        }

        job.status = JobStatus::Running;
        job.phase = JobPhase::Idle;
        job.progress = 0.0;
        job.speed = 0.0;
        job.eta_text = String::new();
        job.temp_path = temp_path.to_string_lossy().into_owned();
        job.started_at = Some(Utc::now().trunc_subsecs(0));
        self.store.save_job(&job).await?;
        self.broadcast(QueueEvent::Started { job_id: id });
        Ok(job)
    }

    /// Persist the running phase ("analyzing" vs "encoding"). No broadcast;
    /// subscribers pick it up from the next full read.
    pub async fn set_phase(&self, id: i64, phase: JobPhase) -> Result<()> {
        let mut job = self.require(id).await?;
        if job.status != JobStatus::Running {
            return Ok(());
        }
        job.phase = phase;
        self.store.save_job(&job).await
    }

    /// Persist SmartShrink results onto a running job.
    pub async fn set_analysis_result(
        &self,
        id: i64,
        vmaf_score: Option<f64>,
        selected_crf: Option<i64>,
        quality_mod: Option<f64>,
        tier: &str,
    ) -> Result<()> {
        let mut job = self.require(id).await?;
        if job.status != JobStatus::Running {
            return Ok(());
        }
        job.vmaf_score = vmaf_score;
        job.selected_crf = selected_crf;
        job.quality_mod = quality_mod;
        job.smartshrink_quality = tier.to_string();
        self.store.save_job(&job).await
    }

    /// Broadcast-only: progress updates are too frequent to persist.
    /// Ignored unless the job is running.
    pub async fn update_progress(&self, id: i64, progress: f64, speed: f64, eta: &str) {
        let running = matches!(
            self.store.get_job(id).await,
            Ok(Some(job)) if job.status == JobStatus::Running
        );
        if running {
            self.broadcast(QueueEvent::Progress {
                job_id: id,
                progress,
                speed,
                eta: eta.to_string(),
            });
        }
    }

    pub async fn complete_job(&self, id: i64, output_path: &Path, output_size: i64) -> Result<Job> {
        let mut job = self.require(id).await?;
        if job.status != JobStatus::Running {
            return Err(ShrinkrayError::InvalidTransition {
                id,
                status: job.status.to_string(),
                expected: "running".to_string(),
            });
        }

        let completed_at = Utc::now().trunc_subsecs(0);
        job.status = JobStatus::Complete;
        job.phase = JobPhase::Idle;
        job.progress = 100.0;
        job.speed = 0.0;
        job.eta_text = String::new();
        job.temp_path = String::new();
        job.output_path = output_path.to_string_lossy().into_owned();
        job.output_size = output_size;
        job.space_saved = job.input_size - output_size;
        job.transcode_secs = job
            .started_at
            .map(|started| (completed_at - started).num_seconds())
            .unwrap_or(0);
        job.completed_at = Some(completed_at);

        self.store.save_job(&job).await?;
        // lifetime_saved never decreases, even when larger outputs are kept.
        self.store
            .add_to_lifetime_saved(job.space_saved.max(0))
            .await?;
        self.broadcast(QueueEvent::Complete { job: job.clone() });
        Ok(job)
    }

    pub async fn fail_job(&self, id: i64, message: &str) -> Result<Job> {
        let mut job = self.require(id).await?;
        if job.status.is_terminal() {
            return Err(ShrinkrayError::InvalidTransition {
                id,
                status: job.status.to_string(),
                expected: "non-terminal".to_string(),
            });
        }
        job.status = JobStatus::Failed;
        job.phase = JobPhase::Idle;
        job.error = message.to_string();
        job.temp_path = String::new();
        job.completed_at = Some(Utc::now().trunc_subsecs(0));
        self.store.save_job(&job).await?;
        self.broadcast(QueueEvent::Failed {
            job_id: id,
            error: message.to_string(),
        });
        Ok(job)
    }

    /// Rejected once the job is terminal.
    pub async fn cancel_job(&self, id: i64) -> Result<Job> {
        let mut job = self.require(id).await?;
        if job.status.is_terminal() {
            return Err(ShrinkrayError::InvalidTransition {
                id,
                status: job.status.to_string(),
                expected: "non-terminal".to_string(),
            });
        }
        job.status = JobStatus::Cancelled;
        job.phase = JobPhase::Idle;
        job.temp_path = String::new();
        job.completed_at = Some(Utc::now().trunc_subsecs(0));
        self.store.save_job(&job).await?;
        self.broadcast(QueueEvent::Cancelled { job_id: id });
        Ok(job)
    }

    pub async fn skip_job(&self, id: i64, reason: &str) -> Result<Job> {
        let mut job = self.require(id).await?;
        if job.status.is_terminal() {
            return Err(ShrinkrayError::InvalidTransition {
                id,
                status: job.status.to_string(),
                expected: "non-terminal".to_string(),
            });
        }
        job.status = JobStatus::Skipped;
        job.phase = JobPhase::Idle;
        job.skip_reason = reason.to_string();
        job.temp_path = String::new();
        job.completed_at = Some(Utc::now().trunc_subsecs(0));
        self.store.save_job(&job).await?;
        self.broadcast(QueueEvent::Skipped {
            job_id: id,
            reason: reason.to_string(),
        });
        Ok(job)
    }

    /// Move a running job back to pending at the front of the queue, so
    /// work displaced by resize/pause resumes first.
    pub async fn requeue(&self, id: i64) -> Result<()> {
        let mut job = self.require(id).await?;
        if job.status != JobStatus::Running {
            return Err(ShrinkrayError::InvalidTransition {
                id,
                status: job.status.to_string(),
                expected: "running".to_string(),
            });
        }
        job.status = JobStatus::Pending;
        job.phase = JobPhase::Idle;
        job.progress = 0.0;
        job.speed = 0.0;
        job.eta_text = String::new();
        job.temp_path = String::new();
        job.started_at = None;
        self.store.save_job(&job).await?;
        self.store.move_to_front(id).await
    }

    /// Remove every job that isn't currently running.
    pub async fn clear(&self) -> Result<usize> {
        let (jobs, _) = self.store.get_all_jobs().await?;
        let mut removed = 0;
        for job in jobs {
            if job.status != JobStatus::Running {
                self.store.delete_job(job.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Unconditional removal, for retry flows.
    pub async fn remove(&self, id: i64) -> Result<()> {
        self.store.delete_job(id).await
    }

    /// Relay walker progress to subscribers.
    pub fn notify_discovery_progress(&self, probed: usize, total: usize) {
        self.broadcast(QueueEvent::DiscoveryProgress { probed, total });
    }

    async fn require(&self, id: i64) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or(ShrinkrayError::JobNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderKind;
    use crate::preset::PresetId;
    use std::path::PathBuf;

    fn probe(codec: &str, height: u32) -> ProbeResult {
        ProbeResult {
            path: PathBuf::from("/media/sample.mkv"),
            size: 1_000_000,
            duration_secs: 120.0,
            format: "matroska,webm".to_string(),
            video_codec: codec.to_string(),
            audio_codec: Some("ac3".to_string()),
            width: height * 16 / 9,
            height,
            bitrate_bps: 3_481_000,
            frame_rate: 23.976,
            profile: "Main".to_string(),
            pix_fmt: "yuv420p".to_string(),
            bit_depth: 8,
            color_transfer: "bt709".to_string(),
            color_primaries: "bt709".to_string(),
            color_space: "bt709".to_string(),
            is_hdr: false,
        }
    }

    fn preset(id: PresetId, codec: Codec, max_height: u32) -> Preset {
        Preset {
            id,
            codec,
            max_height,
            is_smartshrink: false,
            encoder: EncoderKind::None,
        }
    }

    #[test]
    fn test_skip_already_hevc() {
        let p = preset(PresetId::CompressHevc, Codec::Hevc, 0);
        let reason = skip_reason(&probe("hevc", 1080), &p, false);
        assert!(reason.is_some());
        assert!(reason.unwrap().contains("HEVC"));
    }

    #[test]
    fn test_same_codec_override_allows_hevc() {
        let p = preset(PresetId::CompressHevc, Codec::Hevc, 0);
        assert_eq!(skip_reason(&probe("hevc", 1080), &p, true), None);
    }

    #[test]
    fn test_skip_already_av1() {
        let p = preset(PresetId::CompressAv1, Codec::Av1, 0);
        assert!(skip_reason(&probe("av1", 1080), &p, false)
            .unwrap()
            .contains("AV1"));
        assert_eq!(skip_reason(&probe("h264", 1080), &p, false), None);
    }

    #[test]
    fn test_downscale_ignores_codec() {
        let p = preset(PresetId::Scale1080p, Codec::Hevc, 1080);
        // 4K HEVC still needs the downscale.
        assert_eq!(skip_reason(&probe("hevc", 2160), &p, false), None);
        // At or below the target: skip, regardless of codec.
        assert!(skip_reason(&probe("h264", 1080), &p, false).is_some());
        assert!(skip_reason(&probe("h264", 720), &p, false).is_some());
    }

    #[test]
    fn test_h264_compress_proceeds() {
        let p = preset(PresetId::CompressHevc, Codec::Hevc, 0);
        assert_eq!(skip_reason(&probe("h264", 1080), &p, false), None);
    }
}
