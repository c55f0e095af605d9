//! Worker pool: claims pending jobs and drives them through analysis,
//! transcode, and finalize.
//!
//! Cancellation is a three-level token tree. The pool token covers
//! shutdown, each worker holds a child used by resize, and each job gets a
//! grandchild for user cancels. A job whose worker token fired is left
//! `running` on disk so restart recovery turns it back into `pending`; a
//! job whose own token fired while the worker stays alive is a user cancel
//! and is marked `cancelled`.

use crate::config::{OutputFormat, QualityTier};
use crate::encoder::command::TonemapParams;
use crate::encoder::{requires_software_decode, EncoderRegistry};
use crate::error::ShrinkrayError;
use crate::media::probe::probe_subtitles;
use crate::media::subtitles::filter_for_mkv;
use crate::preset::{Presets, QualityOverrides};
use crate::queue::Queue;
use crate::schedule::ScheduleConfig;
use crate::smartshrink::{AnalysisOutcome, AnalysisRequest, SmartShrink};
use crate::store::{Job, JobPhase, JobStatus};
use crate::transcode::{self, temp_path_for, TranscodeRequest};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 6;

const IDLE_POLL: Duration = Duration::from_millis(500);
const SCHEDULE_POLL: Duration = Duration::from_secs(30);
const SUBTITLE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROGRESS_BUFFER: usize = 16;

/// Hook invoked with old and new paths after finalize, so an HTTP layer
/// can drop stale directory listings.
pub type CacheInvalidator = Arc<dyn Fn(&Path) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub output_format: OutputFormat,
    pub replace_original: bool,
    pub keep_larger_files: bool,
    pub tonemap_hdr: bool,
    pub overrides: QualityOverrides,
    pub tier: QualityTier,
    pub schedule: ScheduleConfig,
}

struct CurrentJob {
    job_id: i64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct Worker {
    stop: CancellationToken,
    handle: JoinHandle<()>,
    current: Arc<StdMutex<Option<CurrentJob>>>,
}

impl Worker {
    fn current_job_id(&self) -> Option<i64> {
        self.current.lock().ok()?.as_ref().map(|c| c.job_id)
    }
}

struct PoolShared {
    queue: Arc<Queue>,
    registry: Arc<EncoderRegistry>,
    presets: Arc<Presets>,
    smartshrink: Arc<SmartShrink>,
    settings: PoolSettings,
    invalidate: CacheInvalidator,
    paused: AtomicBool,
    shutdown: CancellationToken,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<Worker>>,
    next_worker: AtomicUsize,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<Queue>,
        registry: Arc<EncoderRegistry>,
        presets: Arc<Presets>,
        smartshrink: Arc<SmartShrink>,
        settings: PoolSettings,
        invalidate: CacheInvalidator,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                queue,
                registry,
                presets,
                smartshrink,
                settings,
                invalidate,
                paused: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
            workers: Mutex::new(Vec::new()),
            next_worker: AtomicUsize::new(1),
        }
    }

    pub async fn start(&self, count: usize) {
        let count = count.clamp(MIN_WORKERS, MAX_WORKERS);
        let mut workers = self.workers.lock().await;
        while workers.len() < count {
            workers.push(self.spawn_worker());
        }
        info!("Worker pool started with {} workers", workers.len());
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    fn spawn_worker(&self) -> Worker {
        let worker_id = self.next_worker.fetch_add(1, Ordering::SeqCst);
        let stop = self.shared.shutdown.child_token();
        let current: Arc<StdMutex<Option<CurrentJob>>> = Arc::new(StdMutex::new(None));
        let shared = self.shared.clone();
        let handle = tokio::spawn(worker_loop(shared, stop.clone(), current.clone(), worker_id));
        Worker {
            stop,
            handle,
            current,
        }
    }

    /// Synchronous resize: when this returns the pool holds exactly
    /// `target` workers. Shrinking cancels the newest-running jobs first
    /// and requeues each to the front of the pending queue.
    pub async fn resize(&self, target: usize) {
        let target = target.clamp(MIN_WORKERS, MAX_WORKERS);
        let mut workers = self.workers.lock().await;

        while workers.len() < target {
            workers.push(self.spawn_worker());
        }

        while workers.len() > target {
            // Prefer the worker running the most recently added job.
            let victim = workers
                .iter()
                .enumerate()
                .filter_map(|(i, w)| w.current_job_id().map(|id| (id, i)))
                .max_by_key(|(id, _)| *id);

            let (job_id, index) = match victim {
                Some((id, index)) => (Some(id), index),
                // No busy workers left: drop an idle one from the tail.
                None => (None, workers.len() - 1),
            };

            let worker = workers.remove(index);
            worker.stop.cancel();
            if let Err(e) = worker.handle.await {
                warn!("Worker join failed during resize: {}", e);
            }

            // The stopped worker left the job `running`; requeue while that
            // record is still in place so it lands at the queue front.
            if let Some(job_id) = job_id {
                if let Err(e) = self.shared.queue.requeue(job_id).await {
                    warn!("Failed to requeue job {} after resize: {}", job_id, e);
                }
            }
        }

        info!("Worker pool resized to {}", workers.len());
    }

    /// Pause the pool and requeue everything in flight. Requeues run
    /// newest-job-first so the pending queue front ends up oldest-first.
    /// Returns the number of jobs requeued.
    pub async fn pause(&self) -> usize {
        self.shared.paused.store(true, Ordering::SeqCst);
        let workers = self.workers.lock().await;

        let mut running: Vec<i64> = workers.iter().filter_map(|w| w.current_job_id()).collect();
        running.sort();

        let mut requeued = 0;
        for job_id in running.iter().rev() {
            match self.shared.queue.requeue(*job_id).await {
                Ok(()) => {
                    requeued += 1;
                    for worker in workers.iter() {
                        if let Ok(current) = worker.current.lock() {
                            if let Some(current) = current.as_ref() {
                                if current.job_id == *job_id {
                                    current.cancel.cancel();
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!("Failed to requeue job {} for pause: {}", job_id, e),
            }
        }
        info!("Pool paused; {} jobs requeued", requeued);
        requeued
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        info!("Pool resumed");
    }

    /// Cancel a specific running job. Returns a channel that resolves when
    /// the owning worker has finished tearing the job down, or `None` if no
    /// worker currently holds that job.
    pub async fn cancel_current_job(&self, job_id: i64) -> Option<watch::Receiver<bool>> {
        let workers = self.workers.lock().await;
        for worker in workers.iter() {
            let Ok(current) = worker.current.lock() else {
                continue;
            };
            if let Some(current) = current.as_ref() {
                if current.job_id == job_id {
                    current.cancel.cancel();
                    return Some(current.done.clone());
                }
            }
        }
        None
    }

    /// Shut the pool down. In-flight jobs stay `running` on disk; the next
    /// startup's recovery pass returns them to `pending`.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let mut workers = self.workers.lock().await;
        let handles: Vec<JoinHandle<()>> = workers.drain(..).map(|w| w.handle).collect();
        futures::future::join_all(handles).await;
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    shared: Arc<PoolShared>,
    stop: CancellationToken,
    current: Arc<StdMutex<Option<CurrentJob>>>,
    worker_id: usize,
) {
    loop {
        if stop.is_cancelled() {
            return;
        }

        if shared.paused.load(Ordering::SeqCst) {
            if sleep_or_stop(&stop, IDLE_POLL).await {
                return;
            }
            continue;
        }

        if !shared.settings.schedule.should_run() {
            if sleep_or_stop(&stop, SCHEDULE_POLL).await {
                return;
            }
            continue;
        }

        let job = match shared.queue.get_next_pending().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                if sleep_or_stop(&stop, IDLE_POLL).await {
                    return;
                }
                continue;
            }
            Err(e) => {
                error!("Worker {}: queue read failed: {}", worker_id, e);
                if sleep_or_stop(&stop, IDLE_POLL).await {
                    return;
                }
                continue;
            }
        };

        process_job(&shared, &stop, &current, job).await;
    }
}

/// True when the worker should exit.
async fn sleep_or_stop(stop: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop.cancelled() => true,
    }
}

async fn process_job(
    shared: &Arc<PoolShared>,
    stop: &CancellationToken,
    current: &Arc<StdMutex<Option<CurrentJob>>>,
    job: Job,
) {
    let job_cancel = stop.child_token();
    let (done_tx, done_rx) = watch::channel(false);
    if let Ok(mut cell) = current.lock() {
        *cell = Some(CurrentJob {
            job_id: job.id,
            cancel: job_cancel.clone(),
            done: done_rx,
        });
    }

    run_job(shared, stop, &job_cancel, &job).await;

    if let Ok(mut cell) = current.lock() {
        *cell = None;
    }
    let _ = done_tx.send(true);
}

async fn run_job(
    shared: &Arc<PoolShared>,
    stop: &CancellationToken,
    job_cancel: &CancellationToken,
    job: &Job,
) {
    let settings = &shared.settings;
    let Some(preset) = shared.presets.get(&job.preset_id).copied() else {
        let _ = shared
            .queue
            .fail_job(job.id, &format!("unknown preset: {}", job.preset_id))
            .await;
        return;
    };

    let input = PathBuf::from(&job.input_path);
    let temp = temp_path_for(&input, settings.output_format);

    // Another worker may have claimed it between the read and here.
    if shared.queue.start_job(job.id, &temp).await.is_err() {
        return;
    }

    let mut overrides = settings.overrides;

    if preset.is_smartshrink {
        // Phase flips before the slot acquire so waits show as "analyzing".
        let _ = shared.queue.set_phase(job.id, JobPhase::Analyzing).await;

        let request = AnalysisRequest {
            job_id: job.id,
            input: &input,
            preset: &preset,
            registry: &shared.registry,
            duration_secs: job.duration_ms as f64 / 1000.0,
            source_bitrate_bps: job.bitrate_bps,
            source_height: job.height,
            is_hdr: job.is_hdr,
            color_transfer: &job.color_transfer,
            tier: settings.tier,
            tonemap_enabled: settings.tonemap_hdr,
        };

        match shared.smartshrink.analyze(job_cancel, &request).await {
            Ok(AnalysisOutcome::Skip { reason }) => {
                let _ = shared.queue.skip_job(job.id, &reason).await;
                return;
            }
            Ok(AnalysisOutcome::Selected {
                selected_crf,
                quality_mod,
                vmaf_score,
            }) => {
                let _ = shared
                    .queue
                    .set_analysis_result(
                        job.id,
                        Some(vmaf_score),
                        selected_crf,
                        quality_mod,
                        settings.tier.as_str(),
                    )
                    .await;
                if let Some(crf) = selected_crf {
                    match preset.codec {
                        crate::preset::Codec::Hevc => overrides.hevc_crf = Some(crf as u8),
                        crate::preset::Codec::Av1 => overrides.av1_crf = Some(crf as u8),
                    }
                }
                if let Some(quality_mod) = quality_mod {
                    overrides.videotoolbox_modifier = Some(quality_mod);
                }
            }
            Err(ShrinkrayError::Cancelled) => {
                handle_cancel(shared, stop, job.id).await;
                return;
            }
            Err(e) => {
                let _ = shared
                    .queue
                    .fail_job(job.id, &format!("analysis failed: {}", e))
                    .await;
                return;
            }
        }
    }

    let _ = shared.queue.set_phase(job.id, JobPhase::Encoding).await;

    let tonemap = (job.is_hdr && settings.tonemap_hdr).then(TonemapParams::default);

    // MKV keeps compatible subtitle streams; a failed probe falls back to
    // mapping everything.
    let subtitle_indices: Option<Vec<i64>> = if settings.output_format == OutputFormat::Mkv {
        match tokio::time::timeout(SUBTITLE_PROBE_TIMEOUT, probe_subtitles(&input)).await {
            Ok(Ok(streams)) => {
                let filter = filter_for_mkv(Some(&streams));
                if !filter.dropped.is_empty() {
                    info!(
                        "[Job {}] Dropping subtitle codecs not muxable to MKV: {}",
                        job.id,
                        filter.dropped.join(", ")
                    );
                }
                filter.compatible
            }
            Ok(Err(e)) => {
                warn!("[Job {}] Subtitle probe failed, mapping all: {}", job.id, e);
                None
            }
            Err(_) => {
                warn!("[Job {}] Subtitle probe timed out, mapping all", job.id);
                None
            }
        }
    } else {
        None
    };

    let (progress_tx, mut progress_rx) = mpsc::channel::<transcode::ProgressUpdate>(PROGRESS_BUFFER);
    let progress_queue = shared.queue.clone();
    let progress_job_id = job.id;
    let forwarder = tokio::spawn(async move {
        while let Some(update) = progress_rx.recv().await {
            progress_queue
                .update_progress(
                    progress_job_id,
                    update.percent,
                    update.speed,
                    &update.eta,
                )
                .await;
        }
    });

    // Recovery ladder: software decode on the same encoder first, then the
    // fallback chain. The earliest failure is kept for diagnostics.
    let mut encoder = preset.encoder;
    let mut software_decode = requires_software_decode(
        &job.video_codec,
        &job.profile,
        job.bit_depth as u8,
        encoder,
    );
    let mut first_error: Option<ShrinkrayError> = None;

    let outcome = loop {
        let attempt = transcode::transcode(
            job_cancel,
            TranscodeRequest {
                input: &input,
                output: &temp,
                preset: &preset,
                encoder,
                registry: &shared.registry,
                overrides: &overrides,
                duration_ms: job.duration_ms,
                source_bitrate_bps: job.bitrate_bps,
                source_height: job.height,
                is_hdr: job.is_hdr,
                total_frames: total_frames(job),
                software_decode,
                output_format: settings.output_format,
                tonemap,
                subtitle_indices: subtitle_indices.as_deref(),
            },
            progress_tx.clone(),
        )
        .await;

        match attempt {
            Ok(outcome) => break Some(outcome),
            Err(ShrinkrayError::Cancelled) => {
                drop(progress_tx);
                let _ = forwarder.await;
                handle_cancel(shared, stop, job.id).await;
                return;
            }
            Err(e) => {
                warn!(
                    "[Job {}] Encode failed on {} ({} decode): {}",
                    job.id,
                    encoder,
                    if software_decode { "software" } else { "hardware" },
                    e
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }

                if !software_decode && encoder.is_hardware() {
                    software_decode = true;
                    continue;
                }

                match shared.registry.next_fallback(encoder, preset.codec) {
                    Some(next) => {
                        info!("[Job {}] Falling back to {} encoder", job.id, next);
                        encoder = next;
                        software_decode = requires_software_decode(
                            &job.video_codec,
                            &job.profile,
                            job.bit_depth as u8,
                            next,
                        );
                        continue;
                    }
                    None => break None,
                }
            }
        }
    };

    drop(progress_tx);
    let _ = forwarder.await;

    let Some(outcome) = outcome else {
        let message = first_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "all encoders failed".to_string());
        let _ = shared.queue.fail_job(job.id, &message).await;
        return;
    };

    if outcome.output_size >= outcome.input_size && !settings.keep_larger_files {
        let _ = tokio::fs::remove_file(&temp).await;
        let _ = shared
            .queue
            .skip_job(
                job.id,
                &format!(
                    "output larger than input ({} >= {} bytes)",
                    outcome.output_size, outcome.input_size
                ),
            )
            .await;
        return;
    }

    match transcode::finalize(&input, &temp, settings.output_format, settings.replace_original)
        .await
    {
        Ok(final_path) => {
            (shared.invalidate)(&input);
            (shared.invalidate)(&final_path);
            if let Err(e) = shared
                .queue
                .complete_job(job.id, &final_path, outcome.output_size)
                .await
            {
                error!("[Job {}] Failed to record completion: {}", job.id, e);
            } else {
                info!(
                    "[Job {}] Complete: saved {} bytes in {:.0}s",
                    job.id,
                    outcome.space_saved,
                    outcome.transcode_time.as_secs_f64()
                );
            }
        }
        Err(e) => {
            let _ = shared
                .queue
                .fail_job(job.id, &format!("finalize failed: {}", e))
                .await;
        }
    }
}

fn total_frames(job: &Job) -> u64 {
    if job.frame_rate > 0.0 && job.duration_ms > 0 {
        (job.duration_ms as f64 / 1000.0 * job.frame_rate) as u64
    } else {
        0
    }
}

/// A fired job token means one of two things. If the worker (or pool) token
/// is down this is a shutdown or resize: leave the job `running` so restart
/// recovery or the resize requeue picks it up. Otherwise it's a user
/// cancel: mark the job cancelled, unless something (pause) already moved
/// it out of `running`.
async fn handle_cancel(shared: &Arc<PoolShared>, stop: &CancellationToken, job_id: i64) {
    if stop.is_cancelled() {
        return;
    }
    match shared.queue.get(job_id).await {
        Ok(Some(job)) if job.status == JobStatus::Running => {
            let _ = shared.queue.cancel_job(job_id).await;
        }
        _ => {}
    }
}
