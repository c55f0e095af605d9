//! SmartShrink: per-file quality search.
//!
//! Extracts short stream-copy samples from the source, encodes them across
//! a bounded range of quality values, scores each against the original with
//! VMAF, and picks the smallest-file candidate that still clears the tier
//! threshold. VMAF is CPU-bound, so admissions go through a slot gate sized
//! independently of the worker count.

use crate::config::QualityTier;
use crate::encoder::command::{self, BuildInput, TonemapParams};
use crate::encoder::{EncoderKind, EncoderRegistry};
use crate::error::{Result, ShrinkrayError};
use crate::preset::{crf_range, modifier_range, Codec, Preset, QualityOverrides};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIN_DURATION_SECS: f64 = 5.0;
const SAMPLE_LENGTH_SECS: f64 = 20.0;
const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MODIFIER_STEP: f64 = 0.05;
const CRF_STEP: u8 = 2;

#[derive(Debug)]
pub struct AnalysisRequest<'a> {
    pub job_id: i64,
    pub input: &'a Path,
    pub preset: &'a Preset,
    pub registry: &'a EncoderRegistry,
    pub duration_secs: f64,
    pub source_bitrate_bps: i64,
    pub source_height: u32,
    pub is_hdr: bool,
    pub color_transfer: &'a str,
    pub tier: QualityTier,
    pub tonemap_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Skip {
        reason: String,
    },
    Selected {
        selected_crf: Option<i64>,
        quality_mod: Option<f64>,
        vmaf_score: f64,
    },
}

/// Counter-based admission gate. Waiters poll; lowering the limit never
/// pre-empts a running analysis.
struct SlotState {
    limit: usize,
    in_use: usize,
}

pub struct AnalyzerSlots {
    state: Mutex<SlotState>,
}

impl AnalyzerSlots {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(SlotState {
                limit: limit.clamp(1, 3),
                in_use: 0,
            }),
        }
    }

    pub fn set_limit(&self, limit: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.limit = limit.clamp(1, 3);
        }
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<SlotGuard<'_>> {
        loop {
            {
                let mut state = self
                    .state
                    .lock()
                    .map_err(|_| ShrinkrayError::Analysis("slot lock poisoned".into()))?;
                if state.in_use < state.limit {
                    state.in_use += 1;
                    return Ok(SlotGuard { slots: self });
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(SLOT_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(ShrinkrayError::Cancelled),
            }
        }
    }
}

pub struct SlotGuard<'a> {
    slots: &'a AnalyzerSlots,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.slots.state.lock() {
            state.in_use = state.in_use.saturating_sub(1);
        }
    }
}

pub struct SmartShrink {
    slots: AnalyzerSlots,
}

impl SmartShrink {
    pub fn new(slot_limit: usize) -> Self {
        Self {
            slots: AnalyzerSlots::new(slot_limit),
        }
    }

    /// Applies to subsequent admissions only.
    pub fn set_slot_limit(&self, limit: usize) {
        self.slots.set_limit(limit);
    }

    pub async fn analyze(
        &self,
        cancel: &CancellationToken,
        request: &AnalysisRequest<'_>,
    ) -> Result<AnalysisOutcome> {
        if let Some(reason) = preflight_skip(request) {
            return Ok(AnalysisOutcome::Skip { reason });
        }

        // The caller sets the job phase to analyzing before this acquire so
        // the queue shows the wait.
        let _slot = self.slots.acquire(cancel).await?;
        run_search(cancel, request).await
    }
}

fn preflight_skip(request: &AnalysisRequest<'_>) -> Option<String> {
    if request.is_hdr && !request.tonemap_enabled {
        return Some("HDR source with tonemapping disabled".to_string());
    }
    if request.is_hdr && request.color_transfer.is_empty() {
        return Some("HDR source without color transfer metadata".to_string());
    }
    if request.duration_secs < MIN_DURATION_SECS {
        return Some(format!(
            "source shorter than {:.0}s",
            MIN_DURATION_SECS
        ));
    }
    None
}

/// Fixed sample positions as fractions of the source duration.
fn sample_positions(duration_secs: f64) -> Vec<f64> {
    if duration_secs >= 60.0 {
        vec![0.25, 0.50, 0.75]
    } else {
        vec![0.50]
    }
}

/// Candidate qualities, smallest expected file first.
fn crf_candidates(encoder: EncoderKind, codec: Codec) -> Vec<u8> {
    let (best, worst) = crf_range(encoder, codec);
    let mut candidates = Vec::new();
    let mut crf = worst;
    while crf > best {
        candidates.push(crf);
        crf = crf.saturating_sub(CRF_STEP);
    }
    candidates.push(best);
    candidates
}

fn modifier_candidates(codec: Codec) -> Vec<f64> {
    let (min_mod, max_mod) = modifier_range(codec);
    let mut candidates = Vec::new();
    let mut modifier = min_mod;
    while modifier < max_mod - 1e-9 {
        candidates.push(modifier);
        modifier += MODIFIER_STEP;
    }
    candidates.push(max_mod);
    candidates
}

async fn run_search(
    cancel: &CancellationToken,
    request: &AnalysisRequest<'_>,
) -> Result<AnalysisOutcome> {
    let scratch = std::env::temp_dir().join(format!("shrinkray-analysis-{}", request.job_id));
    tokio::fs::create_dir_all(&scratch).await?;

    let result = search_in_scratch(cancel, request, &scratch).await;

    if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
        warn!("Failed to clean analysis scratch {:?}: {}", scratch, e);
    }
    result
}

async fn search_in_scratch(
    cancel: &CancellationToken,
    request: &AnalysisRequest<'_>,
    scratch: &Path,
) -> Result<AnalysisOutcome> {
    let samples = extract_samples(cancel, request, scratch).await?;
    let threshold = request.tier.min_vmaf();
    let encoder = request.preset.encoder;
    let codec = request.preset.codec;

    info!(
        "[Job {}] Searching {} quality values for VMAF >= {:.1}",
        request.job_id, encoder, threshold
    );

    if encoder == EncoderKind::Videotoolbox {
        let candidates = modifier_candidates(codec);
        let mut best: Option<(f64, f64)> = None;
        for modifier in candidates {
            let overrides = QualityOverrides {
                videotoolbox_modifier: Some(modifier),
                ..Default::default()
            };
            let score = score_candidate(cancel, request, scratch, &samples, &overrides).await?;
            debug!(
                "[Job {}] modifier {:.2} scored {:.2}",
                request.job_id, modifier, score
            );
            best = Some((modifier, score));
            if score >= threshold {
                break;
            }
        }
        let (quality_mod, vmaf_score) = best
            .ok_or_else(|| ShrinkrayError::Analysis("no quality candidates".into()))?;
        return Ok(AnalysisOutcome::Selected {
            selected_crf: None,
            quality_mod: Some(quality_mod),
            vmaf_score,
        });
    }

    let candidates = crf_candidates(encoder, codec);
    let mut best: Option<(u8, f64)> = None;
    for crf in candidates {
        let overrides = match codec {
            Codec::Hevc => QualityOverrides {
                hevc_crf: Some(crf),
                ..Default::default()
            },
            Codec::Av1 => QualityOverrides {
                av1_crf: Some(crf),
                ..Default::default()
            },
        };
        let score = score_candidate(cancel, request, scratch, &samples, &overrides).await?;
        debug!("[Job {}] crf {} scored {:.2}", request.job_id, crf, score);
        best = Some((crf, score));
        if score >= threshold {
            break;
        }
    }
    let (selected_crf, vmaf_score) =
        best.ok_or_else(|| ShrinkrayError::Analysis("no quality candidates".into()))?;
    Ok(AnalysisOutcome::Selected {
        selected_crf: Some(selected_crf as i64),
        quality_mod: None,
        vmaf_score,
    })
}

/// Stream-copy short samples out of the source; no decode involved.
async fn extract_samples(
    cancel: &CancellationToken,
    request: &AnalysisRequest<'_>,
    scratch: &Path,
) -> Result<Vec<PathBuf>> {
    let mut samples = Vec::new();
    let length = SAMPLE_LENGTH_SECS.min(request.duration_secs);

    for (i, position) in sample_positions(request.duration_secs).iter().enumerate() {
        let start = (request.duration_secs * position - length / 2.0).max(0.0);
        let sample = scratch.join(format!("sample-{}.mkv", i));
        let args = vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            format!("{:.3}", start),
            "-i".to_string(),
            request.input.to_string_lossy().into_owned(),
            "-t".to_string(),
            format!("{:.3}", length),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-c".to_string(),
            "copy".to_string(),
            sample.to_string_lossy().into_owned(),
        ];
        let (status, _, stderr) = run_ffmpeg(cancel, &args).await?;
        if !status.success() {
            return Err(ShrinkrayError::Analysis(format!(
                "sample extraction failed: {}",
                stderr.lines().last().unwrap_or("unknown error")
            )));
        }
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode every sample at the candidate quality and average the VMAF of
/// each encode against its original sample.
async fn score_candidate(
    cancel: &CancellationToken,
    request: &AnalysisRequest<'_>,
    scratch: &Path,
    samples: &[PathBuf],
    overrides: &QualityOverrides,
) -> Result<f64> {
    let mut total = 0.0;
    for (i, sample) in samples.iter().enumerate() {
        let encoded = scratch.join(format!("encoded-{}.mkv", i));
        encode_sample(cancel, request, sample, &encoded, overrides).await?;
        total += run_vmaf(cancel, sample, &encoded).await?;
        let _ = tokio::fs::remove_file(&encoded).await;
    }
    Ok(total / samples.len() as f64)
}

async fn encode_sample(
    cancel: &CancellationToken,
    request: &AnalysisRequest<'_>,
    sample: &Path,
    output: &Path,
    overrides: &QualityOverrides,
) -> Result<()> {
    let tonemap = request.is_hdr.then(TonemapParams::default);
    let args = command::build(&BuildInput {
        preset: request.preset,
        encoder: request.preset.encoder,
        registry: request.registry,
        overrides,
        software_decode: false,
        output_format: crate::config::OutputFormat::Mkv,
        source_bitrate_bps: request.source_bitrate_bps.max(0) as u64,
        source_height: request.source_height,
        is_hdr: request.is_hdr,
        tonemap,
        subtitle_indices: Some(&[]),
    });

    let mut argv: Vec<String> = vec!["-y".into(), "-v".into(), "error".into()];
    argv.extend(args.pre_input);
    argv.push("-i".into());
    argv.push(sample.to_string_lossy().into_owned());
    argv.extend(args.post_input);
    argv.push(output.to_string_lossy().into_owned());

    let (status, _, stderr) = run_ffmpeg(cancel, &argv).await?;
    if !status.success() {
        return Err(ShrinkrayError::Analysis(format!(
            "sample encode failed: {}",
            stderr.lines().last().unwrap_or("unknown error")
        )));
    }
    Ok(())
}

/// Score the encoded sample against its source with libvmaf.
async fn run_vmaf(
    cancel: &CancellationToken,
    reference: &Path,
    distorted: &Path,
) -> Result<f64> {
    let args = vec![
        "-v".to_string(),
        "error".to_string(),
        "-i".to_string(),
        distorted.to_string_lossy().into_owned(),
        "-i".to_string(),
        reference.to_string_lossy().into_owned(),
        "-lavfi".to_string(),
        "libvmaf=log_fmt=json:log_path=-".to_string(),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ];

    let (status, stdout, stderr) = run_ffmpeg(cancel, &args).await?;
    if !status.success() {
        return Err(ShrinkrayError::Analysis(format!(
            "VMAF scoring failed: {}",
            stderr.lines().last().unwrap_or("unknown error")
        )));
    }

    extract_vmaf_score(&stdout)
        .or_else(|| extract_vmaf_score(&stderr))
        .ok_or_else(|| ShrinkrayError::Analysis("no VMAF score in output".into()))
}

/// Pull the pooled mean out of libvmaf's JSON log.
fn extract_vmaf_score(output: &str) -> Option<f64> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&output[start..=end]).ok()?;
    let vmaf = value.get("pooled_metrics")?.get("vmaf")?;
    vmaf.get("mean")
        .and_then(|v| v.as_f64())
        .or_else(|| vmaf.get("harmonic_mean").and_then(|v| v.as_f64()))
}

/// Spawn ffmpeg, capture both pipes, kill on cancellation.
async fn run_ffmpeg(
    cancel: &CancellationToken,
    args: &[String],
) -> Result<(std::process::ExitStatus, String, String)> {
    let mut child = tokio::process::Command::new("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ShrinkrayError::Cancelled);
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    Ok((status, stdout, stderr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::Presets;

    fn request<'a>(
        preset: &'a Preset,
        registry: &'a EncoderRegistry,
        duration: f64,
        is_hdr: bool,
        transfer: &'a str,
        tonemap: bool,
    ) -> AnalysisRequest<'a> {
        AnalysisRequest {
            job_id: 1,
            input: Path::new("/media/sample.mkv"),
            preset,
            registry,
            duration_secs: duration,
            source_bitrate_bps: 3_481_000,
            source_height: 1080,
            is_hdr,
            color_transfer: transfer,
            tier: QualityTier::Good,
            tonemap_enabled: tonemap,
        }
    }

    #[test]
    fn test_preflight_skips() {
        let registry = EncoderRegistry::software_only();
        let presets = Presets::resolve(&registry);
        let preset = presets.get("smartshrink-hevc").unwrap();

        let hdr_no_tonemap = request(preset, &registry, 120.0, true, "smpte2084", false);
        assert!(preflight_skip(&hdr_no_tonemap)
            .unwrap()
            .contains("tonemapping disabled"));

        let hdr_no_transfer = request(preset, &registry, 120.0, true, "", true);
        assert!(preflight_skip(&hdr_no_transfer)
            .unwrap()
            .contains("color transfer"));

        let too_short = request(preset, &registry, 3.0, false, "bt709", true);
        assert!(preflight_skip(&too_short).unwrap().contains("shorter"));

        let fine = request(preset, &registry, 120.0, false, "bt709", true);
        assert_eq!(preflight_skip(&fine), None);
    }

    #[test]
    fn test_sample_positions() {
        assert_eq!(sample_positions(120.0), vec![0.25, 0.50, 0.75]);
        assert_eq!(sample_positions(59.0), vec![0.50]);
    }

    #[test]
    fn test_crf_candidates_smallest_file_first() {
        let candidates = crf_candidates(EncoderKind::None, Codec::Hevc);
        assert_eq!(candidates.first(), Some(&32));
        assert_eq!(candidates.last(), Some(&18));
        assert!(candidates.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_modifier_candidates_ascending() {
        let candidates = modifier_candidates(Codec::Hevc);
        assert!((candidates[0] - 0.10).abs() < 1e-9);
        assert!((candidates.last().unwrap() - 0.60).abs() < 1e-9);
        assert!(candidates.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_vmaf_json_parse() {
        let json = r#"{
            "pooled_metrics": {
                "vmaf": { "mean": 87.65, "harmonic_mean": 86.0 }
            }
        }"#;
        assert!((extract_vmaf_score(json).unwrap() - 87.65).abs() < 0.01);
        assert_eq!(extract_vmaf_score("no json here"), None);
    }

    #[tokio::test]
    async fn test_slot_gate_limits_admissions() {
        let slots = AnalyzerSlots::new(1);
        let cancel = CancellationToken::new();
        let guard = slots.acquire(&cancel).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(250),
            slots.acquire(&cancel),
        )
        .await;
        assert!(blocked.is_err(), "second acquire must wait");

        drop(guard);
        let granted = tokio::time::timeout(
            Duration::from_millis(500),
            slots.acquire(&cancel),
        )
        .await;
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn test_slot_acquire_cancels() {
        let slots = AnalyzerSlots::new(1);
        let cancel = CancellationToken::new();
        let _guard = slots.acquire(&cancel).await.unwrap();

        cancel.cancel();
        let result = slots.acquire(&cancel).await;
        assert!(matches!(result, Err(ShrinkrayError::Cancelled)));
    }

    #[tokio::test]
    async fn test_lowered_limit_applies_to_new_admissions() {
        let slots = AnalyzerSlots::new(2);
        let cancel = CancellationToken::new();
        let _a = slots.acquire(&cancel).await.unwrap();
        let _b = slots.acquire(&cancel).await.unwrap();

        // Both guards stay held after lowering; only new admissions block.
        slots.set_limit(1);
        let blocked = tokio::time::timeout(
            Duration::from_millis(250),
            slots.acquire(&cancel),
        )
        .await;
        assert!(blocked.is_err());
    }

    #[test]
    fn test_clamped_slot_limit() {
        let slots = AnalyzerSlots::new(10);
        let state = slots.state.lock().unwrap();
        assert_eq!(state.limit, 3);
    }
}
