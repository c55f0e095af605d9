//! Encoder subprocess driver.
//!
//! Spawns ffmpeg with the argv from the builder, parses the structured
//! `-progress pipe:1` stream from stdout, keeps a stderr tail for
//! diagnostics, and kills the child promptly on cancellation.

use crate::config::OutputFormat;
use crate::encoder::command::{self, BuildInput, TonemapParams};
use crate::encoder::{EncoderKind, EncoderRegistry};
use crate::error::{Result, ShrinkrayError};
use crate::preset::{Preset, QualityOverrides};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STDERR_TAIL_LINES: usize = 20;

/// Temp outputs live next to the input as `<stem>.shrinkray.tmp.<ext>`.
pub const TEMP_EXTENSION: &str = "shrinkray.tmp";

pub fn temp_path_for(input: &Path, format: OutputFormat) -> PathBuf {
    input.with_extension(format!("{}.{}", TEMP_EXTENSION, format.extension()))
}

#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub speed: f64,
    pub eta: String,
}

#[derive(Debug)]
pub struct TranscodeRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub preset: &'a Preset,
    pub encoder: EncoderKind,
    pub registry: &'a EncoderRegistry,
    pub overrides: &'a QualityOverrides,
    pub duration_ms: i64,
    pub source_bitrate_bps: i64,
    pub source_height: u32,
    pub is_hdr: bool,
    pub total_frames: u64,
    pub software_decode: bool,
    pub output_format: OutputFormat,
    pub tonemap: Option<TonemapParams>,
    pub subtitle_indices: Option<&'a [i64]>,
}

#[derive(Debug, Clone)]
pub struct TranscodeOutcome {
    pub input_size: i64,
    pub output_size: i64,
    pub space_saved: i64,
    pub transcode_time: Duration,
}

/// Run one encode attempt. Cancellation kills the child and removes the
/// partial output; the progress sink never blocks (updates drop when full).
pub async fn transcode(
    cancel: &CancellationToken,
    request: TranscodeRequest<'_>,
    progress: mpsc::Sender<ProgressUpdate>,
) -> Result<TranscodeOutcome> {
    let args = command::build(&BuildInput {
        preset: request.preset,
        encoder: request.encoder,
        registry: request.registry,
        overrides: request.overrides,
        software_decode: request.software_decode,
        output_format: request.output_format,
        source_bitrate_bps: request.source_bitrate_bps.max(0) as u64,
        source_height: request.source_height,
        is_hdr: request.is_hdr,
        tonemap: request.tonemap,
        subtitle_indices: request.subtitle_indices,
    });

    let mut argv: Vec<String> = vec![
        "-y".into(),
        "-nostats".into(),
        "-loglevel".into(),
        "error".into(),
        "-progress".into(),
        "pipe:1".into(),
    ];
    argv.extend(args.pre_input);
    argv.push("-i".into());
    argv.push(request.input.to_string_lossy().into_owned());
    argv.extend(args.post_input);
    argv.push(request.output.to_string_lossy().into_owned());

    info!(
        "Encoding {:?} with {} ({})",
        request.input.file_name().unwrap_or_default(),
        request.encoder,
        if request.software_decode {
            "software decode"
        } else {
            "hardware decode"
        }
    );
    debug!("ffmpeg {}", argv.join(" "));

    let start = Instant::now();
    let mut child = tokio::process::Command::new("ffmpeg")
        .args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ShrinkrayError::Transcode {
            exit_status: "spawn".into(),
            stderr_tail: "failed to capture stdout".into(),
        })?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ShrinkrayError::Transcode {
            exit_status: "spawn".into(),
            stderr_tail: "failed to capture stderr".into(),
        })?;

    // Drain stderr concurrently so a chatty encoder can't deadlock the pipe.
    let tail: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
    let tail_writer = tail.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut tail = tail_writer.lock().await;
            tail.push_back(line);
            if tail.len() > STDERR_TAIL_LINES {
                tail.pop_front();
            }
        }
    });

    let mut reader = BufReader::new(stdout).lines();
    let mut block = ProgressBlock::default();
    let mut cancelled = false;

    loop {
        tokio::select! {
            line = reader.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if block.absorb(&line) {
                            let update = block.to_update(request.duration_ms, request.total_frames);
                            let _ = progress.try_send(update);
                            block = ProgressBlock::default();
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Error reading encoder progress: {}", e);
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                warn!("Cancelling encode of {:?}", request.input);
                let _ = child.start_kill();
                cancelled = true;
                break;
            }
        }
    }

    let status = child.wait().await?;
    let _ = stderr_task.await;

    if cancelled {
        let _ = tokio::fs::remove_file(request.output).await;
        return Err(ShrinkrayError::Cancelled);
    }

    if !status.success() {
        let stderr_tail = tail.lock().await.iter().cloned().collect::<Vec<_>>().join("\n");
        let _ = tokio::fs::remove_file(request.output).await;
        return Err(ShrinkrayError::Transcode {
            exit_status: status.to_string(),
            stderr_tail,
        });
    }

    let input_size = tokio::fs::metadata(request.input).await?.len() as i64;
    let output_size = tokio::fs::metadata(request.output).await?.len() as i64;

    Ok(TranscodeOutcome {
        input_size,
        output_size,
        space_saved: input_size - output_size,
        transcode_time: start.elapsed(),
    })
}

/// Move the finished temp file into place. The only code path that mutates
/// the media tree.
pub async fn finalize(
    input: &Path,
    temp: &Path,
    format: OutputFormat,
    replace: bool,
) -> Result<PathBuf> {
    let final_path = input.with_extension(format.extension());

    if replace {
        tokio::fs::remove_file(input).await?;
        tokio::fs::rename(temp, &final_path).await?;
        return Ok(final_path);
    }

    let mut old = input.as_os_str().to_owned();
    old.push(".old");
    let old = PathBuf::from(old);
    tokio::fs::rename(input, &old).await?;
    if let Err(e) = tokio::fs::rename(temp, &final_path).await {
        // Put the original back; the temp stays for inspection.
        if let Err(restore) = tokio::fs::rename(&old, input).await {
            warn!("Failed to restore {:?} after rename error: {}", input, restore);
        }
        return Err(e.into());
    }
    Ok(final_path)
}

/// One key=value block from the `-progress` stream. A block ends at the
/// `progress=` key.
#[derive(Debug, Clone, Default)]
struct ProgressBlock {
    frame: u64,
    speed: f64,
    out_time_us: i64,
}

impl ProgressBlock {
    /// Returns true when the block is complete.
    fn absorb(&mut self, line: &str) -> bool {
        let Some((key, value)) = line.split_once('=') else {
            return false;
        };
        let value = value.trim();
        match key {
            "frame" => self.frame = value.parse().unwrap_or(0),
            "speed" => self.speed = value.trim_end_matches('x').parse().unwrap_or(0.0),
            "out_time_us" => self.out_time_us = value.parse().unwrap_or(-1),
            "progress" => return true,
            // fps, total_size and bitrate are carried by the stream but the
            // derived percent/speed/ETA are all the queue surfaces.
            _ => {}
        }
        false
    }

    fn to_update(&self, duration_ms: i64, total_frames: u64) -> ProgressUpdate {
        let duration_us = duration_ms as f64 * 1000.0;
        let percent = if self.out_time_us > 0 && duration_us > 0.0 {
            (self.out_time_us as f64 / duration_us * 100.0).min(100.0)
        } else if total_frames > 0 {
            // Some hardware pipelines report no usable out_time.
            (self.frame as f64 / total_frames as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        let eta = if self.speed > 0.0 && self.out_time_us > 0 && duration_us > 0.0 {
            let remaining_secs =
                ((duration_us - self.out_time_us as f64) / 1_000_000.0).max(0.0) / self.speed;
            format_eta(remaining_secs)
        } else {
            String::new()
        };

        ProgressUpdate {
            percent,
            speed: self.speed,
            eta,
        }
    }
}

fn format_eta(secs: f64) -> String {
    let secs = secs.round() as u64;
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_extension() {
        let temp = temp_path_for(Path::new("/media/film.mp4"), OutputFormat::Mkv);
        assert_eq!(temp, Path::new("/media/film.shrinkray.tmp.mkv"));
    }

    #[test]
    fn test_progress_block_parse() {
        let mut block = ProgressBlock::default();
        for line in [
            "frame=240",
            "fps=48.0",
            "total_size=1048576",
            "out_time_us=10000000",
            "bitrate=1500.0kbits/s",
            "speed=2.0x",
        ] {
            assert!(!block.absorb(line));
        }
        assert!(block.absorb("progress=continue"));

        // 10s of 100s at 2x: 10% done, 45s remaining.
        let update = block.to_update(100_000, 0);
        assert!((update.percent - 10.0).abs() < 0.001);
        assert_eq!(update.speed, 2.0);
        assert_eq!(update.eta, "45s");
    }

    #[test]
    fn test_progress_falls_back_to_frames() {
        let mut block = ProgressBlock::default();
        block.absorb("frame=500");
        block.absorb("out_time_us=0");
        block.absorb("speed=1.0x");
        let update = block.to_update(100_000, 1000);
        assert!((update.percent - 50.0).abs() < 0.001);
    }

    #[test]
    fn test_progress_caps_at_hundred() {
        let mut block = ProgressBlock::default();
        block.absorb("out_time_us=200000000");
        let update = block.to_update(100_000, 0);
        assert_eq!(update.percent, 100.0);
    }

    #[test]
    fn test_eta_formatting() {
        assert_eq!(format_eta(42.0), "42s");
        assert_eq!(format_eta(125.0), "2m05s");
        assert_eq!(format_eta(3725.0), "1h02m");
    }

    #[tokio::test]
    async fn test_finalize_replace() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("film.avi");
        let temp = dir.path().join("film.shrinkray.tmp.mkv");
        std::fs::write(&input, b"original").unwrap();
        std::fs::write(&temp, b"encoded").unwrap();

        let final_path = finalize(&input, &temp, OutputFormat::Mkv, true)
            .await
            .unwrap();

        assert_eq!(final_path, dir.path().join("film.mkv"));
        assert!(!input.exists());
        assert!(!temp.exists());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"encoded");
    }

    #[tokio::test]
    async fn test_finalize_keep_renames_original() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("film.avi");
        let temp = dir.path().join("film.shrinkray.tmp.mkv");
        std::fs::write(&input, b"original").unwrap();
        std::fs::write(&temp, b"encoded").unwrap();

        let final_path = finalize(&input, &temp, OutputFormat::Mkv, false)
            .await
            .unwrap();

        assert!(dir.path().join("film.avi.old").exists());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"encoded");
        assert!(!input.exists());
    }
}
