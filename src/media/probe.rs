use crate::error::{Result, ShrinkrayError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Serialize, Deserialize)]
pub struct FfprobeOutput {
    #[serde(default)]
    pub streams: Vec<Stream>,
    pub format: Format,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Stream {
    pub index: i64,
    pub codec_name: Option<String>,
    pub codec_type: String,
    pub profile: Option<String>,
    pub pix_fmt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bit_rate: Option<String>,
    pub bits_per_raw_sample: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
    pub nb_frames: Option<String>,
    pub color_primaries: Option<String>,
    pub color_transfer: Option<String>,
    pub color_space: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Format {
    pub format_name: String,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
}

/// Source snapshot captured at enqueue time. Never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub path: PathBuf,
    pub size: u64,
    pub duration_secs: f64,
    pub format: String,
    pub video_codec: String,
    pub audio_codec: Option<String>,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u64,
    pub frame_rate: f64,
    pub profile: String,
    pub pix_fmt: String,
    pub bit_depth: u8,
    pub color_transfer: String,
    pub color_primaries: String,
    pub color_space: String,
    pub is_hdr: bool,
}

impl ProbeResult {
    pub fn is_hevc(&self) -> bool {
        matches!(self.video_codec.as_str(), "hevc" | "h265")
    }

    pub fn is_av1(&self) -> bool {
        self.video_codec == "av1"
    }

    pub fn total_frames(&self) -> u64 {
        if self.frame_rate > 0.0 && self.duration_secs > 0.0 {
            (self.duration_secs * self.frame_rate) as u64
        } else {
            0
        }
    }
}

/// A subtitle stream as reported by the probe, identified by its absolute
/// stream index within the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleStream {
    pub index: i64,
    pub codec_name: String,
}

/// Probe a media file with ffprobe.
pub async fn probe_file(path: &Path) -> Result<ProbeResult> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let output = run_ffprobe(&path)?;
        build_probe_result(path, output)
    })
    .await
    .map_err(|e| ShrinkrayError::Probe(format!("spawn_blocking failed: {}", e)))?
}

/// List the subtitle streams of a media file.
pub async fn probe_subtitles(path: &Path) -> Result<Vec<SubtitleStream>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "s",
                "-show_entries",
                "stream=index,codec_name,codec_type",
                "-print_format",
                "json",
            ])
            .arg(&path)
            .output()
            .map_err(|e| ShrinkrayError::Probe(format!("Failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(ShrinkrayError::Probe(format!("ffprobe failed: {}", err)));
        }

        #[derive(Deserialize)]
        struct SubtitleProbe {
            #[serde(default)]
            streams: Vec<Stream>,
        }

        let probe: SubtitleProbe = serde_json::from_slice(&output.stdout)
            .map_err(|e| ShrinkrayError::Probe(format!("Failed to parse ffprobe JSON: {}", e)))?;

        Ok(probe
            .streams
            .into_iter()
            .filter(|s| s.codec_type == "subtitle")
            .map(|s| SubtitleStream {
                index: s.index,
                codec_name: s.codec_name.unwrap_or_default(),
            })
            .collect())
    })
    .await
    .map_err(|e| ShrinkrayError::Probe(format!("spawn_blocking failed: {}", e)))?
}

fn run_ffprobe(path: &Path) -> Result<FfprobeOutput> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_entries",
            "format=format_name,duration,size,bit_rate:stream=index,codec_type,codec_name,profile,pix_fmt,width,height,bit_rate,bits_per_raw_sample,avg_frame_rate,r_frame_rate,nb_frames,color_primaries,color_transfer,color_space",
        ])
        .arg(path)
        .output()
        .map_err(|e| ShrinkrayError::Probe(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let err = String::from_utf8_lossy(&output.stderr);
        return Err(ShrinkrayError::Probe(format!("ffprobe failed: {}", err)));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| ShrinkrayError::Probe(format!("Failed to parse ffprobe JSON: {}", e)))
}

fn build_probe_result(path: PathBuf, probe: FfprobeOutput) -> Result<ProbeResult> {
    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| ShrinkrayError::Probe("No video stream found".to_string()))?;
    let audio = probe.streams.iter().find(|s| s.codec_type == "audio");

    let duration_secs = probe
        .format
        .duration
        .as_deref()
        .and_then(parse_f64)
        .unwrap_or(0.0);

    let bitrate_bps = video
        .bit_rate
        .as_deref()
        .and_then(parse_u64)
        .or_else(|| probe.format.bit_rate.as_deref().and_then(parse_u64))
        .unwrap_or(0);

    let frame_rate = video
        .avg_frame_rate
        .as_deref()
        .or(video.r_frame_rate.as_deref())
        .and_then(parse_frame_rate)
        .unwrap_or(0.0);

    let pix_fmt = video.pix_fmt.clone().unwrap_or_default();
    let bit_depth = infer_bit_depth(&pix_fmt, video.bits_per_raw_sample.as_deref());
    let color_transfer = video.color_transfer.clone().unwrap_or_default();
    let color_primaries = video.color_primaries.clone().unwrap_or_default();
    let is_hdr = detect_hdr(&color_transfer, &color_primaries, bit_depth);

    Ok(ProbeResult {
        path,
        size: probe
            .format
            .size
            .as_deref()
            .and_then(parse_u64)
            .unwrap_or(0),
        duration_secs,
        format: probe.format.format_name,
        video_codec: video.codec_name.clone().unwrap_or_default(),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        bitrate_bps,
        frame_rate,
        profile: video.profile.clone().unwrap_or_default(),
        pix_fmt,
        bit_depth,
        color_transfer,
        color_primaries,
        color_space: video.color_space.clone().unwrap_or_default(),
        is_hdr,
    })
}

/// Infer bit depth from pixel format when ffprobe doesn't report it directly.
pub fn infer_bit_depth(pix_fmt: &str, bits_per_raw_sample: Option<&str>) -> u8 {
    if let Some(depth) = bits_per_raw_sample.and_then(|s| s.parse().ok()) {
        return depth;
    }

    let fmt = pix_fmt.to_ascii_lowercase();
    if fmt.contains("10le") || fmt.contains("10be") || fmt.contains("p010") {
        10
    } else if fmt.contains("12le") || fmt.contains("12be") {
        12
    } else {
        8
    }
}

/// Detect HDR content from color metadata.
///
/// PQ (smpte2084) and HLG (arib-std-b67) transfers are definitive. Some
/// sources lose the transfer tag in remuxing; BT.2020 primaries on a
/// 10-bit-or-deeper stream is treated as HDR in that case.
pub fn detect_hdr(color_transfer: &str, color_primaries: &str, bit_depth: u8) -> bool {
    match color_transfer {
        "smpte2084" | "arib-std-b67" => true,
        "" => color_primaries == "bt2020" && bit_depth >= 10,
        _ => false,
    }
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        return Some(num / den);
    }
    s.parse().ok()
}

fn parse_f64(s: &str) -> Option<f64> {
    s.parse().ok()
}

fn parse_u64(s: &str) -> Option<u64> {
    s.parse().ok()
}
