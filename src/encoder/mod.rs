//! Hardware encoder detection and selection.
//!
//! Probes what actually works on this host at startup: parses the encoder
//! list from ffmpeg, then runs a short synthetic test encode through every
//! hardware candidate. Init quirks (QSV device derivation, NVENC explicit
//! CUDA init, VAAPI render node) are resolved once here and consumed by the
//! argv builder.

use crate::error::{Result, ShrinkrayError};
use crate::preset::Codec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod command;
pub mod nvenc;
pub mod qsv;
pub mod software;
pub mod vaapi;
pub mod videotoolbox;

const TEST_ENCODE_TIMEOUT: Duration = Duration::from_secs(10);
const DRI_DIR: &str = "/dev/dri";

/// Hardware acceleration backend, or `None` for software encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[derive(sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    #[default]
    None,
    Videotoolbox,
    Nvenc,
    Qsv,
    Vaapi,
}

impl EncoderKind {
    /// Fallback priority, best first. Software is the terminal fallback.
    pub const PRIORITY: [EncoderKind; 4] = [
        EncoderKind::Videotoolbox,
        EncoderKind::Nvenc,
        EncoderKind::Qsv,
        EncoderKind::Vaapi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Videotoolbox => "videotoolbox",
            Self::Nvenc => "nvenc",
            Self::Qsv => "qsv",
            Self::Vaapi => "vaapi",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" | "" => Some(Self::None),
            "videotoolbox" => Some(Self::Videotoolbox),
            "nvenc" => Some(Self::Nvenc),
            "qsv" => Some(Self::Qsv),
            "vaapi" => Some(Self::Vaapi),
            _ => None,
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl std::fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// ffmpeg encoder name for an (accelerator, codec) pair.
pub fn encoder_name(kind: EncoderKind, codec: Codec) -> &'static str {
    match (kind, codec) {
        (EncoderKind::None, Codec::Hevc) => "libx265",
        (EncoderKind::None, Codec::Av1) => "libsvtav1",
        (EncoderKind::Videotoolbox, Codec::Hevc) => "hevc_videotoolbox",
        (EncoderKind::Videotoolbox, Codec::Av1) => "av1_videotoolbox",
        (EncoderKind::Nvenc, Codec::Hevc) => "hevc_nvenc",
        (EncoderKind::Nvenc, Codec::Av1) => "av1_nvenc",
        (EncoderKind::Qsv, Codec::Hevc) => "hevc_qsv",
        (EncoderKind::Qsv, Codec::Av1) => "av1_qsv",
        (EncoderKind::Vaapi, Codec::Hevc) => "hevc_vaapi",
        (EncoderKind::Vaapi, Codec::Av1) => "av1_vaapi",
    }
}

/// How QSV device init succeeded on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QsvInitMode {
    #[default]
    Direct,
    VaapiDerived,
}

/// How NVENC init succeeded on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NvencInitMode {
    #[default]
    Simple,
    Explicit,
}

/// Capability table populated once at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct EncoderRegistry {
    available: HashMap<(EncoderKind, Codec), bool>,
    pub vaapi_device: Option<String>,
    pub qsv_init: QsvInitMode,
    pub nvenc_init: NvencInitMode,
}

impl EncoderRegistry {
    /// Probe the host. Runs `ffmpeg -encoders`, then a bounded test encode
    /// for every hardware pair the build exposes.
    pub async fn detect() -> Result<Self> {
        let listed = list_encoders().await?;
        let vaapi_device = discover_render_device(Path::new(DRI_DIR));

        let mut registry = EncoderRegistry {
            available: HashMap::new(),
            vaapi_device,
            qsv_init: QsvInitMode::Direct,
            nvenc_init: NvencInitMode::Simple,
        };

        for kind in EncoderKind::PRIORITY {
            for codec in [Codec::Hevc, Codec::Av1] {
                let name = encoder_name(kind, codec);
                if !listed.contains(name) {
                    debug!("Encoder {} not present in this ffmpeg build", name);
                    registry.available.insert((kind, codec), false);
                    continue;
                }
                let works = registry.test_encode(kind, codec).await;
                if works {
                    info!("Encoder {} verified", name);
                } else {
                    warn!("Encoder {} listed but failed its test encode", name);
                }
                registry.available.insert((kind, codec), works);
            }
        }

        Ok(registry)
    }

    /// Registry with every hardware pair unavailable. Used when hardware
    /// probing is disabled and as the base for tests.
    pub fn software_only() -> Self {
        Self::default()
    }

    /// Registry with the given hardware pairs marked available, skipping the
    /// host probe entirely.
    pub fn with_available(pairs: &[(EncoderKind, Codec)]) -> Self {
        let mut registry = Self::default();
        for &(kind, codec) in pairs {
            registry.available.insert((kind, codec), true);
        }
        registry
    }

    /// Software encoding is always available.
    pub fn is_available(&self, kind: EncoderKind, codec: Codec) -> bool {
        if kind == EncoderKind::None {
            return true;
        }
        self.available.get(&(kind, codec)).copied().unwrap_or(false)
    }

    /// First available encoder in priority order, falling back to software.
    pub fn best_for_codec(&self, codec: Codec) -> EncoderKind {
        EncoderKind::PRIORITY
            .into_iter()
            .find(|&kind| self.is_available(kind, codec))
            .unwrap_or(EncoderKind::None)
    }

    /// Next available encoder strictly after `current` in priority order.
    /// Software is the terminal fallback; software itself has no fallback.
    pub fn next_fallback(&self, current: EncoderKind, codec: Codec) -> Option<EncoderKind> {
        if current == EncoderKind::None {
            return None;
        }
        let after = EncoderKind::PRIORITY
            .into_iter()
            .skip_while(|&kind| kind != current)
            .skip(1);
        for kind in after {
            if self.is_available(kind, codec) {
                return Some(kind);
            }
        }
        Some(EncoderKind::None)
    }

    async fn test_encode(&mut self, kind: EncoderKind, codec: Codec) -> bool {
        match kind {
            EncoderKind::Qsv => {
                if self.run_test_encode(kind, codec).await {
                    return true;
                }
                // Only flip the memoized mode from its default; a later
                // codec probe must not clobber a mode that already works.
                if self.qsv_init == QsvInitMode::Direct && self.vaapi_device.is_some() {
                    self.qsv_init = QsvInitMode::VaapiDerived;
                    if self.run_test_encode(kind, codec).await {
                        info!("QSV init requires VAAPI-derived device on this host");
                        return true;
                    }
                    self.qsv_init = QsvInitMode::Direct;
                }
                false
            }
            EncoderKind::Nvenc => {
                if self.run_test_encode(kind, codec).await {
                    return true;
                }
                if self.nvenc_init == NvencInitMode::Simple {
                    self.nvenc_init = NvencInitMode::Explicit;
                    if self.run_test_encode(kind, codec).await {
                        info!("NVENC init requires explicit CUDA device on this host");
                        return true;
                    }
                    self.nvenc_init = NvencInitMode::Simple;
                }
                false
            }
            EncoderKind::Vaapi if self.vaapi_device.is_none() => false,
            _ => self.run_test_encode(kind, codec).await,
        }
    }

    async fn run_test_encode(&self, kind: EncoderKind, codec: Codec) -> bool {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-v".into(), "error".into()];
        args.extend(self.test_init_args(kind));
        args.extend([
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            "testsrc=duration=1:size=640x360:rate=30".into(),
        ]);
        if let Some(filter) = self.upload_filter(kind) {
            args.extend(["-vf".into(), filter]);
        }
        args.extend([
            "-c:v".into(),
            encoder_name(kind, codec).into(),
            "-frames:v".into(),
            "30".into(),
            "-f".into(),
            "null".into(),
            "-".into(),
        ]);

        let child = tokio::process::Command::new("ffmpeg")
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn test encode: {}", e);
                return false;
            }
        };

        match tokio::time::timeout(TEST_ENCODE_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(_)) => false,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                false
            }
        }
    }

    fn test_init_args(&self, kind: EncoderKind) -> Vec<String> {
        match kind {
            EncoderKind::Qsv => qsv::device_args(self.qsv_init, self.vaapi_device.as_deref()),
            EncoderKind::Vaapi => vaapi::device_args(self.vaapi_device.as_deref()),
            EncoderKind::Nvenc => nvenc::device_args(self.nvenc_init),
            _ => Vec::new(),
        }
    }

    fn upload_filter(&self, kind: EncoderKind) -> Option<String> {
        match kind {
            EncoderKind::Qsv => Some(qsv::UPLOAD_FILTER.to_string()),
            EncoderKind::Vaapi => Some(vaapi::UPLOAD_FILTER.to_string()),
            _ => None,
        }
    }
}

/// True when the source format is known to break the hardware decoder
/// paired with `encoder`, so the decode must run in software.
pub fn requires_software_decode(
    video_codec: &str,
    profile: &str,
    bit_depth: u8,
    encoder: EncoderKind,
) -> bool {
    if encoder == EncoderKind::None {
        return false;
    }

    let codec = video_codec.to_ascii_lowercase();

    // 10-bit H.264 has no hardware decode path anywhere; NVENC's runtime
    // falls back on its own.
    if codec == "h264" && bit_depth == 10 && encoder != EncoderKind::Nvenc {
        return true;
    }

    match encoder {
        EncoderKind::Qsv => {
            if codec == "vc1" || codec == "wmv3" {
                return true;
            }
            if codec == "mpeg4" && !profile.trim().to_ascii_lowercase().starts_with("simple") {
                return true;
            }
            false
        }
        EncoderKind::Vaapi => codec == "vc1" || codec == "wmv3",
        EncoderKind::Nvenc => codec == "vc1",
        _ => false,
    }
}

async fn list_encoders() -> Result<HashSet<String>> {
    let output = tokio::process::Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .output()
        .await
        .map_err(|e| ShrinkrayError::Detection(format!("Failed to run ffmpeg -encoders: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut names = HashSet::new();

    for line in stdout.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('-') || trimmed.starts_with("Encoders:") {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let flags = match parts.next() {
            Some(flags) if flags.len() == 6 => flags,
            _ => continue,
        };
        if !flags.starts_with('V') {
            continue;
        }
        if let Some(name) = parts.next() {
            names.insert(name.to_string());
        }
    }

    debug!("ffmpeg exposes {} video encoders", names.len());
    Ok(names)
}

/// First render node under the DRI directory, sorted lexicographically.
fn discover_render_device(dri_dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(dri_dir).ok()?;
    let mut nodes: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with("renderD"))
        .collect();
    nodes.sort();
    nodes
        .first()
        .map(|name| format!("{}/{}", dri_dir.display(), name))
}
