//! Preset table and quality parameter math.
//!
//! Presets are a finite enumerated set; each resolves to the best available
//! hardware encoder at startup. Quality parameters split into two families:
//! CRF-style integer flags, and VideoToolbox's bitrate-modifier math.

use crate::encoder::{EncoderKind, EncoderRegistry};
use serde::{Deserialize, Serialize};

/// Target video codec
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Hevc,
    Av1,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hevc => "hevc",
            Self::Av1 => "av1",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresetId {
    CompressHevc,
    CompressAv1,
    Scale1080p,
    Scale720p,
    SmartShrinkHevc,
    SmartShrinkAv1,
}

impl PresetId {
    pub const ALL: [PresetId; 6] = [
        PresetId::CompressHevc,
        PresetId::CompressAv1,
        PresetId::Scale1080p,
        PresetId::Scale720p,
        PresetId::SmartShrinkHevc,
        PresetId::SmartShrinkAv1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CompressHevc => "compress-hevc",
            Self::CompressAv1 => "compress-av1",
            Self::Scale1080p => "1080p",
            Self::Scale720p => "720p",
            Self::SmartShrinkHevc => "smartshrink-hevc",
            Self::SmartShrinkAv1 => "smartshrink-av1",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == s)
    }
}

impl std::fmt::Display for PresetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A preset with its encoder resolved against the host capability table.
#[derive(Debug, Clone, Copy)]
pub struct Preset {
    pub id: PresetId,
    pub codec: Codec,
    /// 0 = no scaling.
    pub max_height: u32,
    pub is_smartshrink: bool,
    pub encoder: EncoderKind,
}

impl Preset {
    fn descriptor(id: PresetId) -> (Codec, u32, bool) {
        match id {
            PresetId::CompressHevc => (Codec::Hevc, 0, false),
            PresetId::CompressAv1 => (Codec::Av1, 0, false),
            PresetId::Scale1080p => (Codec::Hevc, 1080, false),
            PresetId::Scale720p => (Codec::Hevc, 720, false),
            PresetId::SmartShrinkHevc => (Codec::Hevc, 0, true),
            PresetId::SmartShrinkAv1 => (Codec::Av1, 0, true),
        }
    }
}

/// The full preset set, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Presets {
    presets: Vec<Preset>,
}

impl Presets {
    pub fn resolve(registry: &EncoderRegistry) -> Self {
        let presets = PresetId::ALL
            .into_iter()
            .map(|id| {
                let (codec, max_height, is_smartshrink) = Preset::descriptor(id);
                Preset {
                    id,
                    codec,
                    max_height,
                    is_smartshrink,
                    encoder: registry.best_for_codec(codec),
                }
            })
            .collect();
        Self { presets }
    }

    pub fn get(&self, id: &str) -> Option<&Preset> {
        let id = PresetId::parse(id)?;
        self.presets.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Preset> {
        self.presets.iter()
    }
}

/// User quality overrides from configuration, applied over encoder defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityOverrides {
    pub hevc_crf: Option<u8>,
    pub av1_crf: Option<u8>,
    pub videotoolbox_modifier: Option<f64>,
}

impl QualityOverrides {
    pub fn crf_for(&self, codec: Codec) -> Option<u8> {
        match codec {
            Codec::Hevc => self.hevc_crf,
            Codec::Av1 => self.av1_crf,
        }
    }
}

/// Default integer quality per (encoder, codec). Lower = higher quality.
pub fn default_crf(encoder: EncoderKind, codec: Codec) -> u8 {
    match (encoder, codec) {
        (EncoderKind::None, Codec::Hevc) => 26,
        (EncoderKind::None, Codec::Av1) => 30,
        (EncoderKind::Nvenc, Codec::Hevc) => 27,
        (EncoderKind::Nvenc, Codec::Av1) => 32,
        (EncoderKind::Qsv, Codec::Hevc) => 25,
        (EncoderKind::Qsv, Codec::Av1) => 28,
        (EncoderKind::Vaapi, Codec::Hevc) => 25,
        (EncoderKind::Vaapi, Codec::Av1) => 30,
        // VideoToolbox is bitrate-driven; this only seeds the modifier map.
        (EncoderKind::Videotoolbox, _) => 0,
    }
}

/// Quality search range per (encoder, codec): (best, worst) CRF.
pub fn crf_range(encoder: EncoderKind, codec: Codec) -> (u8, u8) {
    match (encoder, codec) {
        (EncoderKind::None, Codec::Hevc) => (18, 32),
        (EncoderKind::None, Codec::Av1) => (22, 40),
        (EncoderKind::Nvenc, Codec::Hevc) => (20, 34),
        (EncoderKind::Nvenc, Codec::Av1) => (24, 40),
        (EncoderKind::Qsv, Codec::Hevc) => (18, 32),
        (EncoderKind::Qsv, Codec::Av1) => (22, 38),
        (EncoderKind::Vaapi, Codec::Hevc) => (18, 32),
        (EncoderKind::Vaapi, Codec::Av1) => (24, 40),
        (EncoderKind::Videotoolbox, _) => (0, 0),
    }
}

/// VideoToolbox bitrate-modifier bounds per codec: (mod_min, mod_max).
pub fn modifier_range(codec: Codec) -> (f64, f64) {
    match codec {
        Codec::Hevc => (0.10, 0.60),
        Codec::Av1 => (0.10, 0.50),
    }
}

pub fn default_modifier(codec: Codec) -> f64 {
    match codec {
        Codec::Hevc => 0.35,
        Codec::Av1 => 0.25,
    }
}

const MOD_FLOOR: f64 = 0.05;
const MOD_CEIL: f64 = 0.80;
const BITRATE_FLOOR_KBPS: f64 = 500.0;
const BITRATE_CEIL_KBPS: f64 = 15_000.0;
const UNKNOWN_SOURCE_KBPS: f64 = 10_000.0;

/// Empirical CRF → bitrate-modifier mapping for bitrate-driven encoders.
/// Monotonically nonincreasing, clamped to [0.05, 0.80].
pub fn crf_to_modifier(crf: u8) -> f64 {
    (0.80 - 0.02 * crf as f64).clamp(MOD_FLOOR, MOD_CEIL)
}

/// Resolve the effective VideoToolbox modifier from overrides.
pub fn resolve_modifier(codec: Codec, overrides: &QualityOverrides) -> f64 {
    if let Some(modifier) = overrides.videotoolbox_modifier {
        modifier
    } else if let Some(crf) = overrides.crf_for(codec) {
        crf_to_modifier(crf)
    } else {
        default_modifier(codec)
    }
}

/// Target bitrate in kbps: source bitrate scaled by the modifier (further
/// clamped into the per-codec modifier bounds), bounded to [500, 15000].
/// An unknown source bitrate uses a 10 000 kbps reference.
pub fn target_bitrate_kbps(source_bitrate_bps: u64, modifier: f64, codec: Codec) -> u64 {
    let (mod_min, mod_max) = modifier_range(codec);
    let modifier = modifier.clamp(mod_min, mod_max);
    let source_kbps = if source_bitrate_bps > 0 {
        source_bitrate_bps as f64 / 1000.0
    } else {
        UNKNOWN_SOURCE_KBPS
    };
    (source_kbps * modifier)
        .round()
        .clamp(BITRATE_FLOOR_KBPS, BITRATE_CEIL_KBPS) as u64
}
