use crate::schedule::ScheduleConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub smartshrink: SmartShrinkConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Output container selection
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mkv,
    Mp4,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mkv => "mkv",
            Self::Mp4 => "mp4",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// SmartShrink quality tier; maps to the minimum acceptable VMAF score.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Acceptable,
    #[default]
    Good,
    Excellent,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acceptable => "acceptable",
            Self::Good => "good",
            Self::Excellent => "excellent",
        }
    }

    pub fn min_vmaf(&self) -> f64 {
        match self {
            Self::Acceptable => 85.0,
            Self::Good => 90.0,
            Self::Excellent => 94.0,
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TranscodeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Replace the source file on success; false keeps it as `<path>.old`.
    #[serde(default = "default_true")]
    pub replace_original: bool,
    #[serde(default)]
    pub keep_larger_files: bool,
    /// Enqueue files already in the target codec instead of skipping them.
    #[serde(default)]
    pub allow_same_codec: bool,
    #[serde(default = "default_true")]
    pub tonemap_hdr: bool,
    pub hevc_crf: Option<u8>,
    pub av1_crf: Option<u8>,
    pub videotoolbox_modifier: Option<f64>,
}

fn default_workers() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            output_format: OutputFormat::Mkv,
            replace_original: true,
            keep_larger_files: false,
            allow_same_codec: false,
            tonemap_hdr: true,
            hevc_crf: None,
            av1_crf: None,
            videotoolbox_modifier: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SmartShrinkConfig {
    /// Concurrent VMAF analysis slots, independent of the worker count.
    #[serde(default = "default_slots")]
    pub slots: usize,
    #[serde(default)]
    pub quality: QualityTier,
}

fn default_slots() -> usize {
    (num_cpus::get() / 4).clamp(1, 3)
}

impl Default for SmartShrinkConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            quality: QualityTier::Good,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.transcode.workers == 0 || self.transcode.workers > 6 {
            anyhow::bail!(
                "workers must be between 1 and 6, got {}",
                self.transcode.workers
            );
        }

        if self.smartshrink.slots == 0 || self.smartshrink.slots > 3 {
            anyhow::bail!(
                "smartshrink slots must be between 1 and 3, got {}",
                self.smartshrink.slots
            );
        }

        if let Some(modifier) = self.transcode.videotoolbox_modifier {
            if !(0.05..=0.80).contains(&modifier) {
                anyhow::bail!(
                    "videotoolbox_modifier must be between 0.05 and 0.80, got {}",
                    modifier
                );
            }
        }

        if self.schedule.start_hour > 23 || self.schedule.end_hour > 23 {
            anyhow::bail!(
                "schedule hours must be between 0 and 23, got {}-{}",
                self.schedule.start_hour,
                self.schedule.end_hour
            );
        }

        Ok(())
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
