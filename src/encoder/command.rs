//! Builds the encoder invocation argv for a transcode.
//!
//! Output splits into pre-input args (decode/device init) and post-input
//! args (mapping, filters, quality, container handling). The transcoder
//! driver prepends its own generic flags and the input/output paths.

use crate::config::OutputFormat;
use crate::encoder::{nvenc, qsv, software, vaapi, videotoolbox, EncoderKind, EncoderRegistry};
use crate::preset::{
    self, default_crf, target_bitrate_kbps, Codec, Preset, QualityOverrides,
};

/// Tonemap parameters for HDR -> SDR conversion (PQ -> linear -> BT.709).
#[derive(Debug, Clone, Copy)]
pub struct TonemapParams {
    pub peak: f32,
    pub desat: f32,
}

impl Default for TonemapParams {
    fn default() -> Self {
        Self {
            peak: 100.0,
            desat: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct BuildInput<'a> {
    pub preset: &'a Preset,
    /// May differ from the preset's resolved encoder during fallback.
    pub encoder: EncoderKind,
    pub registry: &'a EncoderRegistry,
    pub overrides: &'a QualityOverrides,
    pub software_decode: bool,
    pub output_format: OutputFormat,
    pub source_bitrate_bps: u64,
    pub source_height: u32,
    pub is_hdr: bool,
    /// Some = tonemap to SDR (forces software decode, 8-bit output).
    pub tonemap: Option<TonemapParams>,
    /// MKV subtitle mapping: None = map all, empty = map none,
    /// non-empty = exactly these absolute stream indices.
    pub subtitle_indices: Option<&'a [i64]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandArgs {
    pub pre_input: Vec<String>,
    pub post_input: Vec<String>,
}

pub fn build(input: &BuildInput) -> CommandArgs {
    // Tonemapping runs in software filters, so it forces a software decode.
    let software_decode = input.software_decode || input.tonemap.is_some();
    let use_hwaccel = !software_decode;

    let pre_input = match input.encoder {
        EncoderKind::None => Vec::new(),
        EncoderKind::Videotoolbox => videotoolbox::decode_args(use_hwaccel),
        EncoderKind::Nvenc => nvenc::decode_args(input.registry.nvenc_init, use_hwaccel),
        EncoderKind::Qsv => qsv::decode_args(
            input.registry.qsv_init,
            input.registry.vaapi_device.as_deref(),
            use_hwaccel,
        ),
        EncoderKind::Vaapi => {
            vaapi::decode_args(input.registry.vaapi_device.as_deref(), use_hwaccel)
        }
    };

    // QSV and VAAPI keep decoded frames on the device; any software filter
    // step means frames start in system memory and need an upload.
    let hw_frames =
        matches!(input.encoder, EncoderKind::Qsv | EncoderKind::Vaapi) && !software_decode;

    let mut filters: Vec<String> = Vec::new();
    if let Some(tonemap) = input.tonemap {
        filters.push(format!(
            "zscale=t=linear:npl={},tonemap=tonemap=hable:desat={},zscale=p=bt709:t=bt709:m=bt709:r=tv,format=yuv420p",
            tonemap.peak, tonemap.desat
        ));
    }
    let scale_needed =
        input.preset.max_height > 0 && input.source_height > input.preset.max_height;
    if scale_needed {
        let filter = if hw_frames {
            match input.encoder {
                EncoderKind::Qsv => qsv::scale_filter(input.preset.max_height),
                _ => vaapi::scale_filter(input.preset.max_height),
            }
        } else {
            // -2 preserves aspect ratio and keeps the width even.
            format!("scale=-2:{}", input.preset.max_height)
        };
        filters.push(filter);
    }
    if matches!(input.encoder, EncoderKind::Qsv | EncoderKind::Vaapi) && !hw_frames {
        let upload = match input.encoder {
            EncoderKind::Qsv => qsv::UPLOAD_FILTER,
            _ => vaapi::UPLOAD_FILTER,
        };
        filters.push(upload.to_string());
    }

    let mut post_input: Vec<String> = Vec::new();

    // First video stream only: attached-picture cover art streams crash
    // some hardware encoders.
    post_input.extend(["-map".into(), "0:v:0".into()]);
    post_input.extend(["-map".into(), "0:a?".into()]);

    let codec = input.preset.codec;
    match input.output_format {
        OutputFormat::Mkv => match input.subtitle_indices {
            None => {
                post_input.extend(["-map".into(), "0:s?".into()]);
            }
            Some(indices) => {
                for index in indices {
                    post_input.extend(["-map".into(), format!("0:{}", index)]);
                }
            }
        },
        OutputFormat::Mp4 => {}
    }

    if !filters.is_empty() {
        post_input.extend(["-vf".into(), filters.join(",")]);
    }

    post_input.extend(match input.encoder {
        EncoderKind::None => software::encode_args(codec, resolve_crf(input)),
        EncoderKind::Nvenc => nvenc::encode_args(codec, resolve_crf(input)),
        EncoderKind::Qsv => qsv::encode_args(codec, resolve_crf(input)),
        EncoderKind::Vaapi => vaapi::encode_args(codec, resolve_crf(input)),
        EncoderKind::Videotoolbox => {
            let modifier = preset::resolve_modifier(codec, input.overrides);
            let kbps = target_bitrate_kbps(input.source_bitrate_bps, modifier, codec);
            videotoolbox::encode_args(codec, kbps)
        }
    });

    if input.is_hdr && input.tonemap.is_none() {
        post_input.extend(hdr_preserve_args(input.encoder, codec));
    }

    match input.output_format {
        OutputFormat::Mkv => {
            post_input.extend(["-c:a".into(), "copy".into()]);
            let map_subs = match input.subtitle_indices {
                None => true,
                Some(indices) => !indices.is_empty(),
            };
            if map_subs {
                post_input.extend(["-c:s".into(), "copy".into()]);
            }
        }
        OutputFormat::Mp4 => {
            post_input.extend([
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                "192k".into(),
                "-ac".into(),
                "2".into(),
                "-sn".into(),
                "-movflags".into(),
                "+faststart".into(),
            ]);
        }
    }

    CommandArgs {
        pre_input,
        post_input,
    }
}

fn resolve_crf(input: &BuildInput) -> u8 {
    input
        .overrides
        .crf_for(input.preset.codec)
        .unwrap_or_else(|| default_crf(input.encoder, input.preset.codec))
}

/// BT.2020/PQ metadata plus a 10-bit profile for HDR passthrough.
fn hdr_preserve_args(kind: EncoderKind, codec: Codec) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    match codec {
        Codec::Hevc => args.extend(["-profile:v".into(), "main10".into()]),
        Codec::Av1 => {
            if kind == EncoderKind::None {
                args.extend(["-pix_fmt".into(), "yuv420p10le".into()]);
            }
        }
    }
    args.extend([
        "-color_primaries".into(),
        "bt2020".into(),
        "-color_trc".into(),
        "smpte2084".into(),
        "-colorspace".into(),
        "bt2020nc".into(),
    ]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::Presets;

    fn presets_with(pairs: &[(EncoderKind, Codec)]) -> (EncoderRegistry, Presets) {
        let registry = EncoderRegistry::with_available(pairs);
        let presets = Presets::resolve(&registry);
        (registry, presets)
    }

    fn has_pair(args: &[String], a: &str, b: &str) -> bool {
        args.windows(2).any(|w| w[0] == a && w[1] == b)
    }

    #[test]
    fn test_videotoolbox_hevc_bitrate() {
        let (registry, presets) = presets_with(&[(EncoderKind::Videotoolbox, Codec::Hevc)]);
        let preset = presets.get("compress-hevc").unwrap();
        let overrides = QualityOverrides::default();
        let args = build(&BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 3_481_000,
            source_height: 1080,
            is_hdr: false,
            tonemap: None,
            subtitle_indices: None,
        });
        assert!(has_pair(&args.post_input, "-b:v", "1218k"));
        assert_eq!(args.pre_input, vec!["-hwaccel", "videotoolbox"]);
    }

    #[test]
    fn test_videotoolbox_av1_bitrate() {
        let (registry, presets) = presets_with(&[(EncoderKind::Videotoolbox, Codec::Av1)]);
        let preset = presets.get("compress-av1").unwrap();
        let overrides = QualityOverrides::default();
        let args = build(&BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 3_481_000,
            source_height: 1080,
            is_hdr: false,
            tonemap: None,
            subtitle_indices: None,
        });
        assert!(has_pair(&args.post_input, "-b:v", "870k"));
    }

    #[test]
    fn test_bitrate_clamp_low_and_high() {
        let (registry, presets) = presets_with(&[(EncoderKind::Videotoolbox, Codec::Hevc)]);
        let preset = presets.get("compress-hevc").unwrap();
        let overrides = QualityOverrides::default();
        let base = BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 500_000,
            source_height: 1080,
            is_hdr: false,
            tonemap: None,
            subtitle_indices: None,
        };
        let low = build(&base);
        assert!(has_pair(&low.post_input, "-b:v", "500k"));

        let high = build(&BuildInput {
            source_bitrate_bps: 50_000_000,
            ..base
        });
        assert!(has_pair(&high.post_input, "-b:v", "15000k"));
    }

    #[test]
    fn test_crf_encoder_ignores_bitrate() {
        let (registry, presets) = presets_with(&[]);
        let preset = presets.get("compress-hevc").unwrap();
        assert_eq!(preset.encoder, EncoderKind::None);
        let overrides = QualityOverrides::default();
        let args = build(&BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 3_481_000,
            source_height: 1080,
            is_hdr: false,
            tonemap: None,
            subtitle_indices: None,
        });
        assert!(has_pair(&args.post_input, "-crf", "26"));
        assert!(!args.post_input.contains(&"-b:v".to_string()));
        assert!(args.pre_input.is_empty());
    }

    #[test]
    fn test_mkv_subtitle_index_mapping() {
        let (registry, presets) = presets_with(&[]);
        let preset = presets.get("compress-hevc").unwrap();
        let overrides = QualityOverrides::default();
        let indices = [3i64];
        let args = build(&BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 0,
            source_height: 1080,
            is_hdr: false,
            tonemap: None,
            subtitle_indices: Some(&indices),
        });
        assert!(has_pair(&args.post_input, "-map", "0:3"));
        assert!(!has_pair(&args.post_input, "-map", "0:2"));
        assert!(has_pair(&args.post_input, "-c:s", "copy"));
    }

    #[test]
    fn test_mkv_empty_subtitle_list_maps_none() {
        let (registry, presets) = presets_with(&[]);
        let preset = presets.get("compress-hevc").unwrap();
        let overrides = QualityOverrides::default();
        let args = build(&BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 0,
            source_height: 1080,
            is_hdr: false,
            tonemap: None,
            subtitle_indices: Some(&[]),
        });
        assert!(!args.post_input.contains(&"-c:s".to_string()));
        assert!(!has_pair(&args.post_input, "-map", "0:s?"));
    }

    #[test]
    fn test_mkv_nil_subtitles_map_all() {
        let (registry, presets) = presets_with(&[]);
        let preset = presets.get("compress-hevc").unwrap();
        let overrides = QualityOverrides::default();
        let args = build(&BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 0,
            source_height: 1080,
            is_hdr: false,
            tonemap: None,
            subtitle_indices: None,
        });
        assert!(has_pair(&args.post_input, "-map", "0:s?"));
        assert!(has_pair(&args.post_input, "-c:s", "copy"));
    }

    #[test]
    fn test_mp4_transcodes_audio_and_strips_subs() {
        let (registry, presets) = presets_with(&[]);
        let preset = presets.get("compress-hevc").unwrap();
        let overrides = QualityOverrides::default();
        let args = build(&BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mp4,
            source_bitrate_bps: 0,
            source_height: 1080,
            is_hdr: false,
            tonemap: None,
            subtitle_indices: None,
        });
        assert!(has_pair(&args.post_input, "-c:a", "aac"));
        assert!(has_pair(&args.post_input, "-b:a", "192k"));
        assert!(args.post_input.contains(&"-sn".to_string()));
        assert!(!has_pair(&args.post_input, "-c:s", "copy"));
    }

    #[test]
    fn test_scale_filter_only_when_above_target() {
        let (registry, presets) = presets_with(&[]);
        let preset = presets.get("1080p").unwrap();
        let overrides = QualityOverrides::default();
        let base = BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 0,
            source_height: 2160,
            is_hdr: false,
            tonemap: None,
            subtitle_indices: None,
        };
        let scaled = build(&base);
        assert!(has_pair(&scaled.post_input, "-vf", "scale=-2:1080"));

        let untouched = build(&BuildInput {
            source_height: 1080,
            ..base
        });
        assert!(!untouched.post_input.contains(&"-vf".to_string()));
    }

    #[test]
    fn test_vaapi_software_decode_uploads() {
        let (registry_base, presets) = presets_with(&[(EncoderKind::Vaapi, Codec::Hevc)]);
        let mut registry = registry_base;
        registry.vaapi_device = Some("/dev/dri/renderD128".to_string());
        let preset = presets.get("compress-hevc").unwrap();
        let overrides = QualityOverrides::default();
        let args = build(&BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: true,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 0,
            source_height: 1080,
            is_hdr: false,
            tonemap: None,
            subtitle_indices: None,
        });
        assert!(!args.pre_input.contains(&"-hwaccel".to_string()));
        let vf = args
            .post_input
            .windows(2)
            .find(|w| w[0] == "-vf")
            .map(|w| w[1].clone())
            .unwrap();
        assert!(vf.contains("hwupload"));
    }

    #[test]
    fn test_tonemap_forces_software_decode_and_filter() {
        let (registry, presets) = presets_with(&[(EncoderKind::Videotoolbox, Codec::Hevc)]);
        let preset = presets.get("compress-hevc").unwrap();
        let overrides = QualityOverrides::default();
        let args = build(&BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 0,
            source_height: 1080,
            is_hdr: true,
            tonemap: Some(TonemapParams::default()),
            subtitle_indices: None,
        });
        assert!(args.pre_input.is_empty(), "tonemap must disable hwaccel");
        let vf = args
            .post_input
            .windows(2)
            .find(|w| w[0] == "-vf")
            .map(|w| w[1].clone())
            .unwrap();
        assert!(vf.contains("tonemap=tonemap=hable"));
        assert!(vf.contains("zscale=t=linear"));
        // SDR output: no HDR passthrough metadata.
        assert!(!args.post_input.contains(&"-color_trc".to_string()));
    }

    #[test]
    fn test_hdr_preserve_metadata() {
        let (registry, presets) = presets_with(&[]);
        let preset = presets.get("compress-hevc").unwrap();
        let overrides = QualityOverrides::default();
        let args = build(&BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 0,
            source_height: 2160,
            is_hdr: true,
            tonemap: None,
            subtitle_indices: None,
        });
        assert!(has_pair(&args.post_input, "-profile:v", "main10"));
        assert!(has_pair(&args.post_input, "-color_trc", "smpte2084"));
        assert!(has_pair(&args.post_input, "-color_primaries", "bt2020"));
    }

    #[test]
    fn test_first_video_stream_only() {
        let (registry, presets) = presets_with(&[]);
        let preset = presets.get("compress-hevc").unwrap();
        let overrides = QualityOverrides::default();
        let args = build(&BuildInput {
            preset,
            encoder: preset.encoder,
            registry: &registry,
            overrides: &overrides,
            software_decode: false,
            output_format: OutputFormat::Mkv,
            source_bitrate_bps: 0,
            source_height: 1080,
            is_hdr: false,
            tonemap: None,
            subtitle_indices: None,
        });
        assert!(has_pair(&args.post_input, "-map", "0:v:0"));
        assert!(has_pair(&args.post_input, "-map", "0:a?"));
    }
}
