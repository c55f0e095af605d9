use crate::media::probe::SubtitleStream;

/// Subtitle codecs the MKV container can carry. Everything else (mov_text,
/// tx3g, eia_608, ttml, dvb_teletext, xsub, ...) crashes or corrupts the mux
/// and must be dropped before argv construction.
const MKV_COMPATIBLE: &[&str] = &[
    "subrip",
    "srt",
    "ass",
    "ssa",
    "text",
    "dvd_subtitle",
    "dvdsub",
    "dvb_subtitle",
    "dvbsub",
    "hdmv_pgs_subtitle",
    "pgssub",
    "hdmv_text_subtitle",
    "arib_caption",
    "webvtt",
];

/// Result of filtering probed subtitle streams against MKV compatibility.
///
/// `compatible: None` means no subtitle streams were probed at all and the
/// mapping should fall back to "map all". `Some(vec![])` means every stream
/// was incompatible and none should be mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleFilter {
    pub compatible: Option<Vec<i64>>,
    pub dropped: Vec<String>,
}

pub fn is_mkv_compatible(codec_name: &str) -> bool {
    let codec = codec_name.trim().to_ascii_lowercase();
    MKV_COMPATIBLE.contains(&codec.as_str())
}

/// Filter probed subtitle streams down to the absolute stream indices that
/// can be copied into an MKV output. Dropped codec names are collected once
/// each, in first-seen order, for logging.
pub fn filter_for_mkv(streams: Option<&[SubtitleStream]>) -> SubtitleFilter {
    let Some(streams) = streams else {
        return SubtitleFilter {
            compatible: None,
            dropped: Vec::new(),
        };
    };

    let mut compatible = Vec::new();
    let mut dropped: Vec<String> = Vec::new();

    for stream in streams {
        if is_mkv_compatible(&stream.codec_name) {
            compatible.push(stream.index);
        } else if !dropped.iter().any(|d| d == &stream.codec_name) {
            dropped.push(stream.codec_name.clone());
        }
    }

    SubtitleFilter {
        compatible: Some(compatible),
        dropped,
    }
}
