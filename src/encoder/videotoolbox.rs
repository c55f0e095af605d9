use crate::preset::Codec;

pub fn decode_args(use_hwaccel: bool) -> Vec<String> {
    if use_hwaccel {
        vec!["-hwaccel".into(), "videotoolbox".into()]
    } else {
        Vec::new()
    }
}

/// VideoToolbox is bitrate-driven; the target comes out of the modifier
/// math in `preset`, already clamped to kbps bounds.
pub fn encode_args(codec: Codec, bitrate_kbps: u64) -> Vec<String> {
    let mut args = vec![
        "-c:v".into(),
        super::encoder_name(super::EncoderKind::Videotoolbox, codec).into(),
        "-b:v".into(),
        format!("{}k", bitrate_kbps),
    ];
    if codec == Codec::Hevc {
        args.extend(["-tag:v".into(), "hvc1".into()]);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_args_carry_bitrate() {
        let args = encode_args(Codec::Hevc, 1218);
        assert_eq!(
            args,
            vec!["-c:v", "hevc_videotoolbox", "-b:v", "1218k", "-tag:v", "hvc1"]
        );
    }

    #[test]
    fn test_av1_has_no_hvc1_tag() {
        let args = encode_args(Codec::Av1, 870);
        assert_eq!(args, vec!["-c:v", "av1_videotoolbox", "-b:v", "870k"]);
    }
}
