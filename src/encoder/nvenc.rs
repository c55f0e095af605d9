use crate::encoder::NvencInitMode;
use crate::preset::Codec;

/// Device init args, before any `-hwaccel` flags.
pub fn device_args(mode: NvencInitMode) -> Vec<String> {
    match mode {
        NvencInitMode::Simple => Vec::new(),
        NvencInitMode::Explicit => vec!["-init_hw_device".into(), "cuda=cu:0".into()],
    }
}

/// Hardware decode flags. NVENC decodes to system memory here so software
/// filters keep working downstream.
pub fn decode_args(mode: NvencInitMode, use_hwaccel: bool) -> Vec<String> {
    let mut args = device_args(mode);
    if use_hwaccel {
        args.extend(["-hwaccel".into(), "cuda".into()]);
        if mode == NvencInitMode::Explicit {
            args.extend(["-hwaccel_device".into(), "cu".into()]);
        }
    }
    args
}

pub fn encode_args(codec: Codec, cq: u8) -> Vec<String> {
    vec![
        "-c:v".into(),
        super::encoder_name(super::EncoderKind::Nvenc, codec).into(),
        "-preset".into(),
        "p4".into(),
        "-cq".into(),
        cq.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_mode_has_no_device_init() {
        assert!(device_args(NvencInitMode::Simple).is_empty());
        let args = decode_args(NvencInitMode::Simple, true);
        assert_eq!(args, vec!["-hwaccel", "cuda"]);
    }

    #[test]
    fn test_explicit_mode_inits_cuda_device() {
        let args = decode_args(NvencInitMode::Explicit, true);
        assert_eq!(
            args,
            vec![
                "-init_hw_device",
                "cuda=cu:0",
                "-hwaccel",
                "cuda",
                "-hwaccel_device",
                "cu"
            ]
        );
    }

    #[test]
    fn test_software_decode_omits_hwaccel() {
        assert!(decode_args(NvencInitMode::Simple, false).is_empty());
    }

    #[test]
    fn test_encode_args() {
        let args = encode_args(Codec::Hevc, 27);
        assert_eq!(args, vec!["-c:v", "hevc_nvenc", "-preset", "p4", "-cq", "27"]);
    }
}
