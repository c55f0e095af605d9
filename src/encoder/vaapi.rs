use crate::preset::Codec;

/// Filter step that moves system-memory frames onto the VAAPI device.
pub const UPLOAD_FILTER: &str = "format=nv12,hwupload";

pub fn device_args(device: Option<&str>) -> Vec<String> {
    let device = device.unwrap_or("/dev/dri/renderD128");
    vec![
        "-init_hw_device".into(),
        format!("vaapi=va:{}", device),
        "-filter_hw_device".into(),
        "va".into(),
    ]
}

pub fn decode_args(device: Option<&str>, use_hwaccel: bool) -> Vec<String> {
    let mut args = device_args(device);
    if use_hwaccel {
        args.extend([
            "-hwaccel".into(),
            "vaapi".into(),
            "-hwaccel_output_format".into(),
            "vaapi".into(),
        ]);
    }
    args
}

pub fn encode_args(codec: Codec, qp: u8) -> Vec<String> {
    vec![
        "-c:v".into(),
        super::encoder_name(super::EncoderKind::Vaapi, codec).into(),
        "-qp".into(),
        qp.to_string(),
    ]
}

/// Hardware scale filter for frames already on the VAAPI device.
pub fn scale_filter(max_height: u32) -> String {
    format!("scale_vaapi=w=-2:h={}", max_height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_args_use_discovered_node() {
        let args = device_args(Some("/dev/dri/renderD129"));
        assert_eq!(args[1], "vaapi=va:/dev/dri/renderD129");
    }

    #[test]
    fn test_software_decode_keeps_device_init() {
        let args = decode_args(Some("/dev/dri/renderD128"), false);
        assert!(args.contains(&"-init_hw_device".to_string()));
        assert!(!args.contains(&"-hwaccel".to_string()));
    }

    #[test]
    fn test_encode_args() {
        assert_eq!(encode_args(Codec::Hevc, 25), vec!["-c:v", "hevc_vaapi", "-qp", "25"]);
    }
}
