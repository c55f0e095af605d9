use crate::encoder::QsvInitMode;
use crate::preset::Codec;

/// Filter step that moves system-memory frames onto the QSV device.
pub const UPLOAD_FILTER: &str = "format=nv12,hwupload=extra_hw_frames=64";

/// Device init args. Direct init works on most hosts; some Linux drivers
/// only expose QSV through a VAAPI-derived device.
pub fn device_args(mode: QsvInitMode, vaapi_device: Option<&str>) -> Vec<String> {
    match mode {
        QsvInitMode::Direct => vec![
            "-init_hw_device".into(),
            "qsv=hw".into(),
            "-filter_hw_device".into(),
            "hw".into(),
        ],
        QsvInitMode::VaapiDerived => {
            let device = vaapi_device.unwrap_or("/dev/dri/renderD128");
            vec![
                "-init_hw_device".into(),
                format!("vaapi=va:{}", device),
                "-init_hw_device".into(),
                "qsv=hw@va".into(),
                "-filter_hw_device".into(),
                "hw".into(),
            ]
        }
    }
}

pub fn decode_args(mode: QsvInitMode, vaapi_device: Option<&str>, use_hwaccel: bool) -> Vec<String> {
    let mut args = device_args(mode, vaapi_device);
    if use_hwaccel {
        args.extend([
            "-hwaccel".into(),
            "qsv".into(),
            "-hwaccel_output_format".into(),
            "qsv".into(),
        ]);
    }
    args
}

pub fn encode_args(codec: Codec, global_quality: u8) -> Vec<String> {
    vec![
        "-c:v".into(),
        super::encoder_name(super::EncoderKind::Qsv, codec).into(),
        "-global_quality".into(),
        global_quality.to_string(),
        "-look_ahead".into(),
        "1".into(),
    ]
}

/// Hardware scale filter for frames already on the QSV device.
pub fn scale_filter(max_height: u32) -> String {
    format!("vpp_qsv=w=-2:h={}", max_height)
}
