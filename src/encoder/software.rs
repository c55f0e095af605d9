use crate::preset::Codec;

pub fn encode_args(codec: Codec, crf: u8) -> Vec<String> {
    match codec {
        Codec::Hevc => vec![
            "-c:v".into(),
            "libx265".into(),
            "-preset".into(),
            "medium".into(),
            "-crf".into(),
            crf.to_string(),
            "-tag:v".into(),
            "hvc1".into(),
        ],
        Codec::Av1 => vec![
            "-c:v".into(),
            "libsvtav1".into(),
            "-preset".into(),
            "8".into(),
            "-crf".into(),
            crf.to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x265_args() {
        let args = encode_args(Codec::Hevc, 26);
        assert!(args.windows(2).any(|w| w == ["-crf", "26"]));
        assert!(args.contains(&"libx265".to_string()));
    }

    #[test]
    fn test_svtav1_args() {
        let args = encode_args(Codec::Av1, 30);
        assert!(args.contains(&"libsvtav1".to_string()));
        assert!(!args.contains(&"-tag:v".to_string()));
    }
}
