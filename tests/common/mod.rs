#![allow(dead_code)]

use shrinkray::encoder::EncoderRegistry;
use shrinkray::media::probe::ProbeResult;
use shrinkray::preset::Presets;
use shrinkray::queue::Queue;
use shrinkray::store::{next_job_id, Job, Store};
use std::path::PathBuf;
use std::sync::Arc;

pub fn probe(name: &str, codec: &str, height: u32) -> ProbeResult {
    ProbeResult {
        path: PathBuf::from(format!("/media/{}", name)),
        size: 2_000_000_000,
        duration_secs: 5400.0,
        format: "matroska,webm".to_string(),
        video_codec: codec.to_string(),
        audio_codec: Some("ac3".to_string()),
        width: height * 16 / 9,
        height,
        bitrate_bps: 3_481_000,
        frame_rate: 23.976,
        profile: "Main".to_string(),
        pix_fmt: "yuv420p".to_string(),
        bit_depth: 8,
        color_transfer: "bt709".to_string(),
        color_primaries: "bt709".to_string(),
        color_space: "bt709".to_string(),
        is_hdr: false,
    }
}

pub fn software_presets() -> Arc<Presets> {
    Arc::new(Presets::resolve(&EncoderRegistry::software_only()))
}

pub async fn open_queue(dir: &std::path::Path) -> (Arc<Store>, Queue) {
    let store = Arc::new(Store::open(dir).await.expect("open store"));
    let queue = Queue::new(store.clone(), software_presets(), false);
    (store, queue)
}

pub fn pending_job(name: &str) -> Job {
    let presets = software_presets();
    let preset = presets.get("compress-hevc").expect("preset");
    Job::from_probe(next_job_id(), &probe(name, "h264", 1080), preset)
}
