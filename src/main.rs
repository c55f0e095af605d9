use clap::Parser;
use shrinkray::config::Config;
use shrinkray::encoder::EncoderRegistry;
use shrinkray::error::Result;
use shrinkray::pool::{CacheInvalidator, PoolSettings, WorkerPool};
use shrinkray::preset::{Presets, QualityOverrides};
use shrinkray::queue::Queue;
use shrinkray::smartshrink::SmartShrink;
use shrinkray::store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Directory holding the job database
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,

    /// Override the configured worker count
    #[arg(short, long)]
    workers: Option<usize>,

    /// Skip the hardware encoder probe and use software encoding only
    #[arg(long)]
    no_hardware: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load {:?}: {}. Using defaults.", args.config, e);
            Config::default()
        }
    };

    info!("shrinkray {}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!(
        "  Workers: {}",
        args.workers.unwrap_or(config.transcode.workers)
    );
    info!("  Output: {}", config.transcode.output_format);
    info!(
        "  Replace originals: {}",
        if config.transcode.replace_original {
            "yes"
        } else {
            "keep as .old"
        }
    );
    info!("  Schedule: {}", config.schedule.format_schedule());
    info!("  SmartShrink slots: {}", config.smartshrink.slots);

    // Opening the store runs crash recovery, so it must finish before any
    // worker can claim a job.
    let store = Arc::new(Store::open(&args.data_dir).await?);

    let registry = if args.no_hardware {
        info!("Hardware probe disabled; software encoding only");
        Arc::new(EncoderRegistry::software_only())
    } else {
        info!("Probing hardware encoders...");
        Arc::new(EncoderRegistry::detect().await?)
    };

    let presets = Arc::new(Presets::resolve(&registry));
    for preset in presets.iter() {
        info!("  Preset {} -> {}", preset.id, preset.encoder);
    }

    let queue = Arc::new(Queue::new(
        store.clone(),
        presets.clone(),
        config.transcode.allow_same_codec,
    ));
    let smartshrink = Arc::new(SmartShrink::new(config.smartshrink.slots));

    let settings = PoolSettings {
        output_format: config.transcode.output_format,
        replace_original: config.transcode.replace_original,
        keep_larger_files: config.transcode.keep_larger_files,
        tonemap_hdr: config.transcode.tonemap_hdr,
        overrides: QualityOverrides {
            hevc_crf: config.transcode.hevc_crf,
            av1_crf: config.transcode.av1_crf,
            videotoolbox_modifier: config.transcode.videotoolbox_modifier,
        },
        tier: config.smartshrink.quality,
        schedule: config.schedule.clone(),
    };

    // The HTTP layer plugs its cache invalidation in here; the service on
    // its own has nothing to invalidate.
    let invalidate: CacheInvalidator = Arc::new(|_path| {});

    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        registry,
        presets,
        smartshrink,
        settings,
        invalidate,
    ));
    pool.start(args.workers.unwrap_or(config.transcode.workers))
        .await;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down; in-flight jobs resume on next start");
    pool.shutdown().await;

    Ok(())
}
