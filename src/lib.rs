pub mod config;
pub mod encoder;
pub mod error;
pub mod media;
pub mod pool;
pub mod preset;
pub mod queue;
pub mod schedule;
pub mod smartshrink;
pub mod store;
pub mod transcode;

pub use config::Config;
pub use encoder::{EncoderKind, EncoderRegistry};
pub use error::{Result, ShrinkrayError};
pub use pool::WorkerPool;
pub use preset::{Codec, Preset, Presets};
pub use queue::{Queue, QueueEvent};
pub use smartshrink::SmartShrink;
pub use store::{Job, JobStatus, Store};
