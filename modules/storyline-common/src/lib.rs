pub mod types;
pub mod config;
pub mod file_config;
pub mod error;

pub use types::*;
pub use config::{AppConfig, LogFormat};
pub use file_config::{
    load_config, ClusteringConfig, DiscriminatorRule, SchedulerConfig, TrackWeights,
};
pub use error::StorylineError;
