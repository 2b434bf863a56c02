mod settings;

pub use crate::ratelimit::BucketConfig;
pub use settings::{LogConfig, Settings};
