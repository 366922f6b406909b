pub mod app_config;

pub use app_config::{CanaryConfig, QueryProbeSet, TargetConfig, load_config};
