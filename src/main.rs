use std::sync::Arc;

mod config;
mod error;
mod exporter;
mod http_probe;
mod metrics;
mod pyroscope;

use exporter::CanaryExporter;
use metrics::CanaryMetrics;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match config::load_config() {
        Ok(config) => config,
        Err(err) => {
            log::error!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    let metrics = match CanaryMetrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(err) => {
            log::error!("failed to register metrics: {err}");
            std::process::exit(1);
        }
    };

    let exporter = match CanaryExporter::new(config, metrics) {
        Ok(exporter) => Arc::new(exporter),
        Err(err) => {
            log::error!("failed to set up the canary exporter: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = exporter.run().await {
        log::error!("canary exporter terminated: {err}");
        std::process::exit(1);
    }
}
