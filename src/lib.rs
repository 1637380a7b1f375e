pub mod config;
pub mod pipeline;

use tracing_subscriber::EnvFilter;

/// Initialize tracing for binaries and harnesses embedding the pipeline.
/// Library callers that manage their own subscriber should skip this.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("clinex v{}", config::APP_VERSION);
}
