pub mod events;
pub mod log;
pub mod metrics;

pub use events::{EventReceiver, EventSender, RuntimeEvent, emit, event_bus};
pub use log::LogObserver;
pub use metrics::{MetricsSnapshot, ProcessorMetrics};

use crate::config::ObservabilityConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global `tracing` subscriber at the configured level.
pub fn init_logging(config: &ObservabilityConfig) -> anyhow::Result<()> {
    let level = Level::from_str(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("setting default subscriber failed: {e}"))
}
