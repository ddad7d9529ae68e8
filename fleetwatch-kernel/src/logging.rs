use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_FILTER: &str = "fleetwatch_kernel=info";

/// RUST_LOG prioritaire sur le filtre par défaut ; un second appel est sans effet
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
