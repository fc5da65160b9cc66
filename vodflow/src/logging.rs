//! Logging bootstrap with a runtime-reloadable filter.

use tracing::info;
use tracing_subscriber::{
    EnvFilter,
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "vodflow=info,fetch_engine=info,sqlx=warn";

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the installed logging stack.
pub struct Logging {
    handle: FilterHandle,
}

impl Logging {
    /// Install the global subscriber: env-derived filter (falling back to
    /// [`DEFAULT_LOG_FILTER`]) behind a reload layer, plus a compact fmt
    /// layer with targets.
    pub fn init() -> crate::Result<Self> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        let (filter_layer, handle) = reload::Layer::new(filter);

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(true),
            )
            .try_init()
            .map_err(|e| crate::Error::Other(format!("Failed to install subscriber: {e}")))?;

        Ok(Self { handle })
    }

    /// Current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive at runtime.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| crate::Error::Other(format!("Invalid filter directive: {e}")))?;
        self.handle
            .reload(new_filter)
            .map_err(|e| crate::Error::Other(format!("Failed to reload filter: {e}")))?;
        info!(directive = %directive, "Log filter updated");
        Ok(())
    }
}
