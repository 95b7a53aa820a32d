use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::Dispatcher;

/// Shared application state injected into route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// The one dispatcher for the process; owns the registry and pipeline.
    pub dispatcher: Arc<Dispatcher>,
}
