use std::sync::Arc;

use crate::config::Config;
use crate::observability::Metrics;
use crate::processor::ProcessorKick;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub metrics: Arc<Metrics>,
    /// Wakes the processor after a job is enqueued.
    pub kick: ProcessorKick,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        metrics: Arc<Metrics>,
        kick: ProcessorKick,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
            kick,
        }
    }
}
