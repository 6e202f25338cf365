//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::pipeline::Processor;

/// Read-only state handed to every request; nothing in it is mutated.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<Processor>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            processor: Arc::new(Processor::new(Arc::new(config))),
        }
    }

    pub fn config(&self) -> &Config {
        self.processor.config()
    }
}
