use std::sync::Arc;

use crate::geocode::{BatchOptions, Overrides, ResolutionEngine};

pub struct AppState {
    pub engine: Arc<ResolutionEngine>,
    pub overrides: Arc<Overrides>,
    pub batch: BatchOptions,
}
