//! API server state

use std::sync::Arc;
use std::time::Instant;

use crate::engine::Engine;

/// API server state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,

    /// Process start, reported by the health check
    pub started: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            started: Instant::now(),
        }
    }
}
