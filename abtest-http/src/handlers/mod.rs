use abtest::ExperimentManager;
use std::sync::Arc;

pub mod experiments;
pub mod health;

pub struct AppState {
    pub manager: Arc<ExperimentManager>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(manager: ExperimentManager) -> Self {
        Self {
            manager: Arc::new(manager),
            start_time: std::time::Instant::now(),
        }
    }
}
