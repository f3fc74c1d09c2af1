pub mod aggregator;
pub mod allocation;
pub mod clock;
pub mod config;
pub mod lifecycle;
pub mod results;
pub mod stats;
pub mod store;
pub mod winner;

pub use lifecycle::ExperimentManager;
pub use store::{ExperimentRepository, ExperimentStore};
