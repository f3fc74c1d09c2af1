//! Campaign A/B experiments: variant allocation, funnel counters, chi-square
//! significance and a race-free lifecycle with winner declaration.

pub mod error;
pub mod experiments;

pub use error::{ExperimentError, Result};
pub use experiments::clock::{Clock, ManualClock, SystemClock};
pub use experiments::config::{
    EventKind, Experiment, ExperimentPatch, ExperimentStatus, Metric, NewExperiment, Winner,
};
pub use experiments::lifecycle::{ExperimentManager, ListQuery};
pub use experiments::store::{ExperimentFilter, ExperimentRepository, ExperimentStore};
pub use experiments::winner::{WinnerPublisher, WinningContent};
