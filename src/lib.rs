// Library exports for the UNet segmentation gateway

pub mod api;
pub mod core;
pub mod orchestration;
pub mod phases;
pub mod services;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{ConfigError, PipelineError, SegmentationError, StorageError},
    types::{BatchResult, Candidate, InferenceParameters, ProcessOutcome},
};

pub use orchestration::batch_orchestrator::BatchOrchestrator;

pub use services::{LazyModel, LocalStorage, Storage};

pub use utils::Metrics;
