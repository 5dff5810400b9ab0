pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{ConfigError, PipelineError, SegmentationError, StorageError};
pub use types::{
    BatchResult, Candidate, CandidateSource, FailureReason, InferenceOutcome,
    InferenceParameters, Ingestion, ProcessOutcome,
};
