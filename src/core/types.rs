// Shared request, candidate and outcome types

use serde::Serialize;

use crate::core::errors::{PipelineError, PipelineResult};

pub const DEFAULT_SCALE_FACTOR: f32 = 1.0;
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Where a candidate image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Upload,
    DatasetRef,
    ArchiveEntry,
}

/// One image awaiting inference, paired with its provenance
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub bytes: Vec<u8>,
    pub source: CandidateSource,
}

impl Candidate {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, source: CandidateSource) -> Self {
        Self {
            name: name.into(),
            bytes,
            source,
        }
    }
}

/// Per-request inference knobs, shared read-only by every candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParameters {
    pub scale_factor: f32,
    pub threshold: f32,
}

impl InferenceParameters {
    pub fn new(scale_factor: f32, threshold: f32) -> PipelineResult<Self> {
        if !scale_factor.is_finite() || scale_factor <= 0.0 {
            return Err(PipelineError::InvalidParameter(format!(
                "scale_factor must be a positive number, got {}",
                scale_factor
            )));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::InvalidParameter(format!(
                "threshold must be in [0.0, 1.0], got {}",
                threshold
            )));
        }
        Ok(Self {
            scale_factor,
            threshold,
        })
    }
}

impl Default for InferenceParameters {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Raw fields pulled out of the multipart form
#[derive(Debug, Clone, Default)]
pub struct PredictForm {
    pub file: Option<UploadedFile>,
    pub dataset_path: Option<String>,
    pub scale_factor: Option<String>,
    pub threshold: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Input shape of a request, decided once by the ingestion phase
#[derive(Debug)]
pub enum Ingestion {
    Single(Candidate),
    Batch {
        archive_name: String,
        archive_bytes: Vec<u8>,
    },
}

/// Why a single batch item did not produce a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Unreadable,
    InvalidImage,
    Decode,
    Inference,
    Encode,
    Publish,
    Internal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub candidate_name: String,
    pub reason: FailureReason,
}

/// Outcome of one candidate's validate → infer → publish cycle
#[derive(Debug, Clone)]
pub enum InferenceOutcome {
    Success { result_url: String },
    Failure(ItemFailure),
}

/// Aggregated batch outcome
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub result_urls: Vec<String>,
    pub success_count: usize,
    pub failure_count: usize,
    pub failures: Vec<ItemFailure>,
}

impl BatchResult {
    pub fn record(&mut self, outcome: InferenceOutcome) {
        match outcome {
            InferenceOutcome::Success { result_url } => {
                self.result_urls.push(result_url);
                self.success_count += 1;
            }
            InferenceOutcome::Failure(failure) => {
                self.failures.push(failure);
                self.failure_count += 1;
            }
        }
    }

    pub fn processed(&self) -> usize {
        self.success_count + self.failure_count
    }
}

impl FromIterator<InferenceOutcome> for BatchResult {
    fn from_iter<I: IntoIterator<Item = InferenceOutcome>>(iter: I) -> Self {
        let mut result = Self::default();
        for outcome in iter {
            result.record(outcome);
        }
        result
    }
}

/// Final result of a predict request
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Single { result_url: String },
    Batch(BatchResult),
}

#[derive(Debug, Serialize)]
pub struct SingleResponse {
    pub message: String,
    pub result_url: String,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub message: String,
    pub result_urls: Vec<String>,
    pub success_count: usize,
    pub failure_count: usize,
}

impl From<BatchResult> for BatchResponse {
    fn from(result: BatchResult) -> Self {
        Self {
            message: format!(
                "Processed {} images: {} succeeded, {} failed",
                result.processed(),
                result.success_count,
                result.failure_count
            ),
            result_urls: result.result_urls,
            success_count: result.success_count,
            failure_count: result.failure_count,
        }
    }
}
