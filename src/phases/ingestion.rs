// Ingestion phase: turn a predict form into a single candidate or an archive to unpack

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{
    Candidate, CandidateSource, InferenceParameters, Ingestion, PredictForm, DEFAULT_SCALE_FACTOR,
    DEFAULT_THRESHOLD,
};
use crate::services::archive::is_archive_name;
use crate::services::storage::Storage;

fn parse_number(raw: Option<&str>, field: &str, default: f32) -> PipelineResult<f32> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(value) => value.parse::<f32>().map_err(|_| {
            PipelineError::InvalidParameter(format!("{} must be a number, got {:?}", field, value))
        }),
    }
}

pub fn parse_parameters(form: &PredictForm) -> PipelineResult<InferenceParameters> {
    let scale_factor = parse_number(
        form.scale_factor.as_deref(),
        "scale_factor",
        DEFAULT_SCALE_FACTOR,
    )?;
    let threshold = parse_number(form.threshold.as_deref(), "threshold", DEFAULT_THRESHOLD)?;
    InferenceParameters::new(scale_factor, threshold)
}

/// Resolves the three request shapes into an `Ingestion`
#[derive(Clone)]
pub struct IngestionResolver {
    storage: Arc<dyn Storage>,
}

impl IngestionResolver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    #[instrument(skip(self, form))]
    pub async fn resolve(
        &self,
        form: PredictForm,
    ) -> PipelineResult<(Ingestion, InferenceParameters)> {
        let params = parse_parameters(&form)?;

        let ingestion = if let Some(file) = form.file {
            if is_archive_name(&file.filename) {
                info!("Batch request: archive {} ({} bytes)", file.filename, file.bytes.len());
                Ingestion::Batch {
                    archive_name: file.filename,
                    archive_bytes: file.bytes,
                }
            } else {
                info!("Single request: upload {} ({} bytes)", file.filename, file.bytes.len());
                Ingestion::Single(Candidate::new(file.filename, file.bytes, CandidateSource::Upload))
            }
        } else if let Some(reference) = form.dataset_path.filter(|r| !r.trim().is_empty()) {
            Ingestion::Single(self.read_dataset_file(reference.trim()).await?)
        } else {
            return Err(PipelineError::MissingInput);
        };

        Ok((ingestion, params))
    }

    async fn read_dataset_file(&self, reference: &str) -> PipelineResult<Candidate> {
        let path = self
            .storage
            .resolve_reference(reference)
            .map_err(|e| PipelineError::InvalidParameter(e.to_string()))?;

        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(PipelineError::NotFound(reference.to_string()));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::NotFound(format!("{} ({})", reference, e)))?;

        let name = Path::new(reference)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| reference.to_string());
        debug!("Read dataset file {} ({} bytes)", path.display(), bytes.len());

        Ok(Candidate::new(name, bytes, CandidateSource::DatasetRef))
    }
}
