// Batch Orchestrator: drives one predict request from ingestion to published URLs

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{
    BatchResult, Candidate, FailureReason, InferenceOutcome, InferenceParameters, Ingestion,
    ItemFailure, PredictForm, ProcessOutcome,
};
use crate::phases::{InferenceInvoker, IngestionResolver, RequestOrigin, ResultPublisher};
use crate::services::archive::{ArchiveExtractor, ScratchArea};
use crate::services::segmentation::LazyModel;
use crate::services::storage::Storage;
use crate::services::validation::is_valid_image;
use crate::utils::metrics::Metrics;

/// Main workflow coordinator
pub struct BatchOrchestrator {
    resolver: IngestionResolver,
    extractor: ArchiveExtractor,
    invoker: InferenceInvoker,
    publisher: ResultPublisher,
    model: Arc<LazyModel>,
    metrics: Metrics,
}

impl BatchOrchestrator {
    pub fn new(
        config: &Config,
        storage: Arc<dyn Storage>,
        model: Arc<LazyModel>,
        metrics: Metrics,
    ) -> Self {
        Self {
            resolver: IngestionResolver::new(Arc::clone(&storage)),
            extractor: ArchiveExtractor::new(
                config.storage.scratch_dir.clone(),
                config.archive_limits(),
            ),
            invoker: InferenceInvoker::new(Arc::clone(&model)),
            publisher: ResultPublisher::new(storage),
            model,
            metrics,
        }
    }

    /// Whether the segmentation model has been loaded yet
    pub fn model_loaded(&self) -> bool {
        self.model.is_loaded()
    }

    /// Process one predict request.
    ///
    /// # Workflow:
    /// 1. Resolve the form into a single candidate or an archive
    /// 2. Single: infer then publish; any failure fails the request
    /// 3. Batch: extract, then validate → infer → publish each entry in listing order,
    ///    recording per-item failures instead of aborting
    #[instrument(skip_all)]
    pub async fn process(
        &self,
        form: PredictForm,
        origin: &RequestOrigin,
    ) -> PipelineResult<ProcessOutcome> {
        let result = self.dispatch(form, origin).await;
        if result.is_err() {
            self.metrics.record_request_failed();
        }
        result
    }

    async fn dispatch(
        &self,
        form: PredictForm,
        origin: &RequestOrigin,
    ) -> PipelineResult<ProcessOutcome> {
        let (ingestion, params) = self.resolver.resolve(form).await?;
        info!(
            "Parameters: scale_factor={}, threshold={}",
            params.scale_factor, params.threshold
        );

        match ingestion {
            Ingestion::Single(candidate) => {
                self.metrics.record_single_request();
                let result_url = self.process_single(candidate, params, origin).await?;
                Ok(ProcessOutcome::Single { result_url })
            }
            Ingestion::Batch {
                archive_name,
                archive_bytes,
            } => {
                self.metrics.record_batch_request();
                let result = self
                    .process_batch(&archive_name, archive_bytes, params, origin)
                    .await?;
                Ok(ProcessOutcome::Batch(result))
            }
        }
    }

    #[instrument(skip(self, candidate, params, origin), fields(candidate = %candidate.name))]
    async fn process_single(
        &self,
        candidate: Candidate,
        params: InferenceParameters,
        origin: &RequestOrigin,
    ) -> PipelineResult<String> {
        let result = self.infer_and_publish(candidate, params, origin).await;
        self.metrics.record_image(result.is_ok());
        result
    }

    #[instrument(skip(self, archive_bytes, params, origin))]
    async fn process_batch(
        &self,
        archive_name: &str,
        archive_bytes: Vec<u8>,
        params: InferenceParameters,
        origin: &RequestOrigin,
    ) -> PipelineResult<BatchResult> {
        let start_time = Instant::now();

        let extractor = self.extractor.clone();
        let scratch = tokio::task::spawn_blocking(move || extractor.extract(&archive_bytes))
            .await
            .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))??;

        info!(
            "Processing {} candidate images from {}",
            scratch.entries().len(),
            archive_name
        );

        let mut result = BatchResult::default();
        for entry in scratch.entries() {
            let outcome = self.process_entry(&scratch, entry, params, origin).await;
            self.metrics
                .record_image(matches!(outcome, InferenceOutcome::Success { .. }));
            result.record(outcome);
        }

        scratch.release();

        info!(
            "Batch complete: {} succeeded, {} failed in {:.2}s",
            result.success_count,
            result.failure_count,
            start_time.elapsed().as_secs_f64()
        );

        if result.success_count == 0 {
            return Err(PipelineError::NoValidResults {
                failed: result.failure_count,
            });
        }
        Ok(result)
    }

    /// Validate → infer → publish one archive entry. Never fails the batch.
    async fn process_entry(
        &self,
        scratch: &ScratchArea,
        entry: &Path,
        params: InferenceParameters,
        origin: &RequestOrigin,
    ) -> InferenceOutcome {
        let name = entry.display().to_string();
        let failure = |reason: FailureReason| {
            InferenceOutcome::Failure(ItemFailure {
                candidate_name: name.clone(),
                reason,
            })
        };

        let candidate = match scratch.read_candidate(entry).await {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Skipping {}: unreadable ({})", name, e);
                return failure(FailureReason::Unreadable);
            }
        };

        if !is_valid_image(&candidate.bytes) {
            warn!("Skipping {}: not a valid image", name);
            return failure(FailureReason::InvalidImage);
        }

        match self.infer_and_publish(candidate, params, origin).await {
            Ok(result_url) => InferenceOutcome::Success { result_url },
            Err(e) => {
                warn!("Failed to process {}: {}", name, e);
                failure(e.failure_reason())
            }
        }
    }

    async fn infer_and_publish(
        &self,
        candidate: Candidate,
        params: InferenceParameters,
        origin: &RequestOrigin,
    ) -> PipelineResult<String> {
        let source_name = candidate.name.clone();

        let inference_start = Instant::now();
        let mask = self.invoker.run(candidate, params).await?;
        self.metrics
            .record_inference_duration(inference_start.elapsed());

        let publish_start = Instant::now();
        let url = self.publisher.publish(&mask, &source_name, origin).await?;
        self.metrics.record_publish_duration(publish_start.elapsed());

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::UploadedFile;
    use crate::services::archive::tests::build_zip;
    use crate::services::storage::LocalStorage;
    use crate::test_support::{brightness_model, jpeg_bytes, png_bytes};
    use tempfile::TempDir;

    struct Fixture {
        media: TempDir,
        scratch: TempDir,
        orchestrator: BatchOrchestrator,
        metrics: Metrics,
    }

    fn fixture() -> Fixture {
        let media = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let mut config = Config::with_media_root(media.path());
        config.storage.scratch_dir = Some(scratch.path().to_path_buf());

        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(media.path(), "/media/"));
        let metrics = Metrics::new();
        let orchestrator =
            BatchOrchestrator::new(&config, storage, brightness_model(), metrics.clone());
        Fixture {
            media,
            scratch,
            orchestrator,
            metrics,
        }
    }

    fn origin() -> RequestOrigin {
        RequestOrigin::parse("http://localhost:8000").unwrap()
    }

    fn upload(name: &str, bytes: Vec<u8>) -> PredictForm {
        PredictForm {
            file: Some(UploadedFile {
                filename: name.to_string(),
                bytes,
            }),
            ..Default::default()
        }
    }

    fn scratch_is_empty(fx: &Fixture) -> bool {
        std::fs::read_dir(fx.scratch.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_single_upload_publishes_one_result() {
        let fx = fixture();
        let outcome = fx
            .orchestrator
            .process(upload("cat.jpg", jpeg_bytes(32, 16)), &origin())
            .await
            .unwrap();

        let ProcessOutcome::Single { result_url } = outcome else {
            panic!("expected single outcome");
        };
        assert!(result_url.starts_with("http://localhost:8000/media/temp/predict_cat_"));
        assert!(result_url.ends_with("_result.png"));

        let stored = result_url.trim_start_matches("http://localhost:8000/media/");
        let mask = image::open(fx.media.path().join(stored)).unwrap();
        assert_eq!((mask.width(), mask.height()), (32, 16));
        assert_eq!(fx.metrics.snapshot().single_requests, 1);
    }

    #[tokio::test]
    async fn test_single_undecodable_upload_fails_request() {
        let fx = fixture();
        let err = fx
            .orchestrator
            .process(upload("cat.jpg", b"definitely not an image".to_vec()), &origin())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
        assert_eq!(fx.metrics.snapshot().requests_failed, 1);
    }

    #[tokio::test]
    async fn test_batch_skips_invalid_entries() {
        let fx = fixture();
        let png = png_bytes(16, 16);
        let archive = build_zip(&[
            ("a.png", png.as_slice()),
            ("b.txt", b"notes"),
            ("c.jpg", b"\xFF\xD8\xFF corrupt jpeg"),
        ]);

        let outcome = fx
            .orchestrator
            .process(upload("batch.zip", archive), &origin())
            .await
            .unwrap();

        let ProcessOutcome::Batch(result) = outcome else {
            panic!("expected batch outcome");
        };
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.result_urls.len(), 1);
        assert!(result.result_urls[0].contains("predict_a_"));
        assert_eq!(result.failures[0].candidate_name, "c.jpg");
        assert_eq!(result.failures[0].reason, FailureReason::InvalidImage);
        assert!(scratch_is_empty(&fx));
    }

    #[tokio::test]
    async fn test_batch_preserves_listing_order() {
        let fx = fixture();
        let png = png_bytes(8, 8);
        let archive = build_zip(&[
            ("z.png", png.as_slice()),
            ("m/a.png", png.as_slice()),
            ("b.png", png.as_slice()),
        ]);

        let ProcessOutcome::Batch(result) = fx
            .orchestrator
            .process(upload("batch.zip", archive), &origin())
            .await
            .unwrap()
        else {
            panic!("expected batch outcome");
        };

        let stems: Vec<&str> = result
            .result_urls
            .iter()
            .map(|u| if u.contains("predict_z_") { "z" } else if u.contains("predict_a_") { "a" } else { "b" })
            .collect();
        assert_eq!(stems, vec!["z", "a", "b"]);
    }

    #[tokio::test]
    async fn test_batch_without_valid_images_fails_and_cleans_up() {
        let fx = fixture();
        let archive = build_zip(&[("notes.txt", b"hello"), ("broken.png", b"nope")]);

        let err = fx
            .orchestrator
            .process(upload("batch.zip", archive), &origin())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::NoValidResults { failed: 1 }));
        assert!(scratch_is_empty(&fx));
        assert_eq!(fx.metrics.snapshot().batch_requests, 1);
    }

    #[tokio::test]
    async fn test_archive_symlink_is_never_published() {
        let fx = fixture();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.png");
        std::fs::write(&secret, png_bytes(12, 12)).unwrap();

        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .add_symlink(
                "leak.png",
                secret.to_string_lossy(),
                zip::write::SimpleFileOptions::default(),
            )
            .unwrap();
        let archive = writer.finish().unwrap().into_inner();

        let err = fx
            .orchestrator
            .process(upload("batch.zip", archive), &origin())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::NoValidResults { failed: 0 }));
        assert!(!fx.media.path().join("temp").exists());
        assert!(scratch_is_empty(&fx));
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_rejected() {
        let fx = fixture();
        let err = fx
            .orchestrator
            .process(upload("batch.zip", b"PK not really".to_vec()), &origin())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ArchiveCorrupt(_)));
        assert!(scratch_is_empty(&fx));
    }

    #[tokio::test]
    async fn test_dataset_reference_is_processed() {
        let fx = fixture();
        std::fs::create_dir_all(fx.media.path().join("datasets")).unwrap();
        std::fs::write(fx.media.path().join("datasets/scan.png"), png_bytes(10, 10)).unwrap();

        let form = PredictForm {
            dataset_path: Some("datasets/scan.png".to_string()),
            threshold: Some("0.3".to_string()),
            ..Default::default()
        };
        let outcome = fx.orchestrator.process(form, &origin()).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Single { ref result_url } if result_url.contains("predict_scan_")));
    }
}
