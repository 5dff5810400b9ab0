// Publish phase: store a result under a collision-resistant name and build its public URL

use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use crate::core::errors::{PipelineResult, StorageError, StorageResult};
use crate::services::storage::Storage;
use crate::utils::image_ops::file_stem_sanitized;

/// Storage namespace for transient inference results
pub const RESULT_NAMESPACE: &str = "temp";

/// Scheme and authority the caller used to reach us
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOrigin(Url);

impl RequestOrigin {
    pub fn parse(origin: &str) -> StorageResult<Self> {
        Url::parse(origin)
            .map(Self)
            .map_err(|e| StorageError::InvalidUrl {
                path: origin.to_string(),
                reason: e.to_string(),
            })
    }

    /// Origin from a `Host` header value and scheme
    pub fn from_host(scheme: &str, host: &str) -> StorageResult<Self> {
        Self::parse(&format!("{}://{}", scheme, host))
    }

    /// Absolute URL for a root-relative path such as `/media/temp/x.png`
    pub fn absolute(&self, url_path: &str) -> StorageResult<String> {
        self.0
            .join(url_path)
            .map(String::from)
            .map_err(|e| StorageError::InvalidUrl {
                path: url_path.to_string(),
                reason: e.to_string(),
            })
    }
}

/// `temp/predict_<stem>_<token>_result.png`
pub fn result_name(source_name: &str) -> String {
    format!(
        "{}/predict_{}_{}_result.png",
        RESULT_NAMESPACE,
        file_stem_sanitized(source_name),
        Uuid::new_v4().simple()
    )
}

/// Persists inference results and resolves them to caller-visible URLs
#[derive(Clone)]
pub struct ResultPublisher {
    storage: Arc<dyn Storage>,
}

impl ResultPublisher {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    #[instrument(skip(self, result, origin), fields(size = result.len()))]
    pub async fn publish(
        &self,
        result: &[u8],
        source_name: &str,
        origin: &RequestOrigin,
    ) -> PipelineResult<String> {
        let stored = self.storage.store(&result_name(source_name), result).await?;
        let url = origin.absolute(&self.storage.url_for(&stored))?;
        debug!("Published {} as {}", source_name, url);
        Ok(url)
    }
}
