pub mod inference;
pub mod ingestion;
pub mod publish;

pub use inference::InferenceInvoker;
pub use ingestion::IngestionResolver;
pub use publish::{RequestOrigin, ResultPublisher};
