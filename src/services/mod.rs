pub mod archive;
pub mod onnx_builder; // Shared ONNX session builder
pub mod segmentation;
pub mod storage;
pub mod validation;

// Re-export commonly used services
pub use archive::{ArchiveExtractor, ArchiveLimits};
pub use segmentation::{LazyModel, MaskValues, SegmentationModel, UNetSegmenter};
pub use storage::{LocalStorage, Storage};
