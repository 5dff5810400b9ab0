// Segmentation model collaborator: UNet exported to ONNX

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::{Array3, Array4};
use once_cell::sync::OnceCell;
use ort::session::Session;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::core::config::ModelConfig;
use crate::core::errors::{ConfigError, SegmentationError, SegmentationResult};
use crate::services::onnx_builder;

/// Class index → output pixel lookup, supplied with the model
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MaskValues {
    /// Two classes rendered as a black/white boolean image
    #[default]
    Binary,
    Grayscale(Vec<u8>),
    Rgb(Vec<[u8; 3]>),
    Rgba(Vec<[u8; 4]>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMaskValues {
    Scalars(Vec<u8>),
    Channels(Vec<Vec<u8>>),
}

impl MaskValues {
    /// Parse the JSON form used by model checkpoints: `[0, 1]`,
    /// `[0, 127, 255]` or `[[0, 0, 0], [255, 0, 0]]`.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let parsed: RawMaskValues = serde_json::from_str(raw)
            .map_err(|e| ConfigError::InvalidMaskValues(format!("{}: {}", raw, e)))?;

        match parsed {
            RawMaskValues::Scalars(values) if values == [0, 1] => Ok(Self::Binary),
            RawMaskValues::Scalars(values) => Ok(Self::Grayscale(values)),
            RawMaskValues::Channels(values) => {
                let channels = values.first().map(Vec::len).unwrap_or(0);
                if values.iter().any(|v| v.len() != channels) {
                    return Err(ConfigError::InvalidMaskValues(
                        "all colour entries must have the same channel count".to_string(),
                    ));
                }
                match channels {
                    3 => Ok(Self::Rgb(values.iter().map(|v| [v[0], v[1], v[2]]).collect())),
                    4 => Ok(Self::Rgba(
                        values.iter().map(|v| [v[0], v[1], v[2], v[3]]).collect(),
                    )),
                    n => Err(ConfigError::InvalidMaskValues(format!(
                        "colour entries need 3 or 4 channels, got {}",
                        n
                    ))),
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Binary => 2,
            Self::Grayscale(v) => v.len(),
            Self::Rgb(v) => v.len(),
            Self::Rgba(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Contract of the external segmentation model.
///
/// Implementations must be safe to share across requests; the ONNX
/// implementation serialises calls on an internal mutex.
pub trait SegmentationModel: Send + Sync {
    /// Raw per-class scores shaped `[classes, h, w]`, where `h`/`w` are the
    /// dimensions of `image` after rescaling by `scale_factor`.
    fn predict(&self, image: &DynamicImage, scale_factor: f32) -> SegmentationResult<Array3<f32>>;

    fn mask_values(&self) -> &MaskValues;

    fn device_type(&self) -> &str {
        "unknown"
    }
}

/// UNet segmenter backed by a single ONNX Runtime session
pub struct UNetSegmenter {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    mask_values: MaskValues,
    device_type: String,
}

impl UNetSegmenter {
    #[instrument(skip(config), fields(model_path = %config.model_path))]
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let model_bytes = std::fs::read(&config.model_path)
            .with_context(|| format!("Failed to load UNet model from {}", config.model_path))?;
        info!("Loaded UNet model ({:.1} MB)", model_bytes.len() as f64 / 1_048_576.0);

        if model_bytes.len() < 100 {
            anyhow::bail!(
                "Model file is too small ({} bytes). This might be a Git LFS stub",
                model_bytes.len()
            );
        }

        let (device_type, session) = onnx_builder::build_session(
            &model_bytes,
            "unet",
            config.inference_backend.as_deref(),
        )?;

        Ok(Self {
            session: Mutex::new(session),
            input_name: config.input_name.clone(),
            output_name: config.output_name.clone(),
            mask_values: config.mask_values.clone(),
            device_type,
        })
    }

    /// Rescale (bicubic), normalise to [0, 1] and lay out as NCHW.
    fn preprocess(image: &DynamicImage, scale_factor: f32) -> SegmentationResult<Array4<f32>> {
        let new_width = (image.width() as f32 * scale_factor) as u32;
        let new_height = (image.height() as f32 * scale_factor) as u32;
        if new_width == 0 || new_height == 0 {
            return Err(SegmentationError::ScaleTooSmall {
                scale: scale_factor,
                width: image.width(),
                height: image.height(),
            });
        }

        let rgb = if new_width == image.width() && new_height == image.height() {
            image.to_rgb8()
        } else {
            image
                .resize_exact(new_width, new_height, FilterType::CatmullRom)
                .to_rgb8()
        };

        let mut input = Array4::<f32>::zeros((1, 3, new_height as usize, new_width as usize));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }

        Ok(input)
    }
}

impl SegmentationModel for UNetSegmenter {
    fn predict(&self, image: &DynamicImage, scale_factor: f32) -> SegmentationResult<Array3<f32>> {
        let input = Self::preprocess(image, scale_factor)?;
        debug!("UNet input tensor {:?}", input.shape());

        let input_value = ort::value::Value::from_array(input)?;

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![self.input_name.as_str() => input_value])?;
        let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();

        let (classes, height, width) = output_dims(&dims)?;
        Ok(Array3::from_shape_vec((classes, height, width), data.to_vec())?)
    }

    fn mask_values(&self) -> &MaskValues {
        &self.mask_values
    }

    fn device_type(&self) -> &str {
        &self.device_type
    }
}

/// Accepts `[1, C, H, W]` or `[C, H, W]` with every dimension non-zero
fn output_dims(dims: &[usize]) -> SegmentationResult<(usize, usize, usize)> {
    match dims {
        [1, c, h, w] | [c, h, w] if *c > 0 && *h > 0 && *w > 0 => Ok((*c, *h, *w)),
        _ => Err(SegmentationError::UnexpectedOutputShape(dims.to_vec())),
    }
}

pub type ModelLoader = Box<dyn Fn() -> Result<Arc<dyn SegmentationModel>> + Send + Sync>;

/// Model handle loaded once, on first use, then shared by every request
pub struct LazyModel {
    cell: OnceCell<Arc<dyn SegmentationModel>>,
    loader: ModelLoader,
}

impl LazyModel {
    pub fn new(loader: ModelLoader) -> Self {
        Self {
            cell: OnceCell::new(),
            loader,
        }
    }

    /// Lazily load the ONNX UNet described by `config`
    pub fn from_config(config: ModelConfig) -> Self {
        Self::new(Box::new(move || {
            let model: Arc<dyn SegmentationModel> = Arc::new(UNetSegmenter::load(&config)?);
            Ok(model)
        }))
    }

    /// Wrap an already constructed model
    pub fn preloaded(model: Arc<dyn SegmentationModel>) -> Self {
        let cell = OnceCell::new();
        let _ = cell.set(model);
        Self {
            cell,
            loader: Box::new(|| anyhow::bail!("model was preloaded")),
        }
    }

    /// Blocks while the model loads; call from a blocking context.
    pub fn get(&self) -> SegmentationResult<Arc<dyn SegmentationModel>> {
        self.cell
            .get_or_try_init(|| {
                let start = std::time::Instant::now();
                let model = (self.loader)()
                    .map_err(|e| SegmentationError::LoadFailed(format!("{:#}", e)))?;
                info!(
                    "✓ Segmentation model ready on {} in {:.2}ms",
                    model.device_type(),
                    start.elapsed().as_secs_f64() * 1000.0
                );
                Ok(model)
            })
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}
