// Inference phase: candidate bytes → model → label mask → PNG

use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, Rgba};
use ndarray::{Array2, Array3, Axis};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

use crate::core::errors::{PipelineError, PipelineResult, SegmentationError};
use crate::core::types::{Candidate, InferenceParameters};
use crate::services::segmentation::{LazyModel, MaskValues};
use crate::utils::image_ops;

/// Runs one candidate through the segmentation model
#[derive(Clone)]
pub struct InferenceInvoker {
    model: Arc<LazyModel>,
}

impl InferenceInvoker {
    pub fn new(model: Arc<LazyModel>) -> Self {
        Self { model }
    }

    /// Decode, segment and encode `candidate` on the blocking pool.
    #[instrument(skip(self, candidate), fields(candidate = %candidate.name, size = candidate.bytes.len()))]
    pub async fn run(
        &self,
        candidate: Candidate,
        params: InferenceParameters,
    ) -> PipelineResult<Vec<u8>> {
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || segment_to_png(&model, &candidate.bytes, params))
            .await
            .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))?
    }
}

fn segment_to_png(
    model: &LazyModel,
    bytes: &[u8],
    params: InferenceParameters,
) -> PipelineResult<Vec<u8>> {
    let start = Instant::now();
    let image = image_ops::decode_image(bytes).map_err(PipelineError::Decode)?;
    let (width, height) = (image.width(), image.height());

    let model = model.get()?;
    let scores = model.predict(&image, params.scale_factor)?;
    debug!("Model output {:?} for {}x{} input", scores.shape(), width, height);
    if scores.is_empty() {
        return Err(PipelineError::Inference(
            SegmentationError::UnexpectedOutputShape(scores.shape().to_vec()),
        ));
    }

    let scores = resize_scores(&scores, width, height);
    let labels = label_mask(&scores, params.threshold);
    let rendered = render_mask(&labels, model.mask_values());
    let png = image_ops::encode_png(&rendered).map_err(PipelineError::Encode)?;

    debug!(
        "Segmented {}x{} image in {:.2}ms",
        width,
        height,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(png)
}

/// Bilinear resize of `[C, h, w]` scores to `[C, height, width]`
/// using half-pixel centres.
pub fn resize_scores(scores: &Array3<f32>, width: u32, height: u32) -> Array3<f32> {
    let (classes, in_h, in_w) = scores.dim();
    let (out_h, out_w) = (height as usize, width as usize);
    if in_h == out_h && in_w == out_w {
        return scores.clone();
    }

    // Source coordinate, lower neighbour, upper neighbour and weight per output index
    let taps = |out_len: usize, in_len: usize| -> Vec<(usize, usize, f32)> {
        let scale = in_len as f32 / out_len as f32;
        (0..out_len)
            .map(|dst| {
                let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
                let lo = (src.floor() as usize).min(in_len - 1);
                let hi = (lo + 1).min(in_len - 1);
                (lo, hi, src - lo as f32)
            })
            .collect()
    };
    let x_taps = taps(out_w, in_w);
    let y_taps = taps(out_h, in_h);

    let mut out = Array3::<f32>::zeros((classes, out_h, out_w));
    for c in 0..classes {
        let plane = scores.index_axis(Axis(0), c);
        let mut out_plane = out.index_axis_mut(Axis(0), c);
        for (y, &(y0, y1, wy)) in y_taps.iter().enumerate() {
            for (x, &(x0, x1, wx)) in x_taps.iter().enumerate() {
                let top = plane[[y0, x0]] * (1.0 - wx) + plane[[y0, x1]] * wx;
                let bottom = plane[[y1, x0]] * (1.0 - wx) + plane[[y1, x1]] * wx;
                out_plane[[y, x]] = top * (1.0 - wy) + bottom * wy;
            }
        }
    }
    out
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Per-pixel class labels: arg-max over classes, or `sigmoid > threshold`
/// when the model has a single output channel.
pub fn label_mask(scores: &Array3<f32>, threshold: f32) -> Array2<u32> {
    let (classes, height, width) = scores.dim();

    if classes == 1 {
        return scores
            .index_axis(Axis(0), 0)
            .mapv(|v| u32::from(sigmoid(v) > threshold));
    }

    Array2::from_shape_fn((height, width), |(y, x)| {
        let mut best = 0;
        for c in 1..classes {
            if scores[[c, y, x]] > scores[[best, y, x]] {
                best = c;
            }
        }
        best as u32
    })
}

/// Map class labels to pixels. Labels missing from the table render as zero.
pub fn render_mask(labels: &Array2<u32>, values: &MaskValues) -> DynamicImage {
    let (height, width) = labels.dim();
    let (w, h) = (width as u32, height as u32);
    let label = |x: u32, y: u32| labels[[y as usize, x as usize]] as usize;

    match values {
        MaskValues::Binary => DynamicImage::ImageLuma8(GrayImage::from_fn(w, h, |x, y| {
            Luma([if label(x, y) == 1 { 255 } else { 0 }])
        })),
        MaskValues::Grayscale(table) => DynamicImage::ImageLuma8(GrayImage::from_fn(w, h, |x, y| {
            Luma([table.get(label(x, y)).copied().unwrap_or(0)])
        })),
        MaskValues::Rgb(table) => DynamicImage::ImageRgb8(ImageBuffer::from_fn(w, h, |x, y| {
            Rgb(table.get(label(x, y)).copied().unwrap_or([0; 3]))
        })),
        MaskValues::Rgba(table) => DynamicImage::ImageRgba8(ImageBuffer::from_fn(w, h, |x, y| {
            Rgba(table.get(label(x, y)).copied().unwrap_or([0; 4]))
        })),
    }
}
