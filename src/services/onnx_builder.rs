// ONNX Runtime session construction with hardware acceleration fallback

use anyhow::{Context, Result};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::{debug, info, warn};

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;

#[cfg(feature = "xnnpack")]
use ort::execution_providers::XNNPACKExecutionProvider;

/// Intra-op thread count for CPU inference.
///
/// Windows is capped at 6 threads; beyond that thread synchronisation costs
/// more than it gains (https://github.com/microsoft/onnxruntime/issues/3713).
fn optimal_intra_op_threads() -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let optimal = std::cmp::min(6, total_cores).max(1);

    #[cfg(not(target_os = "windows"))]
    let optimal = total_cores.max(1);

    debug!("CPU threads: {} total cores, using {} for inference", total_cores, optimal);
    optimal
}

/// Accelerated providers compiled into this build, in order of preference
#[allow(unused_mut)]
fn accelerated_providers() -> Vec<(&'static str, ExecutionProviderDispatch)> {
    let mut providers = Vec::new();

    #[cfg(feature = "tensorrt")]
    providers.push(("TensorRT", TensorRTExecutionProvider::default().build()));

    #[cfg(feature = "cuda")]
    providers.push(("CUDA", CUDAExecutionProvider::default().build()));

    #[cfg(all(target_os = "macos", feature = "coreml"))]
    providers.push(("CoreML", CoreMLExecutionProvider::default().build()));

    #[cfg(all(target_os = "windows", feature = "directml"))]
    providers.push(("DirectML", DirectMLExecutionProvider::default().build()));

    #[cfg(feature = "openvino")]
    providers.push((
        "OpenVINO",
        OpenVINOExecutionProvider::default().with_device_type("CPU").build(),
    ));

    #[cfg(feature = "xnnpack")]
    providers.push(("XNNPACK", XNNPACKExecutionProvider::default().build()));

    providers
}

fn commit_with(provider: ExecutionProviderDispatch, model_bytes: &[u8]) -> ort::Result<Session> {
    Session::builder()?
        .with_execution_providers([provider])?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(optimal_intra_op_threads())?
        .with_inter_threads(1)?
        .commit_from_memory(model_bytes)
}

fn commit_cpu(model_bytes: &[u8], model_name: &str) -> Result<Session> {
    commit_with(CPUExecutionProvider::default().build(), model_bytes).with_context(|| {
        format!(
            "Failed to load {} ONNX model from memory ({:.1} MB). \
            The file may be corrupt or exported with an unsupported opset",
            model_name,
            model_bytes.len() as f64 / 1_048_576.0
        )
    })
}

/// Build a session, preferring `forced_backend` when given, otherwise the
/// first accelerated provider that initialises, otherwise CPU.
///
/// Returns (backend_name, Session).
pub fn build_session(
    model_bytes: &[u8],
    model_name: &str,
    forced_backend: Option<&str>,
) -> Result<(String, Session)> {
    if let Some(backend) = forced_backend.filter(|b| !b.eq_ignore_ascii_case("auto")) {
        info!("INFERENCE_BACKEND={}, forcing specific backend for {}", backend, model_name);

        if backend.eq_ignore_ascii_case("cpu") {
            return Ok(("CPU".to_string(), commit_cpu(model_bytes, model_name)?));
        }

        match accelerated_providers()
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(backend))
        {
            Some((name, provider)) => {
                let session = commit_with(provider, model_bytes)
                    .with_context(|| format!("Failed to load {} with {}", model_name, name))?;
                info!("✓ Forced {} backend for {}", name, model_name);
                return Ok((name.to_string(), session));
            }
            None => warn!(
                "Backend '{}' not compiled in, falling back to auto-detection for {}",
                backend, model_name
            ),
        }
    }

    for (name, provider) in accelerated_providers() {
        match commit_with(provider, model_bytes) {
            Ok(session) => {
                info!("✓ Using {} acceleration for {}", name, model_name);
                return Ok((name.to_string(), session));
            }
            Err(e) => debug!("{} unavailable for {}: {}", name, model_name, e),
        }
    }

    let session = commit_cpu(model_bytes, model_name)?;
    warn!("⚠️  Using CPU-only inference for {} (no GPU acceleration available)", model_name);
    Ok(("CPU".to_string(), session))
}
