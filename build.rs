use std::env;

fn main() {
    // The model is read at runtime from MODEL_PATH; only report on the default location
    let model_path = "models/unet.onnx";
    println!("cargo:rerun-if-changed={}", model_path);

    match std::fs::metadata(model_path) {
        Ok(meta) => println!(
            "cargo:warning=Found UNet model at {} ({:.1} MB)",
            model_path,
            meta.len() as f64 / 1_048_576.0
        ),
        Err(_) => println!(
            "cargo:warning=No model at {}; set MODEL_PATH before the first prediction",
            model_path
        ),
    }

    // Detect enabled acceleration features
    let mut enabled_features = Vec::new();

    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        enabled_features.push("CUDA");
    }
    if env::var("CARGO_FEATURE_TENSORRT").is_ok() {
        enabled_features.push("TensorRT");
    }
    if env::var("CARGO_FEATURE_DIRECTML").is_ok() {
        enabled_features.push("DirectML");
    }
    if env::var("CARGO_FEATURE_COREML").is_ok() {
        enabled_features.push("CoreML");
    }
    if env::var("CARGO_FEATURE_OPENVINO").is_ok() {
        enabled_features.push("OpenVINO");
    }
    if env::var("CARGO_FEATURE_XNNPACK").is_ok() {
        enabled_features.push("XNNPACK");
    }

    if enabled_features.is_empty() {
        println!("cargo:warning=Building with CPU-only inference");
    } else {
        println!("cargo:warning=Acceleration enabled: {}", enabled_features.join(", "));
    }
}
