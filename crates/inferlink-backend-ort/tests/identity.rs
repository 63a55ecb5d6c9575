use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{ensure, Context, Result};
use inferlink_backend_ort::OrtEngine;
use inferlink_core::{
    ElementType, Engine, EngineStage, InferError, ModelConfig, ModelFormat, Runtime,
    TensorDescriptor,
};

// Sessions share the process-wide ORT environment, so tests that check its
// reference count run one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn identity_model() -> Option<PathBuf> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../models/identity.onnx");
    if path.exists() {
        Some(path)
    } else {
        eprintln!("skipping: {} not present", path.display());
        None
    }
}

#[test]
fn ort_identity_cpu() -> Result<()> {
    let _serial = serial();
    let Some(model_path) = identity_model() else {
        return Ok(());
    };

    let runtime = Runtime::new(OrtEngine::new());
    let config = ModelConfig::builder(&model_path).build()?;

    // read the node metadata with an empty binding first
    let (inputs, outputs) = runtime.init_tensors(&[], &[])?;
    let metadata = runtime.load_model(&config, inputs, outputs)?;
    let input_node = metadata.input_nodes().first().cloned().context("missing model input")?;
    let output_node = metadata.output_nodes().first().cloned().context("missing model output")?;
    ensure!(
        input_node.element_type == Some(ElementType::Float32),
        "expected f32 identity model"
    );
    let (inputs, outputs) = runtime.release_model(metadata)?;
    runtime.deinit_tensors(inputs, outputs)?;

    let mut dims: Vec<i64> = input_node.dims.iter().map(|d| if *d < 0 { 3 } else { *d }).collect();
    if dims.is_empty() {
        dims.push(3);
    }
    let input = TensorDescriptor::new(&input_node.name, ElementType::Float32, &dims)?;
    let output = TensorDescriptor::new(&output_node.name, ElementType::Float32, &dims)?;
    let numel = input.element_count();

    let (inputs, outputs) = runtime.init_tensors(&[input], &[output])?;
    let session = runtime.load_model(&config, inputs, outputs)?;
    assert_eq!(runtime.engine().environment().snapshot(), (1, true));

    let data: Vec<f32> = (0..numel).map(|i| i as f32).collect();
    session
        .inputs()
        .get_mut(0)
        .context("bound input")?
        .copy_from_slice(&data)?;
    runtime.run_inference(&session)?;
    let out_vals = session.outputs().get(0).context("bound output")?.to_vec::<f32>()?;
    assert_eq!(out_vals, data);

    let (inputs, outputs) = runtime.release_model(session)?;
    runtime.deinit_tensors(inputs, outputs)?;
    assert_eq!(runtime.engine().environment().snapshot(), (0, false));
    Ok(())
}

#[test]
fn corrupt_model_is_an_engine_fault() -> Result<()> {
    let _serial = serial();
    let mut file = tempfile::Builder::new().suffix(".onnx").tempfile()?;
    file.write_all(b"definitely not a protobuf graph")?;
    file.flush()?;

    let engine = Arc::new(OrtEngine::new());
    let runtime = Runtime::from_shared(Arc::clone(&engine));
    let (inputs, outputs) = runtime.init_tensors(&[], &[])?;
    let config = ModelConfig::builder(file.path()).build()?;

    let err = runtime.load_model(&config, inputs, outputs).unwrap_err();
    assert!(matches!(
        err.error,
        InferError::Engine {
            stage: EngineStage::OpenSession,
            ..
        }
    ));
    assert_eq!(engine.environment().ref_count(), 0);
    runtime.deinit_tensors(err.inputs, err.outputs)?;
    Ok(())
}

#[test]
fn non_onnx_formats_are_rejected() -> Result<()> {
    let _serial = serial();
    let mut file = tempfile::Builder::new().suffix(".pb").tempfile()?;
    file.write_all(&[0u8; 16])?;

    let runtime = Runtime::new(OrtEngine::new());
    let (inputs, outputs) = runtime.init_tensors(&[], &[])?;
    let config = ModelConfig::builder(file.path())
        .model_format(ModelFormat::FrozenGraph)
        .build()?;

    let err = runtime.load_model(&config, inputs, outputs).unwrap_err();
    assert!(err.error.is_engine_fault());
    assert!(err.to_string().contains("cannot load"));
    Ok(())
}

#[test]
fn contexts_share_the_process_environment() -> Result<()> {
    let _serial = serial();
    let engine = OrtEngine::new();
    let first = engine.create_context()?;
    let second = engine.create_context()?;
    assert_eq!(first.name(), "inferlink");
    assert!(std::ptr::eq(first.environment(), second.environment()));
    Ok(())
}
