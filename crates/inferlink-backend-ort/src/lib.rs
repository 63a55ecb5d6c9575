//! ONNX Runtime engine for inferlink.
//!
//! All sessions in the process share one ORT environment, tracked by
//! [`OrtEngine::environment`]. ORT itself keeps that environment alive until
//! the process exits; dropping the last [`OrtContext`] only releases this
//! crate's handle to it. GPU execution providers are compiled in with the
//! `cuda` and `tensorrt` features.

use std::borrow::Cow;

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use inferlink_core::{
    ElementType, Engine, EngineCapabilities, EngineEnvironment, EngineSession, EngineValue,
    ExecutionProvider, InputTensor, ModelFormat, ModelSource, NodeInfo, OptimizeLevel,
    SessionOptions,
};
use ort::{
    environment::Environment,
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session, SessionInputValue,
    },
    tensor::{PrimitiveTensorElementType, TensorElementType},
    value::{Tensor, TensorRef, ValueType},
};
use tracing::{debug, info};

static ORT_ENVIRONMENT: EngineEnvironment<OrtContext> = EngineEnvironment::new();

/// Handle to the committed global ORT environment.
#[derive(Debug)]
pub struct OrtContext {
    name: &'static str,
    environment: &'static Environment,
}

impl OrtContext {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn environment(&self) -> &'static Environment {
        self.environment
    }
}

pub struct OrtEngine;

impl OrtEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OrtEngine {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OrtSessionHandle {
    session: Session,
}

impl Engine for OrtEngine {
    type Context = OrtContext;
    type Session = OrtSessionHandle;

    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            supports_cuda: cfg!(feature = "cuda"),
            supports_tensorrt: cfg!(feature = "tensorrt"),
        }
    }

    fn environment(&self) -> &EngineEnvironment<OrtContext> {
        &ORT_ENVIRONMENT
    }

    fn create_context(&self) -> Result<OrtContext> {
        let name = "inferlink";
        // false when a previous context already committed it
        let fresh = ort::init()
            .with_name(name)
            .commit()
            .context("failed to create ORT environment")?;
        let environment =
            ort::environment::get_environment().context("failed to fetch ORT environment")?;
        info!(name, fresh, "ORT environment committed");
        Ok(OrtContext { name, environment })
    }

    fn open_session(
        &self,
        _ctx: &OrtContext,
        options: &SessionOptions,
        source: ModelSource,
    ) -> Result<OrtSessionHandle> {
        ensure!(
            options.model_format == ModelFormat::Onnx,
            "onnxruntime cannot load {:?} models",
            options.model_format
        );
        debug!(
            threads = options.intra_op_threads,
            level = ?options.optimize_level,
            providers = options.providers.len(),
            "building ORT session"
        );

        let builder = Session::builder()
            .context("failed to create ORT session builder")?
            .with_optimization_level(optimization_level(options.optimize_level))
            .context("failed to configure ORT session builder")?
            .with_intra_threads(options.intra_op_threads)
            .context("failed to set ORT intra-op threads")?;

        let builder = configure_providers(builder, &options.providers)?;

        let session = match source {
            ModelSource::File(path) => builder
                .commit_from_file(&path)
                .with_context(|| format!("failed to load ONNX model {}", path.display()))?,
            ModelSource::Memory(bytes) => builder
                .commit_from_memory(&bytes)
                .context("failed to load ONNX model from memory")?,
        };

        Ok(OrtSessionHandle { session })
    }
}

impl EngineSession for OrtSessionHandle {
    fn inputs(&self) -> Result<Vec<NodeInfo>> {
        Ok(self
            .session
            .inputs
            .iter()
            .map(|input| node_info(&input.name, &input.input_type))
            .collect())
    }

    fn outputs(&self) -> Result<Vec<NodeInfo>> {
        Ok(self
            .session
            .outputs
            .iter()
            .map(|output| node_info(&output.name, &output.output_type))
            .collect())
    }

    fn run(&mut self, inputs: &[InputTensor<'_>], output_names: &[&str]) -> Result<Vec<EngineValue>> {
        let mut ort_inputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let value = input_to_ort_value(input)?;
            ort_inputs.push((input.name.to_string(), value));
        }

        let outputs = self.session.run(ort_inputs)?;

        let mut values = Vec::with_capacity(output_names.len());
        for wanted in output_names {
            let value = outputs
                .iter()
                .find(|(name, _)| name == wanted)
                .map(|(_, value)| value)
                .with_context(|| format!("ORT returned no output named {wanted}"))?;
            values.push(ort_value_to_engine_value(&value)?);
        }
        Ok(values)
    }
}

fn optimization_level(level: OptimizeLevel) -> GraphOptimizationLevel {
    match level {
        OptimizeLevel::Disabled => GraphOptimizationLevel::Disable,
        OptimizeLevel::Basic => GraphOptimizationLevel::Level1,
        OptimizeLevel::Extended => GraphOptimizationLevel::Level2,
        OptimizeLevel::All => GraphOptimizationLevel::Level3,
    }
}

fn configure_providers(
    mut builder: SessionBuilder,
    providers: &[ExecutionProvider],
) -> Result<SessionBuilder> {
    for provider in providers {
        builder = match provider {
            ExecutionProvider::Cuda { device_id } => configure_cuda(builder, *device_id)?,
            ExecutionProvider::TensorRt { device_id, tuning } => {
                configure_tensorrt(builder, *device_id, tuning)?
            }
        };
    }
    Ok(builder)
}

fn configure_cuda(builder: SessionBuilder, device_id: u32) -> Result<SessionBuilder> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        let ep = CUDAExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build();
        debug!(device_id, "registering CUDA execution provider");
        builder
            .with_execution_providers([ep])
            .context("failed to enable ORT CUDA execution provider")
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = (builder, device_id);
        bail!("CUDA requested but inferlink-backend-ort was built without the `cuda` feature")
    }
}

fn configure_tensorrt(
    builder: SessionBuilder,
    device_id: u32,
    tuning: &inferlink_core::AcceleratorTuning,
) -> Result<SessionBuilder> {
    #[cfg(feature = "tensorrt")]
    {
        use inferlink_core::Precision;
        use ort::execution_providers::tensorrt::TensorRTExecutionProvider;
        let ep = TensorRTExecutionProvider::default()
            .with_device_id(device_id as i32)
            .with_fp16(tuning.precision == Precision::Fp16)
            .with_int8(tuning.precision == Precision::Int8)
            .with_max_workspace_size(tuning.max_workspace_bytes as usize)
            .with_min_subgraph_size(tuning.min_segment_size as usize)
            .with_engine_cache(tuning.max_cached_engines > 0)
            .build();
        debug!(
            device_id,
            precision = ?tuning.precision,
            max_batch_size = tuning.max_batch_size,
            dynamic_shapes = tuning.dynamic_shapes,
            "registering TensorRT execution provider"
        );
        builder
            .with_execution_providers([ep])
            .context("failed to enable ORT TensorRT execution provider")
    }
    #[cfg(not(feature = "tensorrt"))]
    {
        let _ = (builder, device_id, tuning);
        bail!("TensorRT requested but inferlink-backend-ort was built without the `tensorrt` feature")
    }
}

fn node_info(name: &str, value_type: &ValueType) -> NodeInfo {
    match value_type {
        ValueType::Tensor { ty, shape, .. } => NodeInfo {
            name: name.to_string(),
            element_type: element_type_from_ort(*ty),
            dims: shape.iter().copied().collect(),
        },
        _ => NodeInfo {
            name: name.to_string(),
            element_type: None,
            dims: Vec::new(),
        },
    }
}

fn element_type_from_ort(ty: TensorElementType) -> Option<ElementType> {
    match ty {
        TensorElementType::Float32 => Some(ElementType::Float32),
        TensorElementType::Float64 => Some(ElementType::Float64),
        TensorElementType::Int32 => Some(ElementType::Int32),
        TensorElementType::Uint8 => Some(ElementType::Uint8),
        TensorElementType::Int16 => Some(ElementType::Int16),
        TensorElementType::Int8 => Some(ElementType::Int8),
        TensorElementType::String => Some(ElementType::String),
        TensorElementType::Int64 => Some(ElementType::Int64),
        TensorElementType::Bool => Some(ElementType::Bool),
        _ => None,
    }
}

/// Wrap a caller buffer as an ORT input, borrowing its bytes in place.
fn input_to_ort_value<'a>(input: &InputTensor<'a>) -> Result<SessionInputValue<'a>> {
    let shape = input.shape.dims().to_vec();
    ensure!(
        shape.iter().all(|d| *d > 0),
        "input {} has a non-positive dimension: {:?}",
        input.name,
        shape
    );
    let expected = shape.iter().map(|d| *d as usize).product::<usize>() * input.element_type.size_of();
    ensure!(
        input.data.len() == expected,
        "input {} byte size mismatch: got {}, expected {}",
        input.name,
        input.data.len(),
        expected
    );

    match input.element_type {
        ElementType::Float32 => typed_input::<f32>(shape, input.data),
        ElementType::Uint8 => typed_input::<u8>(shape, input.data),
        ElementType::Int32 => typed_input::<i32>(shape, input.data),
        other => bail!("unsupported tensor data type {other} for input {}", input.name),
    }
}

fn typed_input<'a, T>(shape: Vec<i64>, data: &'a [u8]) -> Result<SessionInputValue<'a>>
where
    T: PrimitiveTensorElementType + bytemuck::Pod + std::fmt::Debug,
{
    Ok(match typed_view::<T>(data) {
        Cow::Borrowed(slice) => TensorRef::from_array_view((shape, slice))?.into(),
        Cow::Owned(values) => Tensor::from_array((shape, values))?.into(),
    })
}

/// `data` as `&[T]` when it is suitably aligned.
fn typed_view<T: bytemuck::Pod>(data: &[u8]) -> Cow<'_, [T]> {
    match bytemuck::try_cast_slice(data) {
        Ok(slice) => Cow::Borrowed(slice),
        // misaligned storage: one owned copy is the only way to hand it over
        Err(_) => Cow::Owned(
            data.chunks_exact(std::mem::size_of::<T>())
                .map(bytemuck::pod_read_unaligned)
                .collect(),
        ),
    }
}

fn ort_value_to_engine_value(value: &ort::value::ValueRef<'_>) -> Result<EngineValue> {
    let ValueType::Tensor { ty, shape, .. } = value.dtype() else {
        return Ok(EngineValue::NonTensor {
            kind: format!("{:?}", value.dtype()),
        });
    };

    let shape: Vec<i64> = shape.iter().copied().collect();
    let element_type = element_type_from_ort(*ty);

    let data = match *ty {
        TensorElementType::Float32 => extract_bytes::<f32>(value)?,
        TensorElementType::Float64 => extract_bytes::<f64>(value)?,
        TensorElementType::Int32 => extract_bytes::<i32>(value)?,
        TensorElementType::Int64 => extract_bytes::<i64>(value)?,
        TensorElementType::Int16 => extract_bytes::<i16>(value)?,
        TensorElementType::Int8 => extract_bytes::<i8>(value)?,
        TensorElementType::Uint8 => extract_bytes::<u8>(value)?,
        TensorElementType::Bool => {
            let array = value.try_extract_array::<bool>()?;
            array.iter().map(|b| u8::from(*b)).collect::<Vec<_>>().into()
        }
        _ => bail!("unsupported output tensor element type: {ty}"),
    };

    Ok(EngineValue::Tensor {
        element_type,
        shape,
        data,
    })
}

fn extract_bytes<T>(value: &ort::value::ValueRef<'_>) -> Result<Bytes>
where
    T: PrimitiveTensorElementType + bytemuck::Pod,
{
    let array = value.try_extract_array::<T>()?;
    let slice = array.as_slice().context("non-contiguous output tensor")?;
    Ok(Bytes::copy_from_slice(bytemuck::cast_slice(slice)))
}
