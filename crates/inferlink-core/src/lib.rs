//! inferlink-core: typed tensor buffers, model sessions and the shared engine
//! environment behind them.
//!
//! An embedder describes its tensors, allocates them, binds them to a model
//! session and runs inference in place:
//!
//! ```ignore
//! use inferlink_core::{ElementType, ModelConfig, Runtime, TensorDescriptor};
//!
//! let runtime = Runtime::new(engine);
//! let (inputs, outputs) = runtime.init_tensors(
//!     &[TensorDescriptor::new("input_1", ElementType::Float32, &[1, 3, 224, 224])?],
//!     &[TensorDescriptor::new("logits", ElementType::Float32, &[1, 1000])?],
//! )?;
//! let config = ModelConfig::builder("models/classifier.onnx").build()?;
//! let session = runtime.load_model(&config, inputs, outputs)?;
//! runtime.run_inference(&session)?;
//! let logits = session.outputs().get(0).unwrap().to_vec::<f32>()?;
//! ```
//!
//! Engines plug in through [`Engine`]; see `inferlink-backend-ort`.

pub mod arena;
pub mod config;
pub mod decrypt;
pub mod engine;
pub mod environment;
pub mod error;
pub mod marshal;
pub mod runtime;
pub mod session;
pub mod tensor;

pub use arena::TensorArena;
pub use config::{
    AcceleratorTuning, Device, EncryptedRange, GpuMemory, ModelConfig, ModelConfigBuilder,
    ModelFormat, OptimizeLevel, Precision, ENCRYPTION_BLOCK,
};
pub use decrypt::{AesBlockDecryptor, ModelDecryptor};
pub use engine::{
    Engine, EngineCapabilities, EngineSession, EngineValue, ExecutionProvider, InputTensor,
    ModelSource, NodeInfo, SessionOptions,
};
pub use environment::EngineEnvironment;
pub use error::{EngineStage, ErrorKind, InferError, LoadError, Result, ResultCode};
pub use marshal::InferenceMarshaler;
pub use runtime::Runtime;
pub use session::{ModelSession, SessionState, TensorSetGuard};
pub use tensor::{
    ElementType, Shape, TensorBuffer, TensorDescriptor, TensorElement, TensorSet, MAX_NAME_LEN,
    MAX_RANK,
};
