use std::path::PathBuf;

use anyhow::Result;
use bytes::Bytes;

use crate::config::{AcceleratorTuning, ModelFormat, OptimizeLevel};
use crate::environment::EngineEnvironment;
use crate::tensor::{ElementType, Shape};

#[derive(Clone, Copy, Debug, Default)]
pub struct EngineCapabilities {
    pub supports_cuda: bool,
    pub supports_tensorrt: bool,
}

/// Execution providers in priority order; the engine tries them first to last
/// and falls back to its CPU kernels.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionProvider {
    Cuda {
        device_id: u32,
    },
    TensorRt {
        device_id: u32,
        tuning: AcceleratorTuning,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionOptions {
    pub intra_op_threads: usize,
    pub optimize_level: OptimizeLevel,
    pub model_format: ModelFormat,
    pub providers: Vec<ExecutionProvider>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            intra_op_threads: 1,
            optimize_level: OptimizeLevel::default(),
            model_format: ModelFormat::default(),
            providers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ModelSource {
    File(PathBuf),
    /// Decrypted model bytes, parsed directly by the engine.
    Memory(Bytes),
}

/// Metadata of one model input or output node, as the engine reports it.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    /// `None` when the engine type has no [`ElementType`] counterpart.
    pub element_type: Option<ElementType>,
    /// Negative entries are dynamic dimensions.
    pub dims: Vec<i64>,
}

/// A borrowed input handed to [`EngineSession::run`].
#[derive(Clone, Copy, Debug)]
pub struct InputTensor<'a> {
    pub name: &'a str,
    pub element_type: ElementType,
    pub shape: &'a Shape,
    pub data: &'a [u8],
}

/// A value returned by the engine.
#[derive(Clone, Debug)]
pub enum EngineValue {
    Tensor {
        element_type: Option<ElementType>,
        shape: Vec<i64>,
        data: Bytes,
    },
    /// Sequences, maps and other non-tensor values.
    NonTensor { kind: String },
}

pub trait Engine: Send + Sync + 'static {
    /// Native runtime context shared by every session of this engine.
    type Context: Send + Sync + 'static;
    type Session: EngineSession;

    fn name(&self) -> &'static str;
    fn capabilities(&self) -> EngineCapabilities;

    /// Reference-counted slot holding this engine's context.
    fn environment(&self) -> &EngineEnvironment<Self::Context>;

    fn create_context(&self) -> Result<Self::Context>;
    fn open_session(
        &self,
        ctx: &Self::Context,
        options: &SessionOptions,
        source: ModelSource,
    ) -> Result<Self::Session>;
}

pub trait EngineSession: Send + 'static {
    fn inputs(&self) -> Result<Vec<NodeInfo>>;
    fn outputs(&self) -> Result<Vec<NodeInfo>>;

    /// Returns one value per entry of `output_names`, in the same order.
    fn run(&mut self, inputs: &[InputTensor<'_>], output_names: &[&str]) -> Result<Vec<EngineValue>>;
}
