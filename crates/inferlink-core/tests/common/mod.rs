#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::Bytes;
use inferlink_core::{
    ElementType, Engine, EngineCapabilities, EngineEnvironment, EngineSession, EngineValue,
    InputTensor, ModelSource, NodeInfo, SessionOptions,
};
use parking_lot::Mutex;

pub struct MockContext {
    dropped: Arc<AtomicUsize>,
}

impl Drop for MockContext {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted engine. Outputs named `identity` echo input 0, outputs named
/// `sum` hold the f32 sum of input 0, anything else is zero-filled to the
/// size of input 0.
pub struct MockEngine {
    env: EngineEnvironment<MockContext>,
    pub caps: EngineCapabilities,
    pub inputs: Vec<NodeInfo>,
    pub outputs: Vec<NodeInfo>,
    pub contexts_created: AtomicUsize,
    pub contexts_dropped: Arc<AtomicUsize>,
    pub runs: Arc<AtomicUsize>,
    pub fail_open: AtomicBool,
    pub fail_run: Arc<AtomicBool>,
    pub non_tensor_output: Arc<AtomicBool>,
    pub last_options: Mutex<Option<SessionOptions>>,
    pub last_model: Mutex<Option<Vec<u8>>>,
}

impl MockEngine {
    pub fn new(inputs: Vec<NodeInfo>, outputs: Vec<NodeInfo>) -> Self {
        Self {
            env: EngineEnvironment::new(),
            caps: EngineCapabilities::default(),
            inputs,
            outputs,
            contexts_created: AtomicUsize::new(0),
            contexts_dropped: Arc::new(AtomicUsize::new(0)),
            runs: Arc::new(AtomicUsize::new(0)),
            fail_open: AtomicBool::new(false),
            fail_run: Arc::new(AtomicBool::new(false)),
            non_tensor_output: Arc::new(AtomicBool::new(false)),
            last_options: Mutex::new(None),
            last_model: Mutex::new(None),
        }
    }

    /// One f32 input `x` and two f32 outputs, `identity` and `sum`.
    pub fn echo() -> Self {
        Self::new(
            vec![node("x", ElementType::Float32, &[-1, 4])],
            vec![
                node("identity", ElementType::Float32, &[-1, 4]),
                node("sum", ElementType::Float32, &[1]),
            ],
        )
    }

    pub fn with_caps(mut self, caps: EngineCapabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.contexts_dropped.load(Ordering::SeqCst)
    }

    /// `(ref_count, context_live)` of the engine environment.
    pub fn environment_snapshot(&self) -> (usize, bool) {
        self.env.snapshot()
    }
}

pub struct MockSession {
    outputs: Vec<NodeInfo>,
    inputs: Vec<NodeInfo>,
    runs: Arc<AtomicUsize>,
    fail_run: Arc<AtomicBool>,
    non_tensor_output: Arc<AtomicBool>,
}

impl Engine for MockEngine {
    type Context = MockContext;
    type Session = MockSession;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn capabilities(&self) -> EngineCapabilities {
        self.caps
    }

    fn environment(&self) -> &EngineEnvironment<MockContext> {
        &self.env
    }

    fn create_context(&self) -> Result<MockContext> {
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(MockContext {
            dropped: Arc::clone(&self.contexts_dropped),
        })
    }

    fn open_session(
        &self,
        _ctx: &MockContext,
        options: &SessionOptions,
        source: ModelSource,
    ) -> Result<MockSession> {
        if self.fail_open.load(Ordering::SeqCst) {
            bail!("corrupt model graph");
        }
        let model = match source {
            ModelSource::File(path) => std::fs::read(path)?,
            ModelSource::Memory(bytes) => bytes.to_vec(),
        };
        *self.last_model.lock() = Some(model);
        *self.last_options.lock() = Some(options.clone());
        Ok(MockSession {
            outputs: self.outputs.clone(),
            inputs: self.inputs.clone(),
            runs: Arc::clone(&self.runs),
            fail_run: Arc::clone(&self.fail_run),
            non_tensor_output: Arc::clone(&self.non_tensor_output),
        })
    }
}

impl EngineSession for MockSession {
    fn inputs(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.inputs.clone())
    }

    fn outputs(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.outputs.clone())
    }

    fn run(&mut self, inputs: &[InputTensor<'_>], output_names: &[&str]) -> Result<Vec<EngineValue>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail_run.load(Ordering::SeqCst) {
            bail!("CUDA error: an illegal memory access was encountered");
        }
        if self.non_tensor_output.load(Ordering::SeqCst) {
            return Ok(output_names
                .iter()
                .map(|_| EngineValue::NonTensor {
                    kind: "sequence".to_string(),
                })
                .collect());
        }

        let first = &inputs[0];
        output_names
            .iter()
            .map(|name| {
                let value = match *name {
                    "identity" => EngineValue::Tensor {
                        element_type: Some(first.element_type),
                        shape: first.shape.dims().to_vec(),
                        data: Bytes::copy_from_slice(first.data),
                    },
                    "sum" => {
                        let sum: f32 = first
                            .data
                            .chunks_exact(4)
                            .map(bytemuck::pod_read_unaligned::<f32>)
                            .sum();
                        EngineValue::Tensor {
                            element_type: Some(ElementType::Float32),
                            shape: vec![1],
                            data: Bytes::copy_from_slice(&sum.to_ne_bytes()),
                        }
                    }
                    _ => EngineValue::Tensor {
                        element_type: Some(first.element_type),
                        shape: first.shape.dims().to_vec(),
                        data: Bytes::from(vec![0u8; first.data.len()]),
                    },
                };
                Ok(value)
            })
            .collect()
    }
}

pub fn node(name: &str, ty: ElementType, dims: &[i64]) -> NodeInfo {
    NodeInfo {
        name: name.to_string(),
        element_type: Some(ty),
        dims: dims.to_vec(),
    }
}

/// A model file with deterministic contents.
pub fn model_file(len: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".onnx")
        .tempfile()
        .expect("create model file");
    let bytes: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
    file.write_all(&bytes).expect("write model file");
    file.flush().expect("flush model file");
    file
}

pub fn model_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}
