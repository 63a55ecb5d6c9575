//! Model session state machine.
//!
//! ```text
//! Closed --open--> Opening --ok--> Open --run--> Running --done--> Open
//!    ^                |                                              |
//!    +----- error ----+------------------ release -------------------+
//! ```
//!
//! One mutex per session serializes `open`, `run` and `release`. The shared
//! engine environment has its own lock inside [`EngineEnvironment`], which is
//! only ever taken while this one is held, never the other way around.
//!
//! [`EngineEnvironment`]: crate::environment::EngineEnvironment

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use bytes::Bytes;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{Device, ModelConfig, OptimizeLevel};
use crate::decrypt::ModelDecryptor;
use crate::engine::{Engine, EngineSession, ExecutionProvider, ModelSource, NodeInfo, SessionOptions};
use crate::error::{EngineStage, InferError, Result};
use crate::marshal::InferenceMarshaler;
use crate::tensor::TensorSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Running,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Running => "running",
        };
        f.write_str(s)
    }
}

struct Inner<E: Engine> {
    state: SessionState,
    context: Option<Arc<E::Context>>,
    options: Option<SessionOptions>,
    session: Option<E::Session>,
    input_nodes: Vec<NodeInfo>,
    output_nodes: Vec<NodeInfo>,
    inputs: TensorSet,
    outputs: TensorSet,
}

/// One model bound to its input and output tensor sets.
///
/// All methods take `&self`, so a session can be shared as
/// `Arc<ModelSession<E>>`; calls are serialized internally. Guards returned by
/// [`Self::inputs`] and [`Self::outputs`] hold the session lock. While the
/// current thread holds one, [`Self::open`], [`Self::run`] and
/// [`Self::release`] fail with `InvalidState` instead of blocking, and the
/// closure forms [`Self::with_inputs`] and [`Self::with_outputs`] never leak a
/// guard at all.
pub struct ModelSession<E: Engine> {
    engine: Arc<E>,
    config: ModelConfig,
    decryptor: Option<Arc<dyn ModelDecryptor>>,
    inner: Mutex<Inner<E>>,
    /// Thread holding a [`TensorSetGuard`], if any.
    borrower: Mutex<Option<ThreadId>>,
}

/// Borrow of a session's input or output set.
///
/// Holds the session lock until dropped.
pub struct TensorSetGuard<'a> {
    set: MappedMutexGuard<'a, TensorSet>,
    borrower: &'a Mutex<Option<ThreadId>>,
}

impl Deref for TensorSetGuard<'_> {
    type Target = TensorSet;

    fn deref(&self) -> &TensorSet {
        &self.set
    }
}

impl DerefMut for TensorSetGuard<'_> {
    fn deref_mut(&mut self) -> &mut TensorSet {
        &mut self.set
    }
}

impl Drop for TensorSetGuard<'_> {
    fn drop(&mut self) {
        // cleared before `set` unlocks the session
        *self.borrower.lock() = None;
    }
}

impl<E: Engine> ModelSession<E> {
    /// Create a closed session. `config` is copied; later changes by the
    /// caller are not observed.
    pub fn new(engine: Arc<E>, config: &ModelConfig, inputs: TensorSet, outputs: TensorSet) -> Self {
        Self {
            engine,
            config: config.clone(),
            decryptor: None,
            inner: Mutex::new(Inner {
                state: SessionState::Closed,
                context: None,
                options: None,
                session: None,
                input_nodes: Vec::new(),
                output_nodes: Vec::new(),
                inputs,
                outputs,
            }),
            borrower: Mutex::new(None),
        }
    }

    /// Decryptor used when the config marks the model as encrypted.
    pub fn with_decryptor(mut self, decryptor: Arc<dyn ModelDecryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn input_nodes(&self) -> Vec<NodeInfo> {
        self.inner.lock().input_nodes.clone()
    }

    pub fn output_nodes(&self) -> Vec<NodeInfo> {
        self.inner.lock().output_nodes.clone()
    }

    /// Options the engine session was opened with, while open.
    pub fn session_options(&self) -> Option<SessionOptions> {
        self.inner.lock().options.clone()
    }

    /// Lock the bound input set. Do not nest with [`Self::outputs`].
    pub fn inputs(&self) -> TensorSetGuard<'_> {
        self.guard(|inner| &mut inner.inputs)
    }

    /// Lock the bound output set. Do not nest with [`Self::inputs`].
    pub fn outputs(&self) -> TensorSetGuard<'_> {
        self.guard(|inner| &mut inner.outputs)
    }

    pub fn with_inputs<R>(&self, f: impl FnOnce(&mut TensorSet) -> R) -> R {
        f(&mut self.inputs())
    }

    pub fn with_outputs<R>(&self, f: impl FnOnce(&mut TensorSet) -> R) -> R {
        f(&mut self.outputs())
    }

    fn guard(&self, pick: impl FnOnce(&mut Inner<E>) -> &mut TensorSet) -> TensorSetGuard<'_> {
        let set = MutexGuard::map(self.inner.lock(), pick);
        *self.borrower.lock() = Some(thread::current().id());
        TensorSetGuard {
            set,
            borrower: &self.borrower,
        }
    }

    /// Take the session lock for `op`, refusing when this thread already
    /// holds it through a [`TensorSetGuard`].
    fn lock_for(&self, op: &'static str) -> Result<MutexGuard<'_, Inner<E>>> {
        if *self.borrower.lock() == Some(thread::current().id()) {
            return Err(InferError::InvalidState {
                op,
                state: "tensors borrowed".to_string(),
            });
        }
        Ok(self.inner.lock())
    }

    /// Open the model against the engine.
    ///
    /// On any failure everything acquired so far is released and the session
    /// is left `Closed`.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.lock_for("open")?;
        if inner.state != SessionState::Closed {
            return Err(InferError::InvalidState {
                op: "open",
                state: inner.state.to_string(),
            });
        }
        self.config.validate()?;

        inner.state = SessionState::Opening;
        match self.open_locked(&mut inner) {
            Ok(()) => {
                inner.state = SessionState::Open;
                info!(
                    engine = self.engine.name(),
                    model = %self.config.model_path.display(),
                    inputs = inner.input_nodes.len(),
                    outputs = inner.output_nodes.len(),
                    "model opened"
                );
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, model = %self.config.model_path.display(), "model open failed");
                if let Err(release_err) = teardown(self.engine.as_ref(), &mut inner) {
                    warn!(error = %release_err, "rollback after failed open");
                }
                inner.state = SessionState::Closed;
                Err(err)
            }
        }
    }

    fn open_locked(&self, inner: &mut Inner<E>) -> Result<()> {
        let engine = self.engine.as_ref();
        let ctx = engine.environment().acquire(|| {
            engine
                .create_context()
                .map_err(|e| InferError::engine(EngineStage::CreateEnvironment, e))
        })?;
        inner.context = Some(Arc::clone(&ctx));

        let options = self.build_options();
        let path = self.config.resolved_model_path()?;

        let source = match &self.config.encryption {
            Some(range) => {
                let decryptor = self
                    .decryptor
                    .as_ref()
                    .ok_or(InferError::ParamNull("decryptor"))?;
                let (start_block, block_count) = range.blocks();
                info!(model = %path.display(), start_block, block_count, "loading encrypted model");
                let bytes = decryptor.decrypt_blocks(&path, start_block, block_count)?;
                ModelSource::Memory(Bytes::from(bytes))
            }
            None => {
                if !path.exists() {
                    return Err(InferError::FileNotFound(path));
                }
                info!(model = %path.display(), "loading model");
                ModelSource::File(path)
            }
        };

        let session = engine
            .open_session(&ctx, &options, source)
            .map_err(|e| InferError::engine(EngineStage::OpenSession, e))?;

        let input_nodes = session
            .inputs()
            .map_err(|e| InferError::engine(EngineStage::Introspect, e))?;
        let output_nodes = session
            .outputs()
            .map_err(|e| InferError::engine(EngineStage::Introspect, e))?;
        log_nodes("input", &input_nodes);
        log_nodes("output", &output_nodes);

        inner.options = Some(options);
        inner.session = Some(session);
        inner.input_nodes = input_nodes;
        inner.output_nodes = output_nodes;
        Ok(())
    }

    fn build_options(&self) -> SessionOptions {
        let mut providers = Vec::new();
        if self.config.device == Device::Gpu {
            let caps = self.engine.capabilities();
            let device_id = self.config.gpu_id;
            if self.config.optimize_level > OptimizeLevel::Disabled && caps.supports_tensorrt {
                providers.push(ExecutionProvider::TensorRt {
                    device_id,
                    tuning: self.config.accelerator.clone(),
                });
            }
            if !caps.supports_cuda {
                warn!(engine = self.engine.name(), "GPU requested but the engine reports no CUDA support");
            }
            providers.push(ExecutionProvider::Cuda { device_id });
        }
        SessionOptions {
            intra_op_threads: 1,
            optimize_level: self.config.optimize_level,
            model_format: self.config.model_format,
            providers,
        }
    }

    /// Run one inference. Results are written into the bound output set.
    pub fn run(&self) -> Result<()> {
        let mut inner = self.lock_for("run")?;
        if inner.state != SessionState::Open {
            return Err(InferError::InvalidState {
                op: "run",
                state: inner.state.to_string(),
            });
        }
        inner.state = SessionState::Running;
        let result = run_locked(&mut inner);
        inner.state = SessionState::Open;
        if let Err(err) = &result {
            debug!(error = %err, "inference failed");
        }
        result
    }

    /// Release engine resources. Safe to call in any state; the session can
    /// be opened again afterwards.
    pub fn release(&self) -> Result<()> {
        let mut inner = self.lock_for("release")?;
        let was = inner.state;
        let result = teardown(self.engine.as_ref(), &mut inner);
        inner.state = SessionState::Closed;
        if was != SessionState::Closed {
            info!(model = %self.config.model_path.display(), "model released");
        }
        result
    }

    /// Release the session and hand back its tensor sets.
    pub fn into_tensors(self) -> Result<(TensorSet, TensorSet)> {
        self.release()?;
        Ok(self.take_tensors())
    }

    /// Move both sets out, leaving empty ones bound.
    pub(crate) fn take_tensors(&self) -> (TensorSet, TensorSet) {
        let mut inner = self.inner.lock();
        let inputs = std::mem::take(&mut inner.inputs);
        let outputs = std::mem::take(&mut inner.outputs);
        (inputs, outputs)
    }
}

impl<E: Engine> fmt::Debug for ModelSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("ModelSession");
        out.field("engine", &self.engine.name())
            .field("model", &self.config.model_path);
        match self.inner.try_lock() {
            Some(inner) => out.field("state", &inner.state),
            None => out.field("state", &format_args!("<locked>")),
        };
        out.finish_non_exhaustive()
    }
}

fn run_locked<E: Engine>(inner: &mut Inner<E>) -> Result<()> {
    let Inner {
        session,
        input_nodes,
        output_nodes,
        inputs,
        outputs,
        ..
    } = inner;

    let session = session
        .as_mut()
        .ok_or_else(|| InferError::failed("session has no engine handle"))?;
    let marshaler = InferenceMarshaler::new(input_nodes, output_nodes);

    marshaler.check_inputs(inputs)?;
    let output_names = marshaler.output_names(outputs)?;
    let views = marshaler.input_views(inputs);

    let values = session
        .run(&views, &output_names)
        .map_err(|e| InferError::engine(EngineStage::Run, e))?;

    marshaler.write_outputs(outputs, &values)
}

/// Drop engine handles and give back the environment reference, if held.
fn teardown<E: Engine>(engine: &E, inner: &mut Inner<E>) -> Result<()> {
    inner.session = None;
    inner.options = None;
    inner.input_nodes.clear();
    inner.output_nodes.clear();
    match inner.context.take() {
        Some(ctx) => {
            drop(ctx);
            engine.environment().release()
        }
        None => Ok(()),
    }
}

fn log_nodes(kind: &str, nodes: &[NodeInfo]) {
    debug!(kind, count = nodes.len(), "model nodes");
    for (i, node) in nodes.iter().enumerate() {
        debug!(
            kind,
            index = i,
            name = %node.name,
            element_type = ?node.element_type,
            dims = ?node.dims,
            "model node"
        );
    }
}

impl<E: Engine> Drop for ModelSession<E> {
    fn drop(&mut self) {
        let engine = self.engine.as_ref();
        let inner = self.inner.get_mut();
        if inner.context.is_some() {
            if let Err(err) = teardown(engine, inner) {
                warn!(error = %err, "releasing dropped session");
            }
        }
    }
}
