use std::sync::Arc;

use tracing::info;

use crate::arena::TensorArena;
use crate::config::ModelConfig;
use crate::decrypt::ModelDecryptor;
use crate::engine::Engine;
use crate::error::{LoadError, Result};
use crate::session::ModelSession;
use crate::tensor::{TensorDescriptor, TensorSet};

/// Entry point for embedders: allocate tensors, load models, run them.
pub struct Runtime<E: Engine> {
    engine: Arc<E>,
    arena: TensorArena,
    decryptor: Option<Arc<dyn ModelDecryptor>>,
}

impl<E: Engine> Runtime<E> {
    pub fn new(engine: E) -> Self {
        Self::from_shared(Arc::new(engine))
    }

    pub fn from_shared(engine: Arc<E>) -> Self {
        Self {
            engine,
            arena: TensorArena::new(),
            decryptor: None,
        }
    }

    pub fn with_decryptor(mut self, decryptor: impl ModelDecryptor + 'static) -> Self {
        self.decryptor = Some(Arc::new(decryptor));
        self
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn arena(&self) -> &TensorArena {
        &self.arena
    }

    /// Allocate input and output sets. If the outputs fail, the inputs are
    /// freed before the error is returned.
    pub fn init_tensors(
        &self,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
    ) -> Result<(TensorSet, TensorSet)> {
        let input_set = self.arena.allocate(inputs)?;
        let output_set = self.arena.allocate(outputs)?;
        Ok((input_set, output_set))
    }

    pub fn deinit_tensors(&self, inputs: TensorSet, outputs: TensorSet) -> Result<()> {
        self.arena.release(inputs)?;
        self.arena.release(outputs)
    }

    /// Create and open a session bound to `inputs` and `outputs`.
    ///
    /// On failure the sets come back inside the [`LoadError`], untouched.
    pub fn load_model(
        &self,
        config: &ModelConfig,
        inputs: TensorSet,
        outputs: TensorSet,
    ) -> std::result::Result<ModelSession<E>, LoadError> {
        let mut session = ModelSession::new(Arc::clone(&self.engine), config, inputs, outputs);
        if let Some(decryptor) = &self.decryptor {
            session = session.with_decryptor(Arc::clone(decryptor));
        }
        match session.open() {
            Ok(()) => Ok(session),
            Err(error) => {
                let (inputs, outputs) = session.take_tensors();
                Err(LoadError {
                    error,
                    inputs,
                    outputs,
                })
            }
        }
    }

    /// Release a session and return its tensor sets for [`Self::deinit_tensors`].
    pub fn release_model(&self, session: ModelSession<E>) -> Result<(TensorSet, TensorSet)> {
        let sets = session.into_tensors()?;
        info!(live_buffers = self.arena.outstanding(), "session released");
        Ok(sets)
    }

    /// Run one inference; results land in the session's output set.
    pub fn run_inference(&self, session: &ModelSession<E>) -> Result<()> {
        session.run()
    }
}
