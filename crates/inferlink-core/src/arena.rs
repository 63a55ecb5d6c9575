use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::tensor::{check_name, TensorBuffer, TensorDescriptor, TensorSet};

/// Counts one live buffer for the arena that created it.
#[derive(Debug)]
pub(crate) struct LiveToken(Arc<AtomicUsize>);

impl LiveToken {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Allocates [`TensorSet`]s from descriptor lists.
///
/// Buffers are freed when their set is dropped or passed to
/// [`TensorArena::release`]; [`TensorArena::outstanding`] reports how many
/// buffers allocated by this arena are still alive.
#[derive(Clone, Debug, Default)]
pub struct TensorArena {
    live: Arc<AtomicUsize>,
}

impl TensorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate one zero-filled buffer per descriptor, in order.
    ///
    /// On failure every buffer already allocated for this call is freed
    /// before the error is returned.
    pub fn allocate(&self, descriptors: &[TensorDescriptor]) -> Result<TensorSet> {
        self.build(descriptors, None)
    }

    /// Like [`Self::allocate`], tagging the set with a signature name.
    pub fn allocate_signed(
        &self,
        descriptors: &[TensorDescriptor],
        signature: impl Into<String>,
    ) -> Result<TensorSet> {
        let signature = signature.into();
        check_name(&signature)?;
        self.build(descriptors, Some(signature))
    }

    fn build(&self, descriptors: &[TensorDescriptor], signature: Option<String>) -> Result<TensorSet> {
        let mut buffers = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            let mut desc = desc.clone();
            desc.recompute()?;
            // an early return drops `buffers`, releasing the partial batch
            buffers.push(TensorBuffer::tracked(desc, LiveToken::new(&self.live))?);
        }
        let set = TensorSet::from_parts(buffers, signature);
        debug!(tensors = set.len(), bytes = set.total_bytes(), "allocated tensor set");
        Ok(set)
    }

    /// Free every buffer in `set`.
    pub fn release(&self, set: TensorSet) -> Result<()> {
        debug!(tensors = set.len(), "releasing tensor set");
        drop(set);
        Ok(())
    }

    pub fn outstanding(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}
