//! Reference-counted engine context shared across sessions.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{InferError, Result};

struct Slot<C> {
    context: Option<Arc<C>>,
    refs: usize,
}

/// Holds at most one live engine context.
///
/// The context is created when the count goes from 0 to 1 and dropped when it
/// returns to 0. All transitions happen under one lock, always the innermost
/// one taken, so concurrent opens never double-create and concurrent
/// releases never destroy a context that is still referenced.
///
/// `new` is `const`, so a backend can keep its environment in a `static`.
pub struct EngineEnvironment<C> {
    slot: Mutex<Slot<C>>,
}

impl<C> EngineEnvironment<C> {
    pub const fn new() -> Self {
        Self {
            slot: parking_lot::const_mutex(Slot {
                context: None,
                refs: 0,
            }),
        }
    }

    /// Take a reference, creating the context on first use.
    ///
    /// If `create` fails the count is left unchanged.
    pub fn acquire<F>(&self, create: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> Result<C>,
    {
        let mut slot = self.slot.lock();
        let ctx = match &slot.context {
            Some(ctx) => Arc::clone(ctx),
            None => {
                let ctx = Arc::new(create()?);
                info!("engine environment created");
                slot.context = Some(Arc::clone(&ctx));
                ctx
            }
        };
        slot.refs += 1;
        debug!(refs = slot.refs, "engine environment acquired");
        Ok(ctx)
    }

    /// Drop a reference, destroying the context when it was the last one.
    pub fn release(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.refs == 0 {
            return Err(InferError::failed(
                "engine environment released more times than acquired",
            ));
        }
        slot.refs -= 1;
        debug!(refs = slot.refs, "engine environment released");
        if slot.refs == 0 {
            // dropped while the lock is held so a racing acquire cannot see it
            slot.context = None;
            info!("engine environment destroyed");
        }
        Ok(())
    }

    pub fn ref_count(&self) -> usize {
        self.slot.lock().refs
    }

    pub fn is_live(&self) -> bool {
        self.slot.lock().context.is_some()
    }

    /// `(ref_count, is_live)` read under a single lock.
    pub fn snapshot(&self) -> (usize, bool) {
        let slot = self.slot.lock();
        (slot.refs, slot.context.is_some())
    }
}

impl<C> Default for EngineEnvironment<C> {
    fn default() -> Self {
        Self::new()
    }
}
