//! Model handles
//!
//! A handle owns one loaded model and its decoding context. All access to the
//! native pair goes through the handle's slot lock, which also serializes
//! decoding on a single handle.

use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::NativeModel;

/// Process-unique identifier of a handle; never reused after unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of a handle for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub id: HandleId,
    pub path: String,
    pub context_len: u32,
    pub loaded_at: DateTime<Utc>,
    pub loaded: bool,
    pub adapters: Vec<PathBuf>,
}

/// Native state guarded by the handle lock.
///
/// Field order matters: the context is dropped before the model it was
/// created from.
pub(crate) struct Slot<M: NativeModel> {
    pub(crate) context: Option<M::Context>,
    pub(crate) model: Option<M>,
    pub(crate) adapters: Vec<PathBuf>,
}

pub struct ModelHandle<M: NativeModel> {
    id: HandleId,
    path: String,
    n_ctx: NonZeroU32,
    loaded_at: DateTime<Utc>,
    /// Cleared on unload before the slot is torn down; readable while a
    /// decode holds the slot lock.
    loaded: AtomicBool,
    slot: Mutex<Slot<M>>,
}

impl<M: NativeModel> ModelHandle<M> {
    pub(crate) fn new(
        id: HandleId,
        path: String,
        n_ctx: NonZeroU32,
        model: M,
        context: M::Context,
    ) -> Self {
        Self {
            id,
            path,
            n_ctx,
            loaded_at: Utc::now(),
            loaded: AtomicBool::new(true),
            slot: Mutex::new(Slot {
                context: Some(context),
                model: Some(model),
                adapters: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Path the handle is registered under
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Context window length fixed at load time
    pub fn context_len(&self) -> NonZeroU32 {
        self.n_ctx
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// False once the handle has been unloaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Marks the handle unloaded without touching the native slot.
    pub(crate) fn retire(&self) {
        self.loaded.store(false, Ordering::Release);
    }

    pub fn info(&self) -> HandleInfo {
        let slot = self.lock();
        HandleInfo {
            id: self.id,
            path: self.path.clone(),
            context_len: self.n_ctx.get(),
            loaded_at: self.loaded_at,
            loaded: self.is_loaded(),
            adapters: slot.adapters.clone(),
        }
    }

    /// Locks the native slot. A panic in another decode leaves the slot
    /// usable; the native objects hold no Rust invariants of their own.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Slot<M>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frees the context, then the model. Returns false if the model was
    /// already gone.
    pub(crate) fn release(&self) -> bool {
        self.retire();
        let mut slot = self.lock();
        drop(slot.context.take());
        let freed = slot.model.take().is_some();
        slot.adapters.clear();
        freed
    }
}

impl<M: NativeModel> fmt::Debug for ModelHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("n_ctx", &self.n_ctx)
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}
