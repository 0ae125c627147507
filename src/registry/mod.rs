//! Model registry
//!
//! Maps a model path to its single live [`ModelHandle`]. The map lock only
//! covers lookup, insert and erase; native loads and context creation run
//! outside it so unrelated models never wait on a slow load.

pub mod adapter;
pub mod handle;

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::backend::{Backend, ModelParams, NativeModel};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

pub use handle::{HandleId, HandleInfo, ModelHandle};

/// Shared reference to a handle of backend `B`
pub type SharedHandle<B> = Arc<ModelHandle<<B as Backend>::Model>>;

pub struct ModelRegistry<B: Backend> {
    backend: B,
    config: BridgeConfig,
    models: Mutex<HashMap<String, SharedHandle<B>>>,
    next_id: AtomicU64,
}

impl<B: Backend> ModelRegistry<B> {
    pub fn new(backend: B, mut config: BridgeConfig) -> Self {
        config.validate();
        Self {
            backend,
            config,
            models: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn models(&self) -> MutexGuard<'_, HashMap<String, SharedHandle<B>>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the handle registered under `path`, if any.
    pub fn get(&self, path: &str) -> Option<SharedHandle<B>> {
        self.models().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.models().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models().is_empty()
    }

    /// Snapshot of every registered handle.
    pub fn handles(&self) -> Vec<SharedHandle<B>> {
        self.models().values().cloned().collect()
    }

    /// Returns the handle for `path`, loading the model on a miss.
    ///
    /// `gpu_layers` only matters on a miss: an existing handle is returned
    /// as-is, whatever layer count it was loaded with. Two callers racing on
    /// the same new path may both load; the second to publish drops its copy
    /// and gets the published handle.
    pub fn load(&self, path: &str, gpu_layers: i32) -> Result<SharedHandle<B>> {
        if path.is_empty() {
            return Err(BridgeError::InvalidArgument("model path is empty"));
        }
        if let Some(existing) = self.get(path) {
            tracing::debug!("Reusing {} for {}", existing.id(), path);
            return Ok(existing);
        }

        let started = Instant::now();
        let params = ModelParams::with_gpu_layers(gpu_layers);
        let mut model = self
            .backend
            .load_model(Path::new(path), &params)
            .inspect_err(|e| tracing::warn!("Model load failed for {}: {}", path, e))?;

        let n_ctx = self.context_len();
        // On failure the model is dropped here, before anything is published
        let context = model
            .new_context(n_ctx)
            .inspect_err(|e| tracing::warn!("Context creation failed for {}: {}", path, e))?;

        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(ModelHandle::new(id, path.to_string(), n_ctx, model, context));

        let published = {
            let mut models = self.models();
            Arc::clone(
                models
                    .entry(path.to_string())
                    .or_insert_with(|| Arc::clone(&handle)),
            )
        };

        if !Arc::ptr_eq(&published, &handle) {
            tracing::debug!(
                "Concurrent load of {} lost the race, keeping {}",
                path,
                published.id()
            );
            handle.release();
            return Ok(published);
        }

        tracing::info!(
            "Model loaded: {} as {} (n_ctx {}, gpu layers {:?}, {:?})",
            path,
            id,
            n_ctx,
            params.gpu_layers,
            started.elapsed()
        );
        Ok(handle)
    }

    /// Unregisters `handle`, then frees its context and model.
    ///
    /// The registry entry is only removed if it still refers to this handle,
    /// so unloading twice or unloading a stale handle is harmless.
    pub fn unload(&self, handle: &SharedHandle<B>) {
        self.retire(handle);
        if handle.release() {
            tracing::info!("Model unloaded: {} ({})", handle.path(), handle.id());
        }
    }

    /// Unregisters `handle` and marks it unloaded in one map critical
    /// section, so no lookup can return it afterwards. Native state is left
    /// to [`ModelHandle::release`], which may wait for a running decode.
    pub(crate) fn retire(&self, handle: &SharedHandle<B>) {
        let mut models = self.models();
        if models
            .get(handle.path())
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            models.remove(handle.path());
        }
        handle.retire();
    }

    /// Replaces the handle's context with a fresh one of the same length.
    pub fn reset(&self, handle: &ModelHandle<B::Model>) -> Result<()> {
        let mut guard = handle.lock();
        let slot = &mut *guard;
        let model = slot.model.as_mut().ok_or(BridgeError::ModelMissing)?;

        drop(slot.context.take());
        let context = model
            .new_context(handle.context_len())
            .inspect_err(|e| tracing::warn!("Failed to recreate context for {}: {}", handle.path(), e))?;
        slot.context = Some(context);

        tracing::info!("Context reset for {} ({})", handle.path(), handle.id());
        Ok(())
    }

    /// Unloads every registered handle and returns how many there were.
    pub fn unload_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut models = self.models();
            models
                .drain()
                .map(|(_, handle)| {
                    handle.retire();
                    handle
                })
                .collect()
        };
        for handle in &drained {
            handle.release();
        }
        if !drained.is_empty() {
            tracing::info!("Unloaded {} model(s)", drained.len());
        }
        drained.len()
    }

    /// Engine default context length, or the configured fallback.
    fn context_len(&self) -> NonZeroU32 {
        u32::try_from(self.backend.default_context_len())
            .ok()
            .and_then(NonZeroU32::new)
            .or_else(|| NonZeroU32::new(self.config.fallback_context_len))
            .unwrap_or(NonZeroU32::MIN)
    }
}
