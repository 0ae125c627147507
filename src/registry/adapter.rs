//! LoRA adapter application
//!
//! Adapters are attached to the handle's model, so they are seen by its
//! current context, by every context created on reset, and by every caller
//! that looks the same path up in the registry.

use std::path::PathBuf;

use crate::backend::{Backend, NativeModel};
use crate::error::{BridgeError, Result};
use crate::registry::{ModelHandle, ModelRegistry};

impl<B: Backend> ModelRegistry<B> {
    /// Applies the adapter at `adapter_path` to `handle`'s model.
    ///
    /// Applying a path that is already on the handle is a no-op.
    pub fn apply_adapter(&self, handle: &ModelHandle<B::Model>, adapter_path: &str) -> Result<()> {
        if adapter_path.is_empty() {
            return Err(BridgeError::InvalidArgument("adapter path is empty"));
        }

        let mut guard = handle.lock();
        let slot = &mut *guard;
        let model = slot.model.as_mut().ok_or(BridgeError::ModelMissing)?;

        if !self.backend().supports_adapters() {
            return Err(BridgeError::AdaptersUnsupported);
        }

        let path = PathBuf::from(adapter_path);
        if slot.adapters.contains(&path) {
            tracing::debug!("Adapter {} already on {}", adapter_path, handle.id());
            return Ok(());
        }

        let scale = self.config().adapter_scale;
        model
            .apply_adapter(&path, scale, slot.context.as_mut())
            .inspect_err(|e| tracing::warn!("Adapter {} rejected: {}", adapter_path, e))?;
        slot.adapters.push(path);

        tracing::info!(
            "Applied adapter {} to {} ({}, scale {})",
            adapter_path,
            handle.path(),
            handle.id(),
            scale
        );
        Ok(())
    }
}
