//! C boundary
//!
//! Handles cross the boundary as non-zero `u64` ids rather than pointers, so a
//! stale or forged handle is reported as an error instead of dereferenced.
//! Every entry point returns a sentinel on failure (0 or a negative value)
//! and leaves the reason in a per-thread error slot read by
//! `llama_bridge_last_error`. Panics are caught at the boundary.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{c_char, c_int, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::backend::Backend;
use crate::error::{BridgeError, Result};
use crate::inference::{GenerateRequest, StopReason};
use crate::registry::{ModelRegistry, SharedHandle};

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

/// Overwrites the calling thread's last-error message.
pub fn set_last_error(err: &BridgeError) {
    let text = err.to_string().replace('\0', " ");
    let message = CString::new(text).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = message);
}

/// The calling thread's last-error message (empty if nothing failed yet).
pub fn last_error() -> String {
    LAST_ERROR.with(|slot| slot.borrow().to_string_lossy().into_owned())
}

/// Returns the calling thread's last error. The pointer stays valid until
/// the next failing call on the same thread.
#[no_mangle]
pub extern "C" fn llama_bridge_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ptr())
}

/// Registry plus the id table the C side addresses handles through
pub struct Bridge<B: Backend> {
    registry: ModelRegistry<B>,
    handles: Mutex<HashMap<u64, SharedHandle<B>>>,
}

impl<B: Backend> Bridge<B> {
    pub fn new(registry: ModelRegistry<B>) -> Self {
        Self {
            registry,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ModelRegistry<B> {
        &self.registry
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<u64, SharedHandle<B>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, id: u64, null_message: &'static str) -> Result<SharedHandle<B>> {
        if id == 0 {
            return Err(BridgeError::InvalidArgument(null_message));
        }
        self.handles()
            .get(&id)
            .cloned()
            .ok_or(BridgeError::UnknownHandle(id))
    }

    /// Loads or reuses the model at `path` and returns its id.
    pub fn load_model(&self, path: &str, gpu_layers: i32) -> Result<u64> {
        loop {
            let handle = self.registry.load(path, gpu_layers)?;
            if let Some(id) = self.publish(handle) {
                return Ok(id);
            }
            tracing::debug!("{} was unloaded before its id was published, loading again", path);
        }
    }

    /// Adds `handle` to the id table, unless it was unloaded after the
    /// registry returned it.
    fn publish(&self, handle: SharedHandle<B>) -> Option<u64> {
        let mut table = self.handles();
        if !handle.is_loaded() {
            return None;
        }
        let id = handle.id().get();
        table.entry(id).or_insert(handle);
        Some(id)
    }

    pub fn unload_model(&self, id: u64) -> Result<()> {
        if id == 0 {
            return Err(BridgeError::InvalidArgument("null handle passed to unload"));
        }
        let handle = {
            let mut table = self.handles();
            let handle = table.remove(&id);
            // Retired under the table lock so `publish` cannot re-add it
            if let Some(handle) = &handle {
                self.registry.retire(handle);
            }
            handle
        };
        // Already-forgotten ids are fine to unload again
        if let Some(handle) = handle {
            self.registry.unload(&handle);
        }
        Ok(())
    }

    pub fn reset_context(&self, id: u64) -> Result<()> {
        let handle = self.resolve(id, "null handle in reset_context")?;
        self.registry.reset(&handle)
    }

    pub fn apply_adapter(&self, id: u64, adapter_path: &str) -> Result<()> {
        let handle = self.resolve(id, "null argument to apply_adapter")?;
        self.registry.apply_adapter(&handle, adapter_path)
    }

    /// Generates into `out` and returns the untruncated output length.
    ///
    /// A mid-decode evaluation failure still returns the partial length, but
    /// also records the failure as the thread's last error.
    pub fn generate(&self, id: u64, request: &GenerateRequest<'_>, out: &mut [u8]) -> Result<usize> {
        let handle = self.resolve(id, "null handle to generate")?;
        if out.is_empty() {
            return Err(BridgeError::InvalidArgument("invalid output buffer"));
        }
        let generation = self.registry.generate(&handle, request)?;
        if let StopReason::EvalFailed(e) = generation.stop() {
            set_last_error(&BridgeError::Engine(e.clone()));
        }
        generation.write_c_str(out)
    }

    pub fn context_size(&self, id: u64) -> Result<u32> {
        let handle = self.resolve(id, "null handle to context_size")?;
        if !handle.is_loaded() {
            return Err(BridgeError::ModelMissing);
        }
        Ok(handle.context_len().get())
    }

    /// Unloads every model and forgets every id.
    pub fn shutdown(&self) -> usize {
        let mut table = self.handles();
        table.clear();
        for handle in self.registry.handles() {
            tracing::debug!(
                "Shutting down {} ({}), loaded at {}",
                handle.path(),
                handle.id(),
                handle.loaded_at()
            );
        }
        self.registry.unload_all()
    }
}

/// Runs `body`, turning errors and panics into `failed` plus a last-error.
fn guarded<T>(op: &'static str, failed: T, body: impl FnOnce() -> Result<T>) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            tracing::debug!("{} failed: {}", op, e);
            set_last_error(&e);
            failed
        }
        Err(_) => {
            tracing::error!("panic caught at the C boundary in {}", op);
            set_last_error(&BridgeError::Panicked(op));
            failed
        }
    }
}

/// Borrows a C string argument.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn arg_str<'a>(
    ptr: *const c_char,
    null_message: &'static str,
    utf8_message: &'static str,
) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(BridgeError::InvalidArgument(null_message));
    }
    // SAFETY: non-null and NUL-terminated per the caller contract
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| BridgeError::InvalidArgument(utf8_message))
}

/// # Safety
/// `path` must be null or a valid NUL-terminated string.
pub unsafe fn load_model_raw<B: Backend>(
    bridge: &Bridge<B>,
    path: *const c_char,
    gpu_layers: c_int,
) -> u64 {
    guarded("load_model", 0, || {
        // SAFETY: forwarded caller contract
        let path = unsafe { arg_str(path, "model path is null", "model path is not valid UTF-8") }?;
        bridge.load_model(path, gpu_layers)
    })
}

pub fn unload_model_raw<B: Backend>(bridge: &Bridge<B>, handle: u64) -> c_int {
    guarded("unload_model", -1, || bridge.unload_model(handle).map(|()| 0))
}

pub fn reset_context_raw<B: Backend>(bridge: &Bridge<B>, handle: u64) -> c_int {
    guarded("reset_context", -1, || bridge.reset_context(handle).map(|()| 0))
}

/// # Safety
/// `adapter_path` must be null or a valid NUL-terminated string.
pub unsafe fn apply_adapter_raw<B: Backend>(
    bridge: &Bridge<B>,
    handle: u64,
    adapter_path: *const c_char,
) -> c_int {
    guarded("apply_adapter", -1, || {
        if handle == 0 {
            return Err(BridgeError::InvalidArgument("null argument to apply_adapter"));
        }
        // SAFETY: forwarded caller contract
        let path = unsafe {
            arg_str(
                adapter_path,
                "null argument to apply_adapter",
                "adapter path is not valid UTF-8",
            )
        }?;
        bridge.apply_adapter(handle, path).map(|()| 0)
    })
}

/// # Safety
/// `prompt` must be null or a valid NUL-terminated string, and `out` must be
/// null or valid for writes of `out_size` bytes.
#[allow(clippy::too_many_arguments)]
pub unsafe fn generate_raw<B: Backend>(
    bridge: &Bridge<B>,
    handle: u64,
    prompt: *const c_char,
    out: *mut c_char,
    out_size: c_int,
    max_tokens: c_int,
    temperature: f32,
    top_p: f32,
    top_k: c_int,
) -> c_int {
    guarded("generate", -1, || {
        if handle == 0 {
            return Err(BridgeError::InvalidArgument("null handle to generate"));
        }
        // SAFETY: forwarded caller contract
        let prompt = unsafe { arg_str(prompt, "null prompt", "prompt is not valid UTF-8") }?;
        let capacity = usize::try_from(out_size).unwrap_or(0);
        if out.is_null() || capacity == 0 {
            return Err(BridgeError::InvalidArgument("invalid output buffer"));
        }
        // SAFETY: non-null and writable for `out_size` bytes per the caller contract
        let out = unsafe { std::slice::from_raw_parts_mut(out.cast::<u8>(), capacity) };

        let request = GenerateRequest {
            prompt,
            max_tokens,
            temperature,
            top_p,
            top_k,
        };
        let len = bridge.generate(handle, &request, out)?;
        Ok(c_int::try_from(len).unwrap_or(c_int::MAX))
    })
}

pub fn context_size_raw<B: Backend>(bridge: &Bridge<B>, handle: u64) -> c_int {
    guarded("context_size", -1, || {
        let n = bridge.context_size(handle)?;
        Ok(c_int::try_from(n).unwrap_or(c_int::MAX))
    })
}

#[cfg(feature = "llama")]
mod exports {
    //! Exported symbols, bound to the process-wide llama.cpp bridge.

    use once_cell::sync::OnceCell;

    use super::*;
    use crate::backend::llama::LlamaCppBackend;
    use crate::config::{load_config, BridgeConfig};
    use crate::logging::init_logging;

    static BRIDGE: OnceCell<Bridge<LlamaCppBackend>> = OnceCell::new();

    fn bridge_with(config: BridgeConfig) -> Result<&'static Bridge<LlamaCppBackend>> {
        BRIDGE.get_or_try_init(|| {
            let backend = LlamaCppBackend::init()?;
            tracing::info!("llama bridge v{} ready", env!("CARGO_PKG_VERSION"));
            Ok(Bridge::new(ModelRegistry::new(backend, config)))
        })
    }

    fn with_bridge<T>(failed: T, call: impl FnOnce(&'static Bridge<LlamaCppBackend>) -> T) -> T {
        if let Some(bridge) = BRIDGE.get() {
            return call(bridge);
        }
        match guarded("init", None, || bridge_with(load_config()).map(Some)) {
            Some(bridge) => call(bridge),
            None => failed,
        }
    }

    /// Loads configuration, installs logging and initializes llama.cpp.
    /// Calling it again is harmless. Returns 0 on success.
    #[no_mangle]
    pub extern "C" fn llama_bridge_init() -> c_int {
        guarded("init", -1, || {
            if BRIDGE.get().is_some() {
                return Ok(0);
            }
            let config = load_config();
            init_logging(&config.log_filter);
            bridge_with(config).map(|_| 0)
        })
    }

    /// Unloads every model. Returns how many were loaded.
    #[no_mangle]
    pub extern "C" fn llama_bridge_shutdown() -> c_int {
        match BRIDGE.get() {
            Some(bridge) => c_int::try_from(bridge.shutdown()).unwrap_or(c_int::MAX),
            None => 0,
        }
    }

    /// Returns a handle id, or 0 on failure.
    ///
    /// # Safety
    /// `path` must be null or a valid NUL-terminated string.
    #[no_mangle]
    pub unsafe extern "C" fn llama_bridge_load_model(path: *const c_char, gpu_layers: c_int) -> u64 {
        // SAFETY: forwarded caller contract
        with_bridge(0, |bridge| unsafe { load_model_raw(bridge, path, gpu_layers) })
    }

    #[no_mangle]
    pub extern "C" fn llama_bridge_unload_model(handle: u64) -> c_int {
        with_bridge(-1, |bridge| unload_model_raw(bridge, handle))
    }

    #[no_mangle]
    pub extern "C" fn llama_bridge_reset_context(handle: u64) -> c_int {
        with_bridge(-1, |bridge| reset_context_raw(bridge, handle))
    }

    /// # Safety
    /// `adapter_path` must be null or a valid NUL-terminated string.
    #[no_mangle]
    pub unsafe extern "C" fn llama_bridge_apply_adapter(
        handle: u64,
        adapter_path: *const c_char,
    ) -> c_int {
        // SAFETY: forwarded caller contract
        with_bridge(-1, |bridge| unsafe { apply_adapter_raw(bridge, handle, adapter_path) })
    }

    /// Returns the untruncated output length, or -1 on failure.
    ///
    /// # Safety
    /// `prompt` must be null or a valid NUL-terminated string, and `out` must
    /// be null or valid for writes of `out_size` bytes.
    #[no_mangle]
    #[allow(clippy::too_many_arguments)]
    pub unsafe extern "C" fn llama_bridge_generate(
        handle: u64,
        prompt: *const c_char,
        out: *mut c_char,
        out_size: c_int,
        max_tokens: c_int,
        temperature: f32,
        top_p: f32,
        top_k: c_int,
    ) -> c_int {
        with_bridge(-1, |bridge| {
            // SAFETY: forwarded caller contract
            unsafe {
                generate_raw(
                    bridge, handle, prompt, out, out_size, max_tokens, temperature, top_p, top_k,
                )
            }
        })
    }

    #[no_mangle]
    pub extern "C" fn llama_bridge_context_size(handle: u64) -> c_int {
        with_bridge(-1, |bridge| context_size_raw(bridge, handle))
    }
}
