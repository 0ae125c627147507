//! Scripted backend for unit tests
//!
//! Tokenizes on whitespace, hands out a fixed token script after priming and
//! records every native lifecycle event in a shared [`Probe`].

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use super::{
    Backend, EngineError, ModelParams, NativeContext, NativeModel, SamplingStrategy, Token,
};

pub(crate) const EOS: i32 = 2;

#[derive(Debug, Default)]
pub(crate) struct Probe {
    events: Mutex<Vec<String>>,
    pub loads: AtomicUsize,
    pub live_models: AtomicIsize,
    pub live_contexts: AtomicIsize,
    pub live_samplers: AtomicIsize,
    pub greedy_samplers: AtomicUsize,
    pub random_samplers: AtomicUsize,
    pub gpu_layers: Mutex<Vec<Option<u32>>>,
}

impl Probe {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }
}

/// Holds loads of one path until the test lets them through.
///
/// Every gated load waits on `entered`, then on `release`. Size both
/// barriers for the gated loaders plus the test thread.
#[derive(Debug, Clone)]
pub(crate) struct LoadGate {
    pub path: String,
    pub entered: Arc<Barrier>,
    pub release: Arc<Barrier>,
}

impl LoadGate {
    pub fn new(path: &str, loaders: usize) -> Self {
        Self {
            path: path.to_string(),
            entered: Arc::new(Barrier::new(loaders + 1)),
            release: Arc::new(Barrier::new(loaders + 1)),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Script {
    /// Tokens handed out by the sampler after priming, in order
    pub output: Vec<i32>,
    pub pieces: HashMap<i32, Vec<u8>>,
    /// Fail the nth evaluate after priming (0 = the prompt itself)
    pub fail_eval_at: Option<usize>,
    pub fail_load: HashSet<String>,
    pub fail_context: bool,
    pub default_ctx: i64,
    pub adapters: bool,
    pub load_gate: Option<LoadGate>,
    /// Sleep inside every evaluate
    pub eval_delay: Option<Duration>,
}

impl Default for Script {
    fn default() -> Self {
        Self::speaking(&["Hi", " there", ",", " friend", "!"])
    }
}

impl Script {
    /// Script that emits `pieces` (token ids 10, 11, ...) and then EOS.
    pub fn speaking(pieces: &[&str]) -> Self {
        let output: Vec<i32> = (0..pieces.len() as i32).map(|i| 10 + i).collect();
        let pieces = output
            .iter()
            .zip(pieces)
            .map(|(id, text)| (*id, text.as_bytes().to_vec()))
            .collect();
        Self {
            output,
            pieces,
            fail_eval_at: None,
            fail_load: HashSet::new(),
            fail_context: false,
            default_ctx: 4096,
            adapters: true,
            load_gate: None,
            eval_delay: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBackend {
    pub script: Script,
    pub probe: Arc<Probe>,
}

impl FakeBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            probe: Arc::default(),
        }
    }
}

impl Backend for FakeBackend {
    type Model = FakeModel;

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<FakeModel, EngineError> {
        let serial = self.probe.loads.fetch_add(1, Ordering::SeqCst);
        self.probe.gpu_layers.lock().unwrap().push(params.gpu_layers);
        let key = path.display().to_string();
        if let Some(gate) = self.script.load_gate.as_ref().filter(|g| g.path == key) {
            gate.entered.wait();
            gate.release.wait();
        }
        if self.script.fail_load.contains(&key) {
            return Err(EngineError::ModelLoad(format!("scripted failure for {key}")));
        }
        self.probe.live_models.fetch_add(1, Ordering::SeqCst);
        self.probe.record(format!("load model {serial}"));
        Ok(FakeModel {
            serial,
            script: self.script.clone(),
            probe: Arc::clone(&self.probe),
            adapters: Vec::new(),
        })
    }

    fn default_context_len(&self) -> i64 {
        self.script.default_ctx
    }

    fn supports_adapters(&self) -> bool {
        self.script.adapters
    }
}

#[derive(Debug)]
pub(crate) struct FakeModel {
    pub serial: usize,
    script: Script,
    probe: Arc<Probe>,
    pub adapters: Vec<PathBuf>,
}

impl Drop for FakeModel {
    fn drop(&mut self) {
        self.probe.live_models.fetch_sub(1, Ordering::SeqCst);
        self.probe.record(format!("free model {}", self.serial));
    }
}

impl NativeModel for FakeModel {
    type Context = FakeContext;

    fn new_context(&mut self, n_ctx: NonZeroU32) -> Result<FakeContext, EngineError> {
        if self.script.fail_context {
            return Err(EngineError::ContextCreate("scripted failure".to_string()));
        }
        self.probe.live_contexts.fetch_add(1, Ordering::SeqCst);
        self.probe.record(format!("new context {}", self.serial));
        Ok(FakeContext {
            serial: self.serial,
            n_ctx: n_ctx.get(),
            script: self.script.clone(),
            probe: Arc::clone(&self.probe),
            adapters: self.adapters.clone(),
            evals_since_prime: 0,
            generated: 0,
            positions: Vec::new(),
        })
    }

    fn tokenize(&self, text: &str, capacity: usize) -> Result<Vec<Token>, EngineError> {
        let tokens: Vec<Token> = text
            .split_whitespace()
            .enumerate()
            .map(|(i, _)| Token(100 + i as i32))
            .collect();
        if tokens.len() > capacity {
            return Err(EngineError::Tokenization(format!(
                "{} tokens exceed capacity {capacity}",
                tokens.len()
            )));
        }
        Ok(tokens)
    }

    fn eos_token(&self) -> Token {
        Token(EOS)
    }

    fn token_to_piece(&self, token: Token, buf: &mut [u8]) -> usize {
        let Some(piece) = self.script.pieces.get(&token.0) else {
            return 0;
        };
        let n = piece.len().min(buf.len().saturating_sub(1));
        buf[..n].copy_from_slice(&piece[..n]);
        if let Some(last) = buf.get_mut(n) {
            *last = 0;
        }
        n
    }

    fn apply_adapter(
        &mut self,
        path: &Path,
        _scale: f32,
        active: Option<&mut FakeContext>,
    ) -> Result<(), EngineError> {
        if path.to_string_lossy().contains("broken") {
            return Err(EngineError::Adapter("scripted failure".to_string()));
        }
        if let Some(ctx) = active {
            ctx.adapters.push(path.to_path_buf());
        }
        self.adapters.push(path.to_path_buf());
        self.probe.record(format!("adapter {}", path.display()));
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct FakeContext {
    pub serial: usize,
    pub n_ctx: u32,
    script: Script,
    probe: Arc<Probe>,
    pub adapters: Vec<PathBuf>,
    evals_since_prime: usize,
    generated: usize,
    /// `n_past` of every evaluate call, in order
    pub positions: Vec<u32>,
}

impl Drop for FakeContext {
    fn drop(&mut self) {
        self.probe.live_contexts.fetch_sub(1, Ordering::SeqCst);
        self.probe.record(format!("free context {}", self.serial));
    }
}

#[derive(Debug)]
pub(crate) struct FakeSampler {
    probe: Arc<Probe>,
}

impl Drop for FakeSampler {
    fn drop(&mut self) {
        self.probe.live_samplers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NativeContext for FakeContext {
    type Sampler = FakeSampler;

    fn evaluate(&mut self, tokens: &[Token], n_past: u32) -> Result<(), EngineError> {
        if n_past == 0 {
            self.evals_since_prime = 0;
            self.generated = 0;
        }
        let call = self.evals_since_prime;
        self.evals_since_prime += 1;
        self.positions.push(n_past);
        if let Some(delay) = self.script.eval_delay {
            thread::sleep(delay);
        }
        if self.script.fail_eval_at == Some(call) {
            return Err(EngineError::Evaluate(format!("scripted failure at call {call}")));
        }
        if n_past > 0 {
            self.generated += tokens.len();
        }
        Ok(())
    }

    fn sampler(&self, strategy: &SamplingStrategy) -> Result<FakeSampler, EngineError> {
        let counter = if strategy.is_greedy() {
            &self.probe.greedy_samplers
        } else {
            &self.probe.random_samplers
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.probe.live_samplers.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSampler {
            probe: Arc::clone(&self.probe),
        })
    }

    fn sample(&mut self, _sampler: &mut FakeSampler) -> Token {
        Token(
            self.script
                .output
                .get(self.generated)
                .copied()
                .unwrap_or(EOS),
        )
    }
}
