//! Lifecycle of the single local execution context.
//!
//! The manager owns at most one live backend handle, bound to one model and
//! one requested strategy. Construction, teardown and inference all happen
//! under one lock, so a rebuild can never race an in-flight run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{anyhow, ensure, Context, Result};
use bytes::Bytes;
use inferport_core::{
    rank_top_k, AccelStrategy, Backend, BackendModel, ExecError, ExecMode, InputGeometry, Labels,
    LoadOptions, ModelDescriptor, ResultEnvelope, Tensor, Timings,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::Preprocessor;

/// Upper bound on optimized-CPU worker threads.
pub const MAX_CPU_THREADS: usize = 4;

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub model_dir: PathBuf,
    pub model: ModelDescriptor,
    pub max_threads: usize,
    pub input_cache: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            model: ModelDescriptor::MV3,
            max_threads: MAX_CPU_THREADS,
            input_cache: true,
        }
    }
}

/// What the live handle is bound to. `actual` differs from `requested`
/// after a fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BackendInfo {
    pub model: ModelDescriptor,
    pub requested: AccelStrategy,
    pub actual: AccelStrategy,
}

struct Live<M> {
    info: BackendInfo,
    handle: M,
}

struct CachedInput {
    geometry: InputGeometry,
    payload: Bytes,
    tensor: Tensor,
}

struct State<M> {
    model: ModelDescriptor,
    live: Option<Live<M>>,
    cache: Option<CachedInput>,
}

pub struct LocalBackendManager<B: Backend> {
    backend: B,
    preprocessor: Box<dyn Preprocessor>,
    labels: Labels,
    model_dir: PathBuf,
    cpu_threads: usize,
    input_cache: bool,
    builds: AtomicU64,
    state: Mutex<State<B::Model>>,
}

impl<B: Backend> LocalBackendManager<B> {
    pub fn new(
        backend: B,
        preprocessor: impl Preprocessor,
        labels: Labels,
        config: ManagerConfig,
    ) -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let cpu_threads = config.max_threads.clamp(1, MAX_CPU_THREADS).min(cores);
        Self {
            backend,
            preprocessor: Box::new(preprocessor),
            labels,
            model_dir: config.model_dir,
            cpu_threads,
            input_cache: config.input_cache,
            builds: AtomicU64::new(0),
            state: Mutex::new(State {
                model: config.model,
                live: None,
                cache: None,
            }),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn cpu_threads(&self) -> usize {
        self.cpu_threads
    }

    pub fn current_model(&self) -> ModelDescriptor {
        self.state.lock().model
    }

    pub fn live_backend(&self) -> Option<BackendInfo> {
        self.state.lock().live.as_ref().map(|l| l.info)
    }

    /// Number of backend handles constructed so far.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Makes `model` the configured model. Returns false when it already
    /// was; otherwise the live handle is released and the input cache
    /// dropped, and the new model is built on next use.
    pub fn switch_model(&self, model: ModelDescriptor) -> bool {
        let mut state = self.state.lock();
        self.switch_locked(&mut state, model)
    }

    pub fn ensure_backend(
        &self,
        model: ModelDescriptor,
        strategy: AccelStrategy,
    ) -> Result<BackendInfo, ExecError> {
        let mut state = self.state.lock();
        self.switch_locked(&mut state, model);
        self.ensure_locked(&mut state, strategy)
            .map(|live| live.info)
            .map_err(ExecError::local)
    }

    /// Classifies `image` with the configured model.
    pub fn run_inference(
        &self,
        image: &[u8],
        top_k: usize,
        strategy: AccelStrategy,
    ) -> Result<ResultEnvelope, ExecError> {
        let mut state = self.state.lock();
        self.run_locked(&mut state, image, top_k, strategy)
    }

    /// Switches to `model` and classifies `image` without releasing the lock
    /// in between.
    pub fn run_with_model(
        &self,
        model: ModelDescriptor,
        image: &[u8],
        top_k: usize,
        strategy: AccelStrategy,
    ) -> Result<ResultEnvelope, ExecError> {
        let mut state = self.state.lock();
        self.switch_locked(&mut state, model);
        self.run_locked(&mut state, image, top_k, strategy)
    }

    /// Tears down the live handle, if any.
    pub fn release(&self) {
        let mut state = self.state.lock();
        release_live(&mut state);
    }

    fn switch_locked(&self, state: &mut State<B::Model>, model: ModelDescriptor) -> bool {
        if state.model == model {
            return false;
        }
        info!(from = %state.model, to = %model, "switching model");
        release_live(state);
        state.cache = None;
        state.model = model;
        true
    }

    fn ensure_locked<'s>(
        &self,
        state: &'s mut State<B::Model>,
        strategy: AccelStrategy,
    ) -> Result<&'s mut Live<B::Model>> {
        let reusable = state
            .live
            .as_ref()
            .is_some_and(|l| l.info.model == state.model && l.info.requested == strategy);
        if !reusable {
            release_live(state);
            let live = self.build(state.model, strategy)?;
            state.live = Some(live);
        }
        state
            .live
            .as_mut()
            .ok_or_else(|| anyhow!("no live backend after build"))
    }

    fn build(&self, model: ModelDescriptor, requested: AccelStrategy) -> Result<Live<B::Model>> {
        let path = model.path_in(&self.model_dir);
        let opts = |strategy| LoadOptions {
            strategy,
            cpu_threads: self.cpu_threads,
        };

        let attempt = if self.backend.capabilities().supports(requested) {
            self.backend.load(&path, opts(requested))
        } else {
            Err(anyhow!("{requested} is not supported on this device"))
        };

        let (handle, actual) = match attempt {
            Ok(handle) => (handle, requested),
            Err(err) if requested != AccelStrategy::Cpu => {
                warn!(
                    model = %model,
                    requested = %requested,
                    reason = %format!("{err:#}"),
                    "acceleration unavailable; falling back to cpu"
                );
                let handle = self
                    .backend
                    .load(&path, opts(AccelStrategy::Cpu))
                    .with_context(|| format!("failed to build cpu backend for {model}"))?;
                (handle, AccelStrategy::Cpu)
            }
            Err(err) => {
                return Err(err.context(format!("failed to build cpu backend for {model}")))
            }
        };

        let builds = self.builds.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            backend = self.backend.name(),
            model = %model,
            requested = %requested,
            actual = %actual,
            threads = self.cpu_threads,
            builds,
            "backend built"
        );
        Ok(Live {
            info: BackendInfo {
                model,
                requested,
                actual,
            },
            handle,
        })
    }

    fn run_locked(
        &self,
        state: &mut State<B::Model>,
        image: &[u8],
        top_k: usize,
        strategy: AccelStrategy,
    ) -> Result<ResultEnvelope, ExecError> {
        let model = state.model;
        let (info, geometry, output_len) = {
            let live = self.ensure_locked(state, strategy).map_err(ExecError::local)?;
            let spec = live.handle.spec();
            let geometry = spec
                .input_geometry(model.input_dims())
                .map_err(ExecError::local)?;
            (live.info, geometry, spec.output_len())
        };

        let (input, preprocess) = self.input_for(state, image, geometry)?;

        let live = state
            .live
            .as_mut()
            .ok_or_else(|| ExecError::LocalExecution("backend released mid-run".to_string()))?;
        let started = Instant::now();
        let outputs = live.handle.infer(vec![input]).map_err(ExecError::local)?;
        let infer = started.elapsed();

        let scores = scores(outputs, output_len).map_err(ExecError::local)?;
        let ranking = rank_top_k(&scores, &self.labels, top_k);
        debug!(model = %model, actual = %info.actual, outputs = scores.len(), ?infer, "local inference done");

        Ok(ResultEnvelope {
            model: model.name.to_string(),
            backend: ExecMode::from(info.actual),
            requested: ExecMode::from(info.requested),
            ranking,
            timing_ms: Timings::local(preprocess, infer),
        })
    }

    /// Reuses the cached tensor when the geometry and the payload are both
    /// unchanged; a hit costs no preprocessing time.
    fn input_for(
        &self,
        state: &mut State<B::Model>,
        image: &[u8],
        geometry: InputGeometry,
    ) -> Result<(Tensor, Duration), ExecError> {
        if let Some(cached) = &state.cache {
            if cached.geometry == geometry && cached.payload == image {
                return Ok((cached.tensor.clone(), Duration::ZERO));
            }
        }

        let (tensor, elapsed) = self
            .preprocessor
            .preprocess(image, geometry)
            .map_err(|e| ExecError::InvalidInput(format!("{e:#}")))?;
        if self.input_cache {
            state.cache = Some(CachedInput {
                geometry,
                payload: Bytes::copy_from_slice(image),
                tensor: tensor.clone(),
            });
        }
        Ok((tensor, elapsed))
    }
}

impl<B: Backend> Drop for LocalBackendManager<B> {
    fn drop(&mut self) {
        release_live(self.state.get_mut());
    }
}

fn release_live<M: BackendModel>(state: &mut State<M>) {
    let Some(mut live) = state.live.take() else {
        return;
    };
    if let Err(err) = live.handle.release() {
        warn!(
            model = %live.info.model,
            strategy = %live.info.actual,
            error = %format!("{err:#}"),
            "backend release failed; continuing"
        );
    }
}

/// First output, cut to the length the model declares.
fn scores(outputs: Vec<Tensor>, declared: Option<usize>) -> Result<Vec<f32>> {
    let first = outputs
        .into_iter()
        .next()
        .context("model produced no outputs")?;
    let mut values = first.to_f32_vec()?;
    if let Some(n) = declared {
        ensure!(
            values.len() >= n,
            "model declared {n} outputs but produced {}",
            values.len()
        );
        values.truncate(n);
    }
    Ok(values)
}
