#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use inferport_core::{
    AccelStrategy, Backend, BackendCapabilities, BackendModel, DType, IOName, InputGeometry,
    LoadOptions, ModelSpec, Shape, Tensor, TensorSpec,
};
use inferport_runtime::Preprocessor;
use parking_lot::Mutex;

#[derive(Default)]
pub struct Counters {
    pub loads: AtomicUsize,
    pub releases: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub runs: AtomicUsize,
    pub last_opts: Mutex<Option<LoadOptions>>,
    pub last_path: Mutex<Option<PathBuf>>,
}

/// Backend whose models emit `outputs` scores (plus a few padding values
/// past the declared length).
pub struct FakeBackend {
    pub caps: BackendCapabilities,
    pub failing: Vec<AccelStrategy>,
    pub fail_release: bool,
    pub outputs: usize,
    pub counters: Arc<Counters>,
}

impl FakeBackend {
    pub fn new(outputs: usize) -> Self {
        Self {
            caps: BackendCapabilities::CPU_ONLY,
            failing: Vec::new(),
            fail_release: false,
            outputs,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_caps(mut self, gpu: bool, accelerator: bool) -> Self {
        self.caps = BackendCapabilities { gpu, accelerator };
        self
    }

    pub fn failing(mut self, strategy: AccelStrategy) -> Self {
        self.failing.push(strategy);
        self
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }
}

impl Backend for FakeBackend {
    type Model = FakeModel;

    fn name(&self) -> &'static str {
        "fake"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.caps
    }

    fn load(&self, model_path: &Path, opts: LoadOptions) -> Result<FakeModel> {
        *self.counters.last_opts.lock() = Some(opts);
        *self.counters.last_path.lock() = Some(model_path.to_path_buf());
        if self.failing.contains(&opts.strategy) {
            bail!("delegate for {} rejected by driver", opts.strategy);
        }
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(FakeModel {
            spec: ModelSpec {
                inputs: vec![TensorSpec {
                    name: IOName("input".into()),
                    dtype: DType::F32,
                    dims: vec![None, Some(224), Some(224), Some(3)],
                }],
                outputs: vec![TensorSpec {
                    name: IOName("logits".into()),
                    dtype: DType::F32,
                    dims: vec![None, Some(self.outputs)],
                }],
            },
            outputs: self.outputs,
            fail_release: self.fail_release,
            released: AtomicBool::new(false),
            counters: self.counters.clone(),
        })
    }
}

pub struct FakeModel {
    spec: ModelSpec,
    outputs: usize,
    fail_release: bool,
    released: AtomicBool,
    counters: Arc<Counters>,
}

/// Deterministic, non-monotonic scores with some ties.
pub fn score(i: usize) -> f32 {
    ((i * 37) % 101) as f32 / 100.0
}

impl BackendModel for FakeModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        if inputs.len() != 1 {
            bail!("expected one input");
        }
        self.counters.runs.fetch_add(1, Ordering::SeqCst);
        // Padding past the declared length must be ignored by the caller.
        let values: Vec<f32> = (0..self.outputs)
            .map(score)
            .chain([9.0, 9.0, 9.0])
            .collect();
        Ok(vec![Tensor::from_f32(
            Shape::from_slice(&[1, values.len()]),
            &values,
        )?])
    }

    fn release(&mut self) -> Result<()> {
        self.mark_released();
        if self.fail_release {
            bail!("native release failed");
        }
        Ok(())
    }
}

impl FakeModel {
    fn mark_released(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeModel {
    fn drop(&mut self) {
        self.mark_released();
    }
}

/// Produces a zero tensor of the requested geometry in a fixed 2 ms.
#[derive(Clone, Default)]
pub struct FakePreprocessor {
    pub calls: Arc<AtomicUsize>,
}

impl Preprocessor for FakePreprocessor {
    fn preprocess(&self, image: &[u8], geometry: InputGeometry) -> Result<(Tensor, Duration)> {
        if image.is_empty() {
            bail!("empty image");
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let shape = geometry.shape();
        let zeros = vec![0f32; shape.iter().product()];
        Ok((
            Tensor::from_f32(Shape::from_slice(&shape), &zeros)?,
            Duration::from_millis(2),
        ))
    }
}
