use std::path::Path;

use anyhow::Result;

use crate::{AccelStrategy, ModelSpec, Tensor};

/// What the current build and device can run. Resolved per platform at
/// compile time; the manager consults it before attempting a strategy.
#[derive(Clone, Copy, Debug)]
pub struct BackendCapabilities {
    pub gpu: bool,
    pub accelerator: bool,
}

impl BackendCapabilities {
    pub const CPU_ONLY: BackendCapabilities = BackendCapabilities {
        gpu: false,
        accelerator: false,
    };

    pub fn supports(&self, strategy: AccelStrategy) -> bool {
        match strategy {
            AccelStrategy::Cpu => true,
            AccelStrategy::Gpu => self.gpu,
            AccelStrategy::Accelerator => self.accelerator,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LoadOptions {
    pub strategy: AccelStrategy,
    /// Worker threads for the optimized CPU path, which is always enabled.
    pub cpu_threads: usize,
}

pub trait Backend: Send + Sync + 'static {
    type Model: BackendModel;

    fn name(&self) -> &'static str;
    fn capabilities(&self) -> BackendCapabilities;

    /// Builds an execution context for one model file bound to one strategy.
    /// Fails when the strategy's delegate cannot be created.
    fn load(&self, model_path: &Path, opts: LoadOptions) -> Result<Self::Model>;
}

pub trait BackendModel: Send + 'static {
    fn spec(&self) -> &ModelSpec;

    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>>;

    /// Frees native resources ahead of drop.
    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}
