use bytes::Bytes;
use inferport_core::{ExecMode, ModelDescriptor};

/// One classification job. Immutable once built.
#[derive(Clone, Debug)]
pub struct Task {
    pub payload: Bytes,
    pub model: ModelDescriptor,
    pub top_k: usize,
    /// Execution mode hint; the router's default applies when absent.
    pub mode: Option<ExecMode>,
}

impl Task {
    pub fn new(payload: impl Into<Bytes>, model: ModelDescriptor, top_k: usize) -> Self {
        Self {
            payload: payload.into(),
            model,
            top_k,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = Some(mode);
        self
    }
}
