use std::fmt;

use serde::{Deserialize, Serialize};

/// Hardware path a local backend runs on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccelStrategy {
    #[default]
    Cpu,
    Gpu,
    Accelerator,
}

impl AccelStrategy {
    /// Unknown names resolve to `Cpu` so the control surface stays permissive.
    pub fn from_name(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gpu" => Self::Gpu,
            "nnapi" | "npu" | "accelerator" => Self::Accelerator,
            _ => Self::Cpu,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Accelerator => "accelerator",
        }
    }
}

impl fmt::Display for AccelStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a task is executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Cpu,
    Gpu,
    Accelerator,
    Offload,
}

impl ExecMode {
    pub fn from_name(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "offload" | "remote" => Self::Offload,
            other => Self::from(AccelStrategy::from_name(other)),
        }
    }

    /// `None` for the remote path.
    pub fn local_strategy(self) -> Option<AccelStrategy> {
        match self {
            Self::Cpu => Some(AccelStrategy::Cpu),
            Self::Gpu => Some(AccelStrategy::Gpu),
            Self::Accelerator => Some(AccelStrategy::Accelerator),
            Self::Offload => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offload => "offload",
            local => local
                .local_strategy()
                .map(AccelStrategy::as_str)
                .unwrap_or("cpu"),
        }
    }
}

impl From<AccelStrategy> for ExecMode {
    fn from(s: AccelStrategy) -> Self {
        match s {
            AccelStrategy::Cpu => Self::Cpu,
            AccelStrategy::Gpu => Self::Gpu,
            AccelStrategy::Accelerator => Self::Accelerator,
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
