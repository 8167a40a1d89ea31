use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// A classification model the device knows how to load.
///
/// Two descriptors are the same model when their logical names match; the
/// manager relies on this to decide whether a backend rebuild is needed.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ModelDescriptor {
    pub name: &'static str,
    pub file: &'static str,
    pub input_size: usize,
}

impl ModelDescriptor {
    pub const MV3: ModelDescriptor = ModelDescriptor {
        name: "mv3",
        file: "mobilenet_v3_small_224_1.0_float.onnx",
        input_size: 224,
    };

    pub const EFF0: ModelDescriptor = ModelDescriptor {
        name: "eff0",
        file: "efficientnet_lite0_224_float.onnx",
        input_size: 224,
    };

    pub fn all() -> &'static [ModelDescriptor] {
        &[Self::MV3, Self::EFF0]
    }

    pub fn lookup(name: &str) -> Option<ModelDescriptor> {
        let name = name.trim();
        Self::all()
            .iter()
            .copied()
            .find(|m| m.name.eq_ignore_ascii_case(name))
    }

    /// Unknown names fall back to `mv3`.
    pub fn from_name(name: &str) -> ModelDescriptor {
        Self::lookup(name).unwrap_or(Self::MV3)
    }

    pub fn path_in(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(self.file)
    }

    pub fn input_dims(&self) -> (usize, usize) {
        (self.input_size, self.input_size)
    }
}

impl Default for ModelDescriptor {
    fn default() -> Self {
        Self::MV3
    }
}

impl PartialEq for ModelDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ModelDescriptor {}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
