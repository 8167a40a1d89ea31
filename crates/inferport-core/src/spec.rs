use anyhow::{bail, Result};

use crate::DType;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IOName(pub String);

#[derive(Clone, Debug)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    pub dims: Vec<Option<usize>>, // None = dynamic
}

impl TensorSpec {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Element count when every dimension is static, treating a dynamic
    /// leading batch dimension as 1.
    pub fn static_numel(&self) -> Option<usize> {
        self.dims
            .iter()
            .enumerate()
            .map(|(i, d)| match d {
                Some(n) => Some(*n),
                None if i == 0 => Some(1),
                None => None,
            })
            .try_fold(1usize, |acc, d| d.map(|d| acc * d))
    }
}

/// Memory order of an image input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputLayout {
    Nhwc,
    Nchw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputGeometry {
    pub width: usize,
    pub height: usize,
    pub layout: InputLayout,
}

impl InputGeometry {
    pub fn shape(&self) -> [usize; 4] {
        match self.layout {
            InputLayout::Nhwc => [1, self.height, self.width, 3],
            InputLayout::Nchw => [1, 3, self.height, self.width],
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModelSpec {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl ModelSpec {
    /// Spatial size and layout of the first (image) input. Dynamic spatial
    /// dimensions are filled from `fallback`.
    pub fn input_geometry(&self, fallback: (usize, usize)) -> Result<InputGeometry> {
        let Some(input) = self.inputs.first() else {
            bail!("model declares no inputs");
        };
        if input.rank() != 4 {
            bail!("expected a rank-4 image input, got rank {}", input.rank());
        }
        let dim = |i: usize, default: usize| input.dims[i].unwrap_or(default);
        let (fw, fh) = fallback;

        if input.dims[1] == Some(3) && input.dims[3] != Some(3) {
            Ok(InputGeometry {
                width: dim(3, fw),
                height: dim(2, fh),
                layout: InputLayout::Nchw,
            })
        } else {
            Ok(InputGeometry {
                width: dim(2, fw),
                height: dim(1, fh),
                layout: InputLayout::Nhwc,
            })
        }
    }

    /// Number of scores the first output carries, if statically known.
    pub fn output_len(&self) -> Option<usize> {
        self.outputs.first().and_then(TensorSpec::static_numel)
    }
}
