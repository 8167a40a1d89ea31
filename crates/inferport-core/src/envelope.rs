use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ExecMode, Labels};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ranked {
    pub label: String,
    pub prob: f32,
}

/// Named timing breakdown in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timings(pub BTreeMap<String, f64>);

impl Timings {
    pub const PREPROCESS: &'static str = "preprocess";
    pub const INFER: &'static str = "infer";
    pub const TOTAL: &'static str = "total";

    /// Preprocess and execution times plus their sum as `total`.
    pub fn local(preprocess: Duration, infer: Duration) -> Self {
        let mut t = Self::default();
        t.set(Self::PREPROCESS, preprocess);
        t.set(Self::INFER, infer);
        t.set(Self::TOTAL, preprocess + infer);
        t
    }

    pub fn set(&mut self, key: &str, d: Duration) {
        self.0.insert(key.to_string(), d.as_secs_f64() * 1e3);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn preprocess_ms(&self) -> f64 {
        self.get(Self::PREPROCESS).unwrap_or(0.0)
    }

    pub fn infer_ms(&self) -> f64 {
        self.get(Self::INFER).unwrap_or(0.0)
    }

    pub fn total_ms(&self) -> f64 {
        self.get(Self::TOTAL).unwrap_or(0.0)
    }
}

/// Uniform result shape, whichever path executed the task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub model: String,
    /// The path that actually produced the result; differs from `requested`
    /// after a fallback to CPU.
    pub backend: ExecMode,
    pub requested: ExecMode,
    pub ranking: Vec<Ranked>,
    pub timing_ms: Timings,
}

impl ResultEnvelope {
    pub fn top1(&self) -> Option<&Ranked> {
        self.ranking.first()
    }

    pub fn fell_back(&self) -> bool {
        self.backend != self.requested
    }
}

/// Top `k` scores in descending order. Equal scores keep their original
/// index order and NaN ranks last. `k` is clamped to `scores.len()`.
pub fn rank_top_k(scores: &[f32], labels: &Labels, k: usize) -> Vec<Ranked> {
    let key = |i: usize| {
        let s = scores[i];
        if s.is_nan() {
            f32::NEG_INFINITY
        } else {
            s
        }
    };

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| key(b).total_cmp(&key(a)).then(a.cmp(&b)));
    order.truncate(k.min(scores.len()));

    order
        .into_iter()
        .map(|i| Ranked {
            label: labels.label(i),
            prob: scores[i],
        })
        .collect()
}
