use std::collections::BTreeMap;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use inferport_core::Ranked;
use serde::{Deserialize, Serialize};

pub const PAYLOAD_IMAGE: &str = "image";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OffloadRequest {
    pub client_id: String,
    pub request_id: String,
    pub payload_type: String,
    pub image_b64: String,
    pub model_name: String,
}

impl OffloadRequest {
    pub fn image(client_id: &str, request_id: &str, image: &[u8], model_name: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            request_id: request_id.to_string(),
            payload_type: PAYLOAD_IMAGE.to_string(),
            image_b64: BASE64.encode(image),
            model_name: model_name.to_string(),
        }
    }

    pub fn image_bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(self.image_b64.as_bytes())
            .context("image_b64 is not valid base64")
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context("malformed offload request")
    }
}

/// One ranking entry as workers send it: `{"label", "prob"}` or `[label, prob]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireRank {
    Entry {
        label: String,
        #[serde(alias = "score")]
        prob: f32,
    },
    Pair(String, f32),
}

impl From<WireRank> for Ranked {
    fn from(r: WireRank) -> Self {
        match r {
            WireRank::Entry { label, prob } | WireRank::Pair(label, prob) => Ranked { label, prob },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireRanking {
    Many(Vec<WireRank>),
    One(WireRank),
}

impl WireRanking {
    fn into_vec(self) -> Vec<WireRank> {
        match self {
            Self::Many(v) => v,
            Self::One(r) => vec![r],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OffloadResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top1: Option<WireRanking>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top5: Option<WireRanking>,
    #[serde(default)]
    pub timing_ms: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl OffloadResponse {
    pub fn success(
        request: &OffloadRequest,
        top5: Vec<Ranked>,
        timing_ms: BTreeMap<String, f64>,
    ) -> Self {
        let to_wire = |r: &Ranked| WireRank::Entry {
            label: r.label.clone(),
            prob: r.prob,
        };
        Self {
            ok: true,
            model: Some(request.model_name.clone()),
            top1: top5.first().map(|r| WireRanking::One(to_wire(r))),
            top5: Some(WireRanking::Many(top5.iter().map(to_wire).collect())),
            timing_ms,
            request_id: Some(request.request_id.clone()),
            client_id: Some(request.client_id.clone()),
            ..Self::default()
        }
    }

    pub fn failure(request_id: &str, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            request_id: Some(request_id.to_string()),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context("malformed offload response")
    }

    /// Non-blank correlation id, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.request_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// `top5` (or `top1` when the worker sent no `top5`), at most `k` entries.
    pub fn ranking(&self, k: usize) -> Vec<Ranked> {
        let source = self.top5.clone().or_else(|| self.top1.clone());
        source
            .map(WireRanking::into_vec)
            .unwrap_or_default()
            .into_iter()
            .take(k)
            .map(Ranked::from)
            .collect()
    }
}
