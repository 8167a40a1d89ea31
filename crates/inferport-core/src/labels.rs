use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

/// Class labels; line order defines the class index.
#[derive(Clone, Debug, Default)]
pub struct Labels(Arc<[String]>);

impl Labels {
    pub fn parse(text: &str) -> Self {
        let labels: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Self(labels.into())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read labels from {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn label(&self, index: usize) -> String {
        self.0
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("class_{index}"))
    }
}
