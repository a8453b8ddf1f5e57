//! Reference embeddings stored as a JSON array of `{label, embeddings}`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use veil_core::ReferenceIdentity;
use veil_engine::{ReferenceError, ReferenceStore};

pub struct JsonReferenceStore {
    path: PathBuf,
}

impl JsonReferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReferenceStore for JsonReferenceStore {
    async fn load(&self) -> Result<Vec<ReferenceIdentity>, ReferenceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| ReferenceError::Unavailable(format!("{}: {e}", self.path.display())))?;
        serde_json::from_slice(&bytes).map_err(|e| ReferenceError::Malformed(format!("{}: {e}", self.path.display())))
    }
}

pub fn save(path: &Path, references: &[ReferenceIdentity]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(references)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
