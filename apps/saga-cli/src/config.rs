use anyhow::Context;
use saga_archive::ArchiveConfig;
use saga_persist::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File-level configuration: one section per engine component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub archive: ArchiveConfig,
}

impl EngineConfig {
    /// Load from a YAML file, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Store configuration pointed at `state`, keeping every other setting.
    pub fn store_at(&self, state: &Path) -> StoreConfig {
        StoreConfig {
            path: state.to_path_buf(),
            ..self.store.clone()
        }
    }
}
