use crate::AttractorError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const CATALOG_SNAPSHOT_FILE_NAME: &str = "catalog.json";

/// Normalized model catalog: provider -> known model ids. The fetch itself
/// happens outside the core; runs read a snapshot pinned under
/// `{logs_root}/modeldb/`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub providers: BTreeMap<String, BTreeSet<String>>,
}

impl ModelCatalog {
    pub fn from_json_str(raw: &str) -> Result<Self, AttractorError> {
        serde_json::from_str(raw).map_err(|error| {
            AttractorError::Configuration(format!("invalid model catalog: {error}"))
        })
    }

    pub fn load(path: &Path) -> Result<Self, AttractorError> {
        let raw = fs::read_to_string(path).map_err(|error| {
            AttractorError::Configuration(format!(
                "failed to read model catalog '{}': {}",
                path.display(),
                error
            ))
        })?;
        Self::from_json_str(&raw)
    }

    /// Writes the snapshot consumed by later resumes of the same run.
    pub fn save_snapshot(&self, logs_root: &Path) -> Result<PathBuf, AttractorError> {
        let dir = crate::artifacts::modeldb_dir(logs_root);
        fs::create_dir_all(&dir).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to create modeldb dir '{}': {}",
                dir.display(),
                error
            ))
        })?;
        let path = dir.join(CATALOG_SNAPSHOT_FILE_NAME);
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|error| AttractorError::Runtime(error.to_string()))?;
        fs::write(&path, raw).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to write model catalog snapshot '{}': {}",
                path.display(),
                error
            ))
        })?;
        Ok(path)
    }

    pub fn load_snapshot(logs_root: &Path) -> Result<Self, AttractorError> {
        Self::load(&crate::artifacts::modeldb_dir(logs_root).join(CATALOG_SNAPSHOT_FILE_NAME))
    }

    pub fn resolves(&self, provider: &str, model: &str) -> bool {
        self.providers
            .get(provider)
            .is_some_and(|models| models.contains(model))
    }

    pub fn any_provider_resolves(&self, model: &str) -> bool {
        self.providers
            .values()
            .any(|models| models.contains(model))
    }
}

/// Anthropic model ids use dots in version components; the graph language
/// accepts the dash form unquoted (`claude-opus-4-6`). Suggests the
/// canonical dotted spelling when trailing dash-separated numerics exist.
pub fn canonical_anthropic_model(model: &str) -> Option<String> {
    if !model.starts_with("claude") {
        return None;
    }
    let parts: Vec<&str> = model.split('-').collect();
    if parts.len() < 3 {
        return None;
    }
    let last = parts[parts.len() - 1];
    let second_last = parts[parts.len() - 2];
    if !last.chars().all(|ch| ch.is_ascii_digit())
        || !second_last.chars().all(|ch| ch.is_ascii_digit())
    {
        return None;
    }
    let mut canonical = parts[..parts.len() - 2].join("-");
    canonical.push('-');
    canonical.push_str(second_last);
    canonical.push('.');
    canonical.push_str(last);
    Some(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn catalog() -> ModelCatalog {
        ModelCatalog::from_json_str(
            r#"{"providers": {"anthropic": ["claude-opus-4.6", "claude-sonnet-4.5"], "openai": ["gpt-5.2-codex"]}}"#,
        )
        .expect("catalog should parse")
    }

    #[test]
    fn resolves_known_and_unknown_models() {
        let catalog = catalog();
        assert!(catalog.resolves("anthropic", "claude-opus-4.6"));
        assert!(!catalog.resolves("anthropic", "claude-opus-4-6"));
        assert!(!catalog.resolves("openai", "claude-opus-4.6"));
        assert!(catalog.any_provider_resolves("gpt-5.2-codex"));
    }

    #[test]
    fn canonical_anthropic_model_dash_form_expected_dotted() {
        assert_eq!(
            canonical_anthropic_model("claude-opus-4-6").as_deref(),
            Some("claude-opus-4.6")
        );
        assert_eq!(
            canonical_anthropic_model("claude-sonnet-4-5").as_deref(),
            Some("claude-sonnet-4.5")
        );
        assert_eq!(canonical_anthropic_model("gpt-5-2"), None);
        assert_eq!(canonical_anthropic_model("claude-opus"), None);
    }

    #[test]
    fn snapshot_round_trip_under_logs_root() {
        let dir = TempDir::new().expect("temp dir should be created");
        let saved_path = catalog()
            .save_snapshot(dir.path())
            .expect("snapshot should save");
        assert!(saved_path.ends_with("modeldb/catalog.json"));

        let loaded = ModelCatalog::load_snapshot(dir.path()).expect("snapshot should load");
        assert_eq!(loaded, catalog());
    }
}
