use crate::{AttractorError, CliProfile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

fn default_version() -> u32 {
    1
}

/// Run configuration file, YAML or JSON.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFileConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub repo: Option<RepoConfig>,
    #[serde(default)]
    pub cxdb: Option<CxdbConfig>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub modeldb: Option<ModeldbConfig>,
    #[serde(default)]
    pub artifact_policy: Option<ArtifactPolicyConfig>,
    #[serde(default)]
    pub inputs: Option<InputsConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CxdbConfig {
    #[serde(default)]
    pub binary_addr: Option<String>,
    #[serde(default)]
    pub http_base_url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub cli_profile: CliProfile,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderBackend {
    #[default]
    Cli,
    Api,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub backend: ProviderBackend,
    #[serde(default)]
    pub executable: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelDbUpdatePolicy {
    #[default]
    Pinned,
    OnRunStart,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeldbConfig {
    pub catalog_path: String,
    #[serde(default)]
    pub update_policy: ModelDbUpdatePolicy,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPolicyConfig {
    #[serde(default)]
    pub checkpoint: Option<CheckpointPolicyConfig>,
    #[serde(default)]
    pub env: Option<EnvPolicyConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPolicyConfig {
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvPolicyConfig {
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub profiles: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputsConfig {
    #[serde(default)]
    pub materialize: Option<MaterializeConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterializeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub default_include: bool,
    #[serde(default)]
    pub follow_references: bool,
    #[serde(default)]
    pub infer_with_llm: bool,
}

impl RunFileConfig {
    pub fn from_str_any(raw: &str) -> Result<Self, AttractorError> {
        // YAML is a superset of JSON, so one parser covers both forms.
        let config: Self = serde_yaml::from_str(raw).map_err(|error| {
            AttractorError::Configuration(format!("invalid run configuration: {error}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, AttractorError> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            AttractorError::Configuration(format!(
                "failed to read run configuration '{}': {}",
                path.display(),
                error
            ))
        })?;
        Self::from_str_any(&raw)
    }

    /// `cli_profile=real` forbids any provider executable override;
    /// `test_shim` requires one for every enabled CLI provider.
    pub fn validate(&self) -> Result<(), AttractorError> {
        if self.version != 1 {
            return Err(AttractorError::Configuration(format!(
                "unsupported configuration version {}",
                self.version
            )));
        }

        match self.llm.cli_profile {
            CliProfile::Real => {
                for (name, provider) in &self.llm.providers {
                    if provider.executable.is_some() {
                        return Err(AttractorError::Configuration(format!(
                            "cli_profile=real rejects providers.{name}.executable; remove it or \
                             switch to cli_profile=test_shim"
                        )));
                    }
                }
            }
            CliProfile::TestShim => {
                for (name, provider) in &self.llm.providers {
                    if provider.backend == ProviderBackend::Cli
                        && provider
                            .executable
                            .as_deref()
                            .map(str::trim)
                            .filter(|path| !path.is_empty())
                            .is_none()
                    {
                        return Err(AttractorError::Configuration(format!(
                            "cli_profile=test_shim requires providers.{name}.executable"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// `(provider, configured executable)` pairs for the preflight resolver.
    pub fn provider_executables(&self) -> BTreeMap<String, Option<String>> {
        self.llm
            .providers
            .iter()
            .map(|(name, provider)| (name.clone(), provider.executable.clone()))
            .collect()
    }

    pub fn env_overrides(&self) -> BTreeMap<String, String> {
        self.artifact_policy
            .as_ref()
            .and_then(|policy| policy.env.as_ref())
            .map(|env| env.overrides.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_config_parses_with_defaults() {
        let config = RunFileConfig::from_str_any(
            r#"
version: 1
repo:
  path: /work/repo
cxdb:
  http_base_url: http://localhost:9010
llm:
  cli_profile: real
  providers:
    claude:
      backend: cli
"#,
        )
        .expect("config should parse");
        assert_eq!(config.llm.cli_profile, CliProfile::Real);
        assert_eq!(config.repo.as_ref().map(|r| r.path.as_str()), Some("/work/repo"));
        assert!(config.llm.providers.contains_key("claude"));
    }

    #[test]
    fn json_config_parses_through_same_path() {
        let config = RunFileConfig::from_str_any(
            r#"{"version": 1, "llm": {"cli_profile": "test_shim", "providers": {"claude": {"backend": "cli", "executable": "/tmp/shim"}}}}"#,
        )
        .expect("config should parse");
        assert_eq!(config.llm.cli_profile, CliProfile::TestShim);
    }

    #[test]
    fn real_profile_rejects_executable_override() {
        let error = RunFileConfig::from_str_any(
            r#"
version: 1
llm:
  cli_profile: real
  providers:
    claude:
      executable: /tmp/shim
"#,
        )
        .expect_err("validation should fail");
        assert!(error.to_string().contains("providers.claude.executable"));
    }

    #[test]
    fn test_shim_requires_executable_for_cli_providers() {
        let error = RunFileConfig::from_str_any(
            r#"
version: 1
llm:
  cli_profile: test_shim
  providers:
    claude:
      backend: cli
"#,
        )
        .expect_err("validation should fail");
        assert!(error.to_string().contains("requires providers.claude.executable"));
    }

    #[test]
    fn test_shim_api_backend_does_not_require_executable() {
        let config = RunFileConfig::from_str_any(
            r#"
version: 1
llm:
  cli_profile: test_shim
  providers:
    openai:
      backend: api
"#,
        )
        .expect("config should parse");
        assert_eq!(
            config.llm.providers["openai"].backend,
            ProviderBackend::Api
        );
    }

    #[test]
    fn unsupported_version_rejected() {
        let error = RunFileConfig::from_str_any("version: 2\n")
            .expect_err("validation should fail");
        assert!(error.to_string().contains("unsupported configuration version"));
    }
}
