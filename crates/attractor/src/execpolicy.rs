use crate::AttractorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliProfile {
    #[default]
    Real,
    TestShim,
}

impl CliProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::TestShim => "test_shim",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Default,
    ConfigExecutable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResolution {
    pub cli_profile: CliProfile,
    pub allow_test_shim: bool,
    pub resolved_path: String,
    pub source: ResolutionSource,
}

#[derive(Clone, Debug)]
pub struct ExecPolicyInput<'a> {
    pub cli_profile: CliProfile,
    pub allow_test_shim: bool,
    pub provider: &'a str,
    pub configured_executable: Option<&'a str>,
}

/// The override env var a `real` profile refuses to honor,
/// e.g. `KILROY_CODEX_PATH`.
pub fn provider_path_env_var(provider: &str) -> String {
    format!(
        "KILROY_{}_PATH",
        provider.to_ascii_uppercase().replace('-', "_")
    )
}

fn canonical_binary(provider: &str) -> &str {
    match provider {
        "codex" | "openai" => "codex",
        "claude" | "anthropic" => "claude",
        "gemini" | "google" => "gemini",
        other => other,
    }
}

/// The only code path that selects a provider executable. Both preflight and
/// the stage runtime resolve through here so they cannot drift.
pub fn resolve_provider_executable(
    input: &ExecPolicyInput<'_>,
    env: &BTreeMap<String, String>,
) -> Result<ExecResolution, AttractorError> {
    match input.cli_profile {
        CliProfile::Real => {
            let env_var = provider_path_env_var(input.provider);
            if env.contains_key(&env_var) {
                return Err(AttractorError::Configuration(format!(
                    "{env_var} is set but cli_profile=real forbids executable overrides; \
                     unset {env_var} or run with cli_profile=test_shim and --allow-test-shim"
                )));
            }
            Ok(ExecResolution {
                cli_profile: input.cli_profile,
                allow_test_shim: input.allow_test_shim,
                resolved_path: canonical_binary(input.provider).to_string(),
                source: ResolutionSource::Default,
            })
        }
        CliProfile::TestShim => {
            if !input.allow_test_shim {
                return Err(AttractorError::Configuration(format!(
                    "cli_profile=test_shim for provider '{}' requires --allow-test-shim",
                    input.provider
                )));
            }
            let Some(executable) = input
                .configured_executable
                .map(str::trim)
                .filter(|path| !path.is_empty())
            else {
                return Err(AttractorError::Configuration(format!(
                    "cli_profile=test_shim requires providers.{}.executable to be set; \
                     there is no environment or default fallback",
                    input.provider
                )));
            };
            Ok(ExecResolution {
                cli_profile: input.cli_profile,
                allow_test_shim: input.allow_test_shim,
                resolved_path: executable.to_string(),
                source: ResolutionSource::ConfigExecutable,
            })
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub cli_profile: CliProfile,
    pub allow_test_shim: bool,
    pub providers: BTreeMap<String, PreflightProviderEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightProviderEntry {
    pub resolved_path: String,
    pub source: ResolutionSource,
}

/// Resolves every enabled provider; the report lands in
/// `preflight_report.json` next to the run manifest.
pub fn build_preflight_report(
    cli_profile: CliProfile,
    allow_test_shim: bool,
    providers: &BTreeMap<String, Option<String>>,
    env: &BTreeMap<String, String>,
) -> Result<PreflightReport, AttractorError> {
    let mut entries = BTreeMap::new();
    for (provider, configured_executable) in providers {
        let resolution = resolve_provider_executable(
            &ExecPolicyInput {
                cli_profile,
                allow_test_shim,
                provider,
                configured_executable: configured_executable.as_deref(),
            },
            env,
        )?;
        entries.insert(
            provider.clone(),
            PreflightProviderEntry {
                resolved_path: resolution.resolved_path,
                source: resolution.source,
            },
        );
    }
    Ok(PreflightReport {
        cli_profile,
        allow_test_shim,
        providers: entries,
    })
}

pub fn env_snapshot() -> BTreeMap<String, String> {
    std::env::vars().collect()
}
