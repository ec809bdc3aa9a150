use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, TributaryError};
use crate::types::{Model, ReasoningEffort};
use crate::vendor::{supports_cache_annotations, Vendor};

pub const DEFAULT_MAX_RETRIES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Large,
    Small,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettingsByType {
    #[serde(default)]
    pub large: ModelSettings,
    #[serde(default)]
    pub small: ModelSettings,
}

/// Snapshot of one provider's configuration, as read from `[provider]` in a
/// TOML file or built directly by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub id: String,
    pub base_url: String,
    /// Literal key or a `$ENV_VAR` reference.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub extra_body: HashMap<String, Value>,
    #[serde(default)]
    pub disable_cache: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub models: ModelSettingsByType,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn model_settings(&self, model_type: ModelType) -> &ModelSettings {
        match model_type {
            ModelType::Large => &self.models.large,
            ModelType::Small => &self.models.small,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }
}

/// Everything a single run needs to build requests for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOptions {
    pub config: ProviderConfig,
    pub model: Model,
    pub model_type: ModelType,
    pub system_message: String,
    /// Per-call token budget override; wins over the per-model-type setting.
    pub max_tokens: Option<u32>,
}

impl ProviderOptions {
    pub fn new(config: ProviderConfig, model: Model) -> Self {
        Self {
            config,
            model,
            model_type: ModelType::Large,
            system_message: String::new(),
            max_tokens: None,
        }
    }

    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }

    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = system_message.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn vendor(&self) -> Vendor {
        Vendor::classify(&self.config.base_url, &self.model.id)
    }

    /// Resolution order: per-call override, per-model-type setting, model default.
    pub fn resolved_max_tokens(&self) -> u32 {
        let mut max_tokens = self.model.default_max_tokens;
        if let Some(configured) = self
            .config
            .model_settings(self.model_type)
            .max_tokens
            .filter(|value| *value > 0)
        {
            max_tokens = configured;
        }
        if let Some(requested) = self.max_tokens.filter(|value| *value > 0) {
            max_tokens = requested;
        }
        max_tokens
    }

    pub fn reasoning_effort(&self) -> Option<&ReasoningEffort> {
        self.config
            .model_settings(self.model_type)
            .reasoning_effort
            .as_ref()
    }

    pub fn cache_annotations_enabled(&self) -> bool {
        !self.config.disable_cache
            && supports_cache_annotations(&self.config.base_url, &self.model.id)
    }
}

#[derive(Debug, Deserialize)]
struct TributaryTomlFile {
    provider: ProviderConfig,
}

pub fn load_provider_config(path: &Path) -> Result<ProviderConfig, TributaryError> {
    let content = std::fs::read_to_string(path).map_err(|error| {
        TributaryError::new(
            ErrorCode::Config,
            format!("read {} failed: {error}", path.display()),
        )
    })?;
    parse_provider_config(&content)
}

pub fn parse_provider_config(content: &str) -> Result<ProviderConfig, TributaryError> {
    let parsed: TributaryTomlFile = toml::from_str(content).map_err(|error| {
        TributaryError::new(ErrorCode::Config, format!("parse provider config failed: {error}"))
    })?;
    let config = parsed.provider;
    if config.base_url.trim().is_empty() {
        return Err(TributaryError::new(
            ErrorCode::Config,
            "provider.base_url must not be empty",
        ));
    }
    Ok(config)
}

/// Resolves a configured credential reference into the key sent on the wire.
/// Called once when a run starts and again after a 401.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<String, TributaryError>;
}

pub type CredentialResolverRef = Arc<dyn CredentialResolver>;

#[derive(Debug, Clone, Default)]
pub struct EnvCredentialResolver {
    env: HashMap<String, String>,
}

impl EnvCredentialResolver {
    pub fn new(env: HashMap<String, String>) -> Self {
        Self { env }
    }
}

impl CredentialResolver for EnvCredentialResolver {
    fn resolve(&self, reference: &str) -> Result<String, TributaryError> {
        resolve_config_value(reference, &self.env).ok_or_else(|| {
            TributaryError::new(
                ErrorCode::AuthMissing,
                format!("API key reference '{}' resolved to an empty value", reference.trim()),
            )
        })
    }
}

fn resolve_config_value(value: &str, env_map: &HashMap<String, String>) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(env_key) = trimmed.strip_prefix('$') {
        return env_map
            .get(env_key)
            .cloned()
            .or_else(|| std::env::var(env_key).ok())
            .filter(|resolved| !resolved.trim().is_empty());
    }
    Some(trimmed.to_string())
}
