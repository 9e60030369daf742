use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chatflow_llm::{DEFAULT_OPENAI_MODEL, ProviderConfig};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::processor::DEFAULT_MAX_TOOL_ROUNDS;

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const CONFIG_DIRECTORY_NAME: &str = "chatflow";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const CONFIG_ENV_PREFIX: &str = "CHATFLOW_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            default_model: default_model(),
        }
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            Some(self.default_model.clone()),
        ))
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.default_model = non_blank_or(self.default_model, default_model);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub provider: ProviderSettings,
    /// Tool rounds allowed in one turn before it fails.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::default(),
            max_tool_rounds: default_max_tool_rounds(),
            system_prompt: None,
        }
    }
}

impl EngineConfig {
    pub fn normalized(mut self) -> Self {
        self.provider = self.provider.normalized();
        self.system_prompt = self
            .system_prompt
            .map(|prompt| prompt.trim().to_string())
            .filter(|prompt| !prompt.is_empty());
        self
    }
}

/// Engine configuration loaded from disk and the environment, swappable at runtime.
pub struct ConfigStore {
    config: Arc<ArcSwap<EngineConfig>>,
    config_path: PathBuf,
}

impl ConfigStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chatflow"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let config = Self::load_from_disk(&config_path);
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.load_full()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, config: EngineConfig) -> Result<(), ConfigError> {
        let normalized_config = config.normalized();
        self.persist(&normalized_config)?;
        self.config.store(Arc::new(normalized_config));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> EngineConfig {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
        }

        // Environment wins over the file, e.g. CHATFLOW_PROVIDER__API_KEY.
        let figment = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"));

        match figment.extract::<EngineConfig>() {
            Ok(config) => config.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse config, using defaults"
                );
                EngineConfig::default()
            }
        }
    }

    fn persist(&self, config: &EngineConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-config-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(config).context(SerializeConfigSnafu {
            stage: "serialize-config-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-config-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-config-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved config");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to create config directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize config on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write config file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace config file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback()
    } else {
        value.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_max_tool_rounds() -> u32 {
    DEFAULT_MAX_TOOL_ROUNDS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path().join("absent.json"));
        let config = store.config();
        assert_eq!(config.max_tool_rounds, DEFAULT_MAX_TOOL_ROUNDS);
        assert_eq!(config.provider.provider_id, DEFAULT_PROVIDER_ID);
        assert!(config.provider.to_provider_config().is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"{ "provider": { "api_key": " sk-test ", "default_model": "" }, "max_tool_rounds": 3 }"#,
        )
        .expect("write config");

        let config = ConfigStore::new(path).config();
        assert_eq!(config.max_tool_rounds, 3);
        assert_eq!(config.provider.api_key, "sk-test");
        assert_eq!(config.provider.default_model, DEFAULT_OPENAI_MODEL);

        let provider = config.provider.to_provider_config().expect("api key present");
        assert_eq!(provider.base_url, DEFAULT_ENDPOINT);
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{ "max_tool_rounds": "many" }"#).expect("write config");

        assert_eq!(*ConfigStore::new(path).config(), EngineConfig::default());
    }

    #[test]
    fn update_persists_and_swaps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let store = ConfigStore::new(path.clone());

        let mut config = EngineConfig::default();
        config.system_prompt = Some("  be brief  ".to_string());
        config.max_tool_rounds = 2;
        store.update(config).expect("update");

        assert_eq!(store.config().system_prompt.as_deref(), Some("be brief"));
        assert!(!path.with_extension("json.tmp").exists());
        let reloaded = ConfigStore::new(path);
        assert_eq!(reloaded.config().max_tool_rounds, 2);
        assert_eq!(reloaded.config().system_prompt.as_deref(), Some("be brief"));
    }
}
