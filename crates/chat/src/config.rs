use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use murmur_llm::{DEFAULT_LOCAL_MODEL, Model, ModelWhitelist, ProviderConfig, default_local_models};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

pub const CONFIG_DIRECTORY_NAME: &str = "murmur";
pub const CONFIG_FILE_NAME: &str = "settings.json";
pub const HISTORY_FILE_NAME: &str = "history.sqlite";
pub const ENV_PREFIX: &str = "MURMUR_";
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/v1";
pub const DEFAULT_API_KEY: &str = "local";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to extract configuration on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
    #[snafu(display("invalid configuration value for `{field}` on `{stage}`: {details}"))]
    InvalidValue {
        stage: &'static str,
        field: &'static str,
        details: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ModelSettings {
    fn as_model(&self) -> Model {
        let id = self.id.trim().to_string();
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map_or_else(|| id.clone(), str::to_string);
        let model = Model::new(id, name);
        match self.description.as_deref().map(str::trim) {
            Some(description) if !description.is_empty() => model.with_description(description),
            _ => model,
        }
    }
}

impl From<&Model> for ModelSettings {
    fn from(model: &Model) -> Self {
        Self {
            id: model.id.clone(),
            name: Some(model.name.clone()),
            description: model.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Disabled storage keeps history in memory for the process lifetime.
    #[serde(default = "default_true")]
    pub persist: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            persist: true,
            path: None,
        }
    }
}

impl StorageSettings {
    pub fn database_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| default_data_dir().join(HISTORY_FILE_NAME))
    }
}

/// Tunables of the chat pipeline. Loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    pub max_message_length: usize,
    /// Bounds both the in-memory window and the persisted history.
    pub max_history: usize,
    pub daily_request_quota: u64,
    pub request_timeout_secs: u64,
    pub render_interval_ms: u64,
    pub scroll_interval_ms: u64,
    pub markdown_cache_capacity: usize,
    pub models: Vec<ModelSettings>,
    pub default_model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    pub endpoint: String,
    pub api_key: String,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_length: 4_000,
            max_history: 20,
            daily_request_quota: 200,
            request_timeout_secs: 120,
            render_interval_ms: 50,
            scroll_interval_ms: 100,
            markdown_cache_capacity: 100,
            models: default_local_models().iter().map(ModelSettings::from).collect(),
            default_model: DEFAULT_LOCAL_MODEL.to_string(),
            temperature: Some(0.7),
            max_tokens: Some(1_024),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            storage: StorageSettings::default(),
        }
    }
}

impl ChatConfig {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    /// Loads defaults, then the JSON file, then `MURMUR_` environment overrides.
    /// Any failure is logged and the defaults are used instead.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "settings file not found, using defaults and environment"
            );
        }

        match Self::try_load_from(path) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    %error,
                    "failed to load settings, using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn try_load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract::<Self>()
            .context(ExtractSnafu {
                stage: "extract-chat-config",
            })?;
        config.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        ensure!(
            self.max_history > 0,
            InvalidValueSnafu {
                stage: "validate-chat-config",
                field: "max_history",
                details: "must keep at least one message".to_string(),
            }
        );
        ensure!(
            self.request_timeout_secs > 0,
            InvalidValueSnafu {
                stage: "validate-chat-config",
                field: "request_timeout_secs",
                details: "must be at least one second".to_string(),
            }
        );
        if let Some(temperature) = self.temperature {
            ensure!(
                temperature.is_finite() && temperature >= 0.0,
                InvalidValueSnafu {
                    stage: "validate-chat-config",
                    field: "temperature",
                    details: format!("{temperature} is not a non-negative number"),
                }
            );
        }
        Ok(self.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.max_message_length = self.max_message_length.max(1);
        self.max_history = self.max_history.max(1);
        self.markdown_cache_capacity = self.markdown_cache_capacity.max(1);
        self.endpoint = if self.endpoint.trim().is_empty() {
            DEFAULT_ENDPOINT.to_string()
        } else {
            self.endpoint.trim().trim_end_matches('/').to_string()
        };
        self.api_key = if self.api_key.trim().is_empty() {
            DEFAULT_API_KEY.to_string()
        } else {
            self.api_key.trim().to_string()
        };

        // Keep the default model selectable.
        let whitelist = self.model_whitelist();
        self.models = whitelist.models().iter().map(ModelSettings::from).collect();
        self.default_model = self.default_model.trim().to_string();
        if !whitelist.contains(&self.default_model) {
            let fallback = whitelist
                .ids()
                .next()
                .unwrap_or(DEFAULT_LOCAL_MODEL)
                .to_string();
            tracing::warn!(
                configured = %self.default_model,
                fallback = %fallback,
                "default model is not in the model list"
            );
            self.default_model = fallback;
        }
        self
    }

    pub fn model_whitelist(&self) -> ModelWhitelist {
        let whitelist = ModelWhitelist::new(self.models.iter().map(ModelSettings::as_model));
        if whitelist.is_empty() {
            ModelWhitelist::default()
        } else {
            whitelist
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.endpoint, &self.api_key)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms)
    }

    pub fn scroll_interval(&self) -> Duration {
        Duration::from_millis(self.scroll_interval_ms)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(CONFIG_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".murmur"))
}

fn default_true() -> bool {
    true
}
