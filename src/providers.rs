//! Provider abstraction and registry.
//!
//! The set of backends is fixed, so a provider is a closed enum rather than a
//! trait object. [`ProviderRegistry::resolve`] is the only way to build one.

use crate::claude::ClaudeProvider;
use crate::config::{Config, ConfigStore, PROVIDER_NAMES, ProviderConfig, ProviderKind};
use crate::error::ProviderError;
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::local::LocalProvider;
use crate::openai_compat::OpenAiCompatibleProvider;
use crate::runtime::{ProgressFn, RuntimeManager};
use std::sync::Arc;
use tracing::debug;

/// Completion budget for API backends when the config sets none.
pub const DEFAULT_API_MAX_TOKENS: u32 = 256;

/// `num_predict` for the local runtime when the config sets none.
pub const DEFAULT_LOCAL_MAX_TOKENS: u32 = 100;

/// Stop sequences for the local runtime. A blank line or an explanation
/// heading means the command is over.
const LOCAL_STOP: [&str; 3] = ["\n\n", "Explanation:", "Note:"];

/// Backend-specific sampling options for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

impl GenerationOptions {
    pub fn for_provider(config: &ProviderConfig) -> Self {
        match config.kind {
            ProviderKind::Local => Self {
                temperature: config.temperature,
                max_tokens: config.max_tokens.unwrap_or(DEFAULT_LOCAL_MAX_TOKENS),
                stop: LOCAL_STOP.iter().map(|s| s.to_string()).collect(),
            },
            ProviderKind::OpenAiCompatible | ProviderKind::Claude => Self {
                temperature: config.temperature,
                max_tokens: config.max_tokens.unwrap_or(DEFAULT_API_MAX_TOKENS),
                stop: Vec::new(),
            },
        }
    }
}

/// A system/user prompt pair plus options. Built per call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub options: GenerationOptions,
}

impl GenerationRequest {
    pub fn new(system_prompt: String, user_prompt: String, options: GenerationOptions) -> Self {
        Self {
            system_prompt,
            user_prompt,
            options,
        }
    }
}

pub enum Provider {
    Local(LocalProvider),
    OpenAiCompatible(OpenAiCompatibleProvider),
    Claude(ClaudeProvider),
}

impl Provider {
    pub fn name(&self) -> &str {
        &self.config().name
    }

    pub fn kind(&self) -> ProviderKind {
        self.config().kind
    }

    pub fn config(&self) -> &ProviderConfig {
        match self {
            Provider::Local(p) => p.config(),
            Provider::OpenAiCompatible(p) => p.config(),
            Provider::Claude(p) => p.config(),
        }
    }

    /// API backends only check for a key; the local runtime is probed.
    pub async fn is_available(&self) -> bool {
        match self {
            Provider::Local(p) => p.is_available().await,
            Provider::OpenAiCompatible(p) => p.is_available(),
            Provider::Claude(p) => p.is_available(),
        }
    }

    /// How to make this provider usable.
    pub fn setup_hint(&self) -> String {
        match self {
            Provider::Local(_) => {
                "Start the local runtime or install it: https://ollama.com/download".to_string()
            }
            _ => {
                let name = self.name();
                let env = Config::api_key_env_var(name).unwrap_or("API_KEY");
                format!(
                    "Set an API key:\n  dictum config set {}.api_key <your-key>\n  or: export {}=<your-key>",
                    name, env
                )
            }
        }
    }

    /// Do any slow one-time setup ahead of generation. Only the local
    /// provider has any (install, server start, model pull).
    pub async fn prepare(&self, progress: ProgressFn<'_>) -> Result<(), ProviderError> {
        match self {
            Provider::Local(p) => p.prepare(progress).await.map(|_| ()),
            Provider::OpenAiCompatible(_) | Provider::Claude(_) => Ok(()),
        }
    }

    pub fn request(&self, system_prompt: String, user_prompt: String) -> GenerationRequest {
        GenerationRequest::new(
            system_prompt,
            user_prompt,
            GenerationOptions::for_provider(self.config()),
        )
    }

    /// Send one request and return the raw generated text.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let started = std::time::Instant::now();
        let result = match self {
            Provider::Local(p) => p.generate(request).await,
            Provider::OpenAiCompatible(p) => p.generate(request).await,
            Provider::Claude(p) => p.generate(request).await,
        };
        debug!("{} responded in {:?}", self.name(), started.elapsed());
        result
    }
}

/// Builds providers from configuration.
pub struct ProviderRegistry {
    config: Config,
    store: ConfigStore,
    http: Arc<dyn HttpClient>,
}

impl ProviderRegistry {
    pub fn new(config: Config, store: ConfigStore) -> Self {
        Self::with_http_client(config, store, Arc::new(ReqwestHttpClient::new()))
    }

    pub fn with_http_client(config: Config, store: ConfigStore, http: Arc<dyn HttpClient>) -> Self {
        Self { config, store, http }
    }

    pub fn names() -> &'static [&'static str] {
        &PROVIDER_NAMES
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolve(&self, name: &str) -> Result<Provider, ProviderError> {
        let provider_config =
            self.config
                .provider_config(name)
                .ok_or_else(|| ProviderError::UnknownProvider {
                    name: name.to_string(),
                    known: PROVIDER_NAMES.join(", "),
                })?;
        debug!("Resolved provider {} ({:?})", name, provider_config.kind);

        let http = Arc::clone(&self.http);
        Ok(match provider_config.kind {
            ProviderKind::Local => {
                let runtime = RuntimeManager::new(self.store.dir(), &provider_config.endpoint);
                Provider::Local(LocalProvider::new(
                    provider_config,
                    http,
                    runtime,
                    Some(self.store.clone()),
                ))
            }
            ProviderKind::OpenAiCompatible => {
                Provider::OpenAiCompatible(OpenAiCompatibleProvider::new(provider_config, http))
            }
            ProviderKind::Claude => Provider::Claude(ClaudeProvider::new(provider_config, http)),
        })
    }

    /// The configured default provider.
    pub fn default_provider(&self) -> Result<Provider, ProviderError> {
        self.resolve(&self.config.provider)
    }
}
