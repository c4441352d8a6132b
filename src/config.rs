//! Configuration file, defaults and environment overrides.
//!
//! The configuration lives in `<config_dir>/config.toml`, where `config_dir`
//! is `$DICTUM_HOME` or `~/.dictum`. All file I/O goes through [`ConfigStore`];
//! the loaded [`Config`] is a plain value handed to whoever needs it.

use anyhow::{anyhow, bail, Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_LOCAL_URL: &str = "http://127.0.0.1:11434";

/// Provider names accepted by `provider` and `--provider`.
pub const PROVIDER_NAMES: [&str; 5] = ["local", "openai", "claude", "deepseek", "grok"];

/// Backend family a provider name maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    OpenAiCompatible,
    Claude,
}

/// Fully resolved settings for one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    /// Empty only for the local kind, where the runtime picks a model by RAM.
    pub model: String,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: String,
    pub local: LocalConfig,
    pub openai: ApiConfig,
    pub claude: ApiConfig,
    pub deepseek: ApiConfig,
    pub grok: ApiConfig,
    pub safety: SafetyConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Empty means "choose by installed RAM on first use".
    pub model: String,
    pub url: String,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Literal substrings that force a Critical verdict.
    pub blocked_commands: Vec<String>,
    pub require_confirm_dangerous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Extra attempts after the first; 0 disables retrying.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            local: LocalConfig::default(),
            openai: ApiConfig::with_model("gpt-4o-mini"),
            claude: ApiConfig::with_model("claude-3-5-haiku-20241022"),
            deepseek: ApiConfig::with_model("deepseek-chat"),
            grok: ApiConfig::with_model("grok-2-latest"),
            safety: SafetyConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            url: DEFAULT_LOCAL_URL.to_string(),
            temperature: 0.0,
            max_tokens: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: String::new(),
            base_url: String::new(),
            temperature: 0.1,
            max_tokens: None,
        }
    }
}

impl ApiConfig {
    fn with_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Self::default()
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            blocked_commands: vec![
                ":(){ :|:& };:".to_string(),
                "dd if=/dev/zero of=/dev/sda".to_string(),
                "mkfs.ext4 /dev/sda".to_string(),
                "> /dev/sda".to_string(),
            ],
            require_confirm_dangerous: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 500,
            max_delay_ms: 8000,
        }
    }
}

/// Endpoint and model used when the config leaves them blank.
fn api_defaults(name: &str) -> Option<(&'static str, &'static str)> {
    match name {
        "openai" => Some(("https://api.openai.com/v1", "gpt-4o-mini")),
        "deepseek" => Some(("https://api.deepseek.com/v1", "deepseek-chat")),
        "grok" => Some(("https://api.x.ai/v1", "grok-2-latest")),
        "claude" => Some(("https://api.anthropic.com/v1", "claude-3-5-haiku-20241022")),
        _ => None,
    }
}

fn or_default(value: &str, default: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

impl Config {
    /// Apply environment overrides. Values from the environment win over the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.openai.api_key = key;
        }
        if let Some(key) = non_empty("ANTHROPIC_API_KEY") {
            self.claude.api_key = key;
        }
        if let Some(key) = non_empty("DEEPSEEK_API_KEY") {
            self.deepseek.api_key = key;
        }
        if let Some(key) = non_empty("GROK_API_KEY").or_else(|| non_empty("XAI_API_KEY")) {
            self.grok.api_key = key;
        }
        if let Some(provider) = non_empty("DICTUM_PROVIDER") {
            self.provider = provider;
        }
    }

    fn api_section(&self, name: &str) -> Option<&ApiConfig> {
        match name {
            "openai" => Some(&self.openai),
            "claude" => Some(&self.claude),
            "deepseek" => Some(&self.deepseek),
            "grok" => Some(&self.grok),
            _ => None,
        }
    }

    /// Resolve the settings for a provider name, filling in per-backend defaults.
    pub fn provider_config(&self, name: &str) -> Option<ProviderConfig> {
        if name == "local" {
            return Some(ProviderConfig {
                name: name.to_string(),
                kind: ProviderKind::Local,
                endpoint: or_default(&self.local.url, DEFAULT_LOCAL_URL),
                model: self.local.model.trim().to_string(),
                api_key: String::new(),
                temperature: self.local.temperature,
                max_tokens: self.local.max_tokens,
            });
        }

        let section = self.api_section(name)?;
        let (endpoint, model) = api_defaults(name)?;
        let kind = if name == "claude" {
            ProviderKind::Claude
        } else {
            ProviderKind::OpenAiCompatible
        };

        Some(ProviderConfig {
            name: name.to_string(),
            kind,
            endpoint: or_default(&section.base_url, endpoint).trim_end_matches('/').to_string(),
            model: or_default(&section.model, model),
            api_key: section.api_key.trim().to_string(),
            temperature: section.temperature,
            max_tokens: section.max_tokens,
        })
    }

    /// Environment variable that can supply the API key for a provider.
    pub fn api_key_env_var(name: &str) -> Option<&'static str> {
        match name {
            "openai" => Some("OPENAI_API_KEY"),
            "claude" => Some("ANTHROPIC_API_KEY"),
            "deepseek" => Some("DEEPSEEK_API_KEY"),
            "grok" => Some("GROK_API_KEY"),
            _ => None,
        }
    }
}

/// Shorten a secret for display.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.is_empty() {
        "-".to_string()
    } else if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "****".to_string()
    }
}

/// Owns the on-disk location of the configuration.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$DICTUM_HOME`, or `~/.dictum`.
    pub fn default_location() -> Result<Self> {
        if let Some(dir) = std::env::var_os("DICTUM_HOME").filter(|d| !d.is_empty()) {
            return Ok(Self::new(dir));
        }
        let home = home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
        Ok(Self::new(home.join(".dictum")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.toml")
    }

    /// Load the effective configuration: file (or defaults), then environment.
    ///
    /// A missing or unreadable file is not fatal.
    pub fn load(&self) -> Config {
        let mut config = if self.config_path().exists() {
            self.load_file().unwrap_or_else(|e| {
                warn!("Ignoring invalid config file: {:#}", e);
                Config::default()
            })
        } else {
            info!("No config file found, using defaults");
            Config::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Load only what is in the file, without environment overrides.
    pub fn load_file(&self) -> Result<Config> {
        let path = self.config_path();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn save(&self, config: &Config) -> Result<()> {
        let path = self.config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(config)?;
        fs::write(&path, content)?;
        info!("Saved config to: {}", path.display());
        Ok(())
    }

    /// Write a fresh default configuration file.
    pub fn init(&self) -> Result<PathBuf> {
        self.save(&Config::default())?;
        Ok(self.config_path())
    }

    fn file_or_default(&self) -> Result<Config> {
        if self.config_path().exists() {
            self.load_file()
        } else {
            Ok(Config::default())
        }
    }

    /// Read a dotted key (e.g. `local.model`) from the effective configuration.
    pub fn get(&self, key: &str) -> Result<String> {
        let value = toml::Value::try_from(self.load())?;
        match lookup(&value, key) {
            Some(v) if key.ends_with("api_key") => Ok(mask_secret(v.as_str().unwrap_or_default())),
            Some(v) => Ok(display_value(v)),
            None if is_optional_key(key) => Ok(String::new()),
            None => bail!("unknown key: {}\nRun 'dictum config show' to see available options", key),
        }
    }

    /// Set a dotted key in the config file, keeping the existing value's type.
    pub fn set(&self, key: &str, raw: &str) -> Result<()> {
        let config = self.file_or_default()?;
        let mut value = toml::Value::try_from(&config)?;

        let existing = lookup(&value, key).cloned();
        if existing.is_none() && !is_optional_key(key) {
            bail!("unknown key: {}\nRun 'dictum config show' to see available options", key);
        }

        let parsed = parse_value(existing.as_ref(), raw)
            .with_context(|| format!("invalid value for {}: {}", key, raw))?;
        insert(&mut value, key, parsed)?;

        let updated: Config = value
            .try_into()
            .with_context(|| format!("invalid value for {}: {}", key, raw))?;
        self.save(&updated)
    }
}

impl ConfigStore {
    /// Human-readable summary of the effective configuration, keys masked.
    pub fn show(&self) -> Result<String> {
        let file = self.file_or_default()?;
        let effective = self.load();
        Ok(describe(&effective, &file, &self.config_path()))
    }
}

fn describe(effective: &Config, file: &Config, path: &Path) -> String {
    let mut lines = vec![
        format!("Config file: {}", path.display()),
        String::new(),
        format!("provider = {}", effective.provider),
        String::new(),
        "[local]".to_string(),
        format!(
            "model = {}",
            if effective.local.model.is_empty() { "(auto)" } else { effective.local.model.as_str() }
        ),
        format!("url = {}", effective.local.url),
    ];

    for name in PROVIDER_NAMES.iter().filter(|n| **n != "local") {
        let (Some(section), Some(saved)) = (effective.api_section(name), file.api_section(name)) else {
            continue;
        };
        let mut key = mask_secret(&section.api_key);
        if !section.api_key.is_empty() && section.api_key != saved.api_key {
            if let Some(env) = Config::api_key_env_var(name) {
                key = format!("{} (from environment, e.g. {})", key, env);
            }
        }
        lines.push(String::new());
        lines.push(format!("[{}]", name));
        lines.push(format!("api_key = {}", key));
        lines.push(format!("model = {}", section.model));
        if !section.base_url.is_empty() {
            lines.push(format!("base_url = {}", section.base_url));
        }
    }

    lines.push(String::new());
    lines.push("[safety]".to_string());
    lines.push(format!("blocked_commands = {}", effective.safety.blocked_commands.join(", ")));
    lines.push(format!(
        "require_confirm_dangerous = {}",
        effective.safety.require_confirm_dangerous
    ));
    lines.push(String::new());
    lines.push("[retry]".to_string());
    lines.push(format!("max_retries = {}", effective.retry.max_retries));
    lines.join("\n")
}

const OPTIONAL_KEYS: [&str; 5] = [
    "local.max_tokens",
    "openai.max_tokens",
    "claude.max_tokens",
    "deepseek.max_tokens",
    "grok.max_tokens",
];

fn is_optional_key(key: &str) -> bool {
    OPTIONAL_KEYS.contains(&key)
}

fn lookup<'a>(value: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    key.split('.').try_fold(value, |v, part| v.get(part))
}

fn insert(root: &mut toml::Value, key: &str, new_value: toml::Value) -> Result<()> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let leaf = parts.pop().ok_or_else(|| anyhow!("empty key"))?;

    let mut current = root;
    for part in parts {
        current = current
            .get_mut(part)
            .ok_or_else(|| anyhow!("unknown section: {}", part))?;
    }

    let table = current
        .as_table_mut()
        .ok_or_else(|| anyhow!("{} is not a section", key))?;
    table.insert(leaf.to_string(), new_value);
    Ok(())
}

fn parse_value(existing: Option<&toml::Value>, raw: &str) -> Result<toml::Value> {
    let raw = raw.trim();
    Ok(match existing {
        Some(toml::Value::Boolean(_)) => toml::Value::Boolean(raw.parse()?),
        Some(toml::Value::Integer(_)) => toml::Value::Integer(raw.parse()?),
        Some(toml::Value::Float(_)) => toml::Value::Float(raw.parse()?),
        Some(toml::Value::Array(_)) => toml::Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_string()))
                .collect(),
        ),
        Some(_) => toml::Value::String(raw.to_string()),
        // Only the optional integer keys can be absent.
        None => toml::Value::Integer(raw.parse()?),
    })
}

fn display_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => items
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}
