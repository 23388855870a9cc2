//! Configuration system (layered: defaults < TOML file < env < code).

mod limits;
pub mod settings;

pub use settings::{
    CacheSettings, ContextSettings, DelegationSettings, RunSettings, Settings, StreamSettings,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use directories::ProjectDirs;

use crate::error::TurnstileError;
use crate::models::RouteTable;

/// Global default config (lazy-initialized from env).
static DEFAULT_CONFIG: OnceLock<TurnstileConfig> = OnceLock::new();

const API_KEY_ENV: [(&str, &str); 5] = [
    ("OPENAI_API_KEY", "openai"),
    ("ANTHROPIC_API_KEY", "anthropic"),
    ("GROQ_API_KEY", "groq"),
    ("TOGETHER_API_KEY", "together"),
    ("OPENROUTER_API_KEY", "openrouter"),
];

const BASE_URL_ENV: [(&str, &str); 3] = [
    ("OPENAI_BASE_URL", "openai"),
    ("ANTHROPIC_BASE_URL", "anthropic"),
    ("OLLAMA_BASE_URL", "ollama"),
];

/// Layered configuration for Turnstile.
///
/// Credentials live behind shared locks so clones handed to provider
/// factories see later `set_api_key` calls.
#[derive(Debug, Clone, Default)]
pub struct TurnstileConfig {
    api_keys: Arc<RwLock<HashMap<String, String>>>,
    base_urls: Arc<RwLock<HashMap<String, String>>>,
    settings: Settings,
}

impl TurnstileConfig {
    /// Empty credentials and default settings. Reads nothing from the environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from environment variables (OPENAI_API_KEY, TURNSTILE_*, etc.).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = Self::new();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Defaults, then the TOML file (`path` or the default location), then env.
    ///
    /// A missing file is fine; a malformed one is a configuration error.
    pub fn load(path: Option<&Path>) -> Result<Self, TurnstileError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::new();
        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        if let Some(path) = path {
            match std::fs::read_to_string(&path) {
                Ok(raw) => config.settings = Self::parse_settings(&raw)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Get (or create) the global default config.
    pub fn global() -> &'static TurnstileConfig {
        DEFAULT_CONFIG.get_or_init(Self::from_env)
    }

    pub fn parse_settings(raw: &str) -> Result<Settings, TurnstileError> {
        toml::from_str(raw)
            .map_err(|e| TurnstileError::Configuration(format!("invalid config file: {e}")))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (env_var, provider) in &API_KEY_ENV {
            if let Some(key) = lookup(env_var) {
                self.set_api_key(provider, key);
            }
        }
        for (env_var, provider) in &BASE_URL_ENV {
            if let Some(url) = lookup(env_var) {
                self.set_base_url(provider, url);
            }
        }
        limits::apply_env_overrides(&mut self.settings, lookup);
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn set_api_key(&self, provider: &str, key: String) {
        if let Ok(mut keys) = self.api_keys.write() {
            keys.insert(provider.to_string(), key);
        }
    }

    pub fn get_api_key(&self, provider: &str) -> Option<String> {
        self.api_keys.read().ok()?.get(provider).cloned()
    }

    pub fn set_base_url(&self, provider: &str, url: String) {
        if let Ok(mut urls) = self.base_urls.write() {
            urls.insert(provider.to_string(), url);
        }
    }

    pub fn get_base_url(&self, provider: &str) -> Option<String> {
        self.base_urls.read().ok()?.get(provider).cloned()
    }

    pub fn has_credentials(&self, provider: &str) -> bool {
        self.get_api_key(provider).is_some()
    }

    /// Built-in routes plus the configured extras.
    pub fn route_table(&self) -> Result<RouteTable, TurnstileError> {
        let mut table = RouteTable::builtin();
        for route in &self.settings.routes {
            table.apply(route.clone())?;
        }
        Ok(table)
    }
}

/// `<config dir>/turnstile/config.toml` for the current platform.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "turnstile").map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn keys_and_urls_are_shared_between_clones() {
        let config = TurnstileConfig::new();
        let clone = config.clone();
        config.set_api_key("openai", "sk-1".into());
        config.set_base_url("ollama", "http://gpu:11434".into());
        assert_eq!(clone.get_api_key("openai").as_deref(), Some("sk-1"));
        assert_eq!(clone.get_base_url("ollama").as_deref(), Some("http://gpu:11434"));
        assert!(!clone.has_credentials("anthropic"));
    }

    #[test]
    fn env_lookup_populates_credentials_and_tunables() {
        let mut config = TurnstileConfig::new();
        config.apply_env(|key| match key {
            "GROQ_API_KEY" => Some("gsk".into()),
            "TURNSTILE_MAX_POLL_ITERATIONS" => Some("7".into()),
            _ => None,
        });
        assert_eq!(config.get_api_key("groq").as_deref(), Some("gsk"));
        assert_eq!(config.settings().runs.max_poll_iterations, 7);
    }

    #[test]
    fn load_reads_file_and_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let missing = TurnstileConfig::load(Some(&path)).unwrap();
        assert_eq!(missing.settings().context, ContextSettings::default());

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[context]\nthreshold_percent = 50").unwrap();
        let loaded = TurnstileConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.settings().context.threshold_percent, 50);
    }

    #[test]
    fn malformed_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[runs\npoll_interval_ms = ").unwrap();
        assert!(matches!(
            TurnstileConfig::load(Some(&path)),
            Err(TurnstileError::Configuration(_))
        ));
    }

    #[test]
    fn configured_routes_reach_the_table() {
        let settings = TurnstileConfig::parse_settings(
            r#"
[[routes]]
provider = "lab"
model = "*"
backend = "openai-compatible"
base_url = "http://lab/v1"
"#,
        )
        .unwrap();
        let config = TurnstileConfig::new().with_settings(settings);
        let route = config.route_table().unwrap().resolve("lab:anything").unwrap();
        assert_eq!(route.base_url.as_deref(), Some("http://lab/v1"));
    }
}
