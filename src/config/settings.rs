//! Tunables, deserializable from TOML with every field defaulted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::RouteOverride;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub stream: StreamSettings,
    pub context: ContextSettings,
    pub runs: RunSettings,
    pub delegation: DelegationSettings,
    /// Extra routes appended to the built-in table.
    pub routes: Vec<RouteOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Provider handles kept in the LRU.
    pub handle_capacity: usize,
    /// Lifetime of a cached assistant config in the fast cache.
    pub assistant_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            handle_capacity: 32,
            assistant_ttl_secs: 60,
        }
    }
}

impl CacheSettings {
    pub fn assistant_ttl(&self) -> Duration {
        Duration::from_secs(self.assistant_ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Longest gap allowed between upstream fragments.
    pub idle_timeout_ms: u64,
    pub max_tool_call_bytes: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 120_000,
            max_tool_call_bytes: 64 * 1024,
        }
    }
}

impl StreamSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub threshold_percent: u8,
    /// Tokens held back from the context window for the reply.
    pub reserve_output_tokens: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            threshold_percent: 80,
            reserve_output_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Fallback wake-up interval while waiting on actions.
    pub poll_interval_ms: u64,
    /// Wake-ups allowed before a waiting run expires.
    pub max_poll_iterations: usize,
    /// Model turns allowed per run.
    pub max_resumptions: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_poll_iterations: 1200,
            max_resumptions: 20,
        }
    }
}

impl RunSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationSettings {
    pub timeout_secs: u64,
    /// Model for ephemeral workers; the parent assistant's model when unset.
    pub model: Option<String>,
}

impl Default for DelegationSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            model: None,
        }
    }
}

impl DelegationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.cache.handle_capacity, 32);
        assert_eq!(settings.runs.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let settings: Settings = toml::from_str(
            r#"
[runs]
poll_interval_ms = 50

[delegation]
model = "ollama:qwen3"
"#,
        )
        .unwrap();
        assert_eq!(settings.runs.poll_interval_ms, 50);
        assert_eq!(settings.runs.max_poll_iterations, 1200);
        assert_eq!(settings.delegation.model.as_deref(), Some("ollama:qwen3"));
        assert_eq!(settings.delegation.timeout_secs, 300);
    }
}
