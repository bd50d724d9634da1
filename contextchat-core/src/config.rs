//! Session and backend configuration.
//!
//! Backend credentials come from the environment the same way provider SDKs
//! read them (`ANTHROPIC_API_KEY`, `OPENAI_API_KEY`, `GOOGLE_API_KEY` or
//! `GEMINI_API_KEY`). Everything else has plain defaults with builder
//! overrides.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::llm::{BackendKind, ClientConfig, ConversationConfig};
use crate::orchestrator::ConversionFallback;

/// Credentials and overrides for one provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCredentials {
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ProviderCredentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Client configuration with the given request timeout.
    pub fn client_config(&self, timeout_secs: u64) -> ClientConfig {
        let mut config = ClientConfig::new(self.api_key.clone()).with_timeout(timeout_secs);
        if let Some(url) = &self.base_url {
            config = config.with_base_url(url.clone());
        }
        if let Some(model) = &self.model {
            config = config.with_default_model(model.clone());
        }
        config
    }
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

/// Which providers have credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub providers: BTreeMap<BackendKind, ProviderCredentials>,
}

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detect providers from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Detect providers from `(name, value)` pairs. Empty values count as unset.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();

        let mut config = Self::new();
        for kind in BackendKind::PRIORITY {
            let Some(api_key) = kind.api_key_vars().iter().find_map(|var| vars.get(*var)) else {
                continue;
            };
            let mut credentials = ProviderCredentials::new(api_key.trim());
            if let Some(url) = vars.get(kind.base_url_var()) {
                credentials = credentials.with_base_url(url.trim());
            }
            if let Some(model) = vars.get(kind.model_var()) {
                credentials = credentials.with_model(model.trim());
            }
            config.providers.insert(kind, credentials);
        }
        config
    }

    pub fn with_provider(mut self, kind: BackendKind, credentials: ProviderCredentials) -> Self {
        self.providers.insert(kind, credentials);
        self
    }

    pub fn available_providers(&self) -> BTreeSet<BackendKind> {
        self.providers.keys().copied().collect()
    }

    /// Highest-priority configured provider.
    pub fn preferred(&self) -> Option<(BackendKind, &ProviderCredentials)> {
        BackendKind::PRIORITY
            .into_iter()
            .find_map(|kind| self.providers.get(&kind).map(|c| (kind, c)))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Settings for one chat session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Conversation timeouts and limits
    pub conversation: ConversationConfig,
    /// What to do when markup conversion fails
    pub conversion_fallback: ConversionFallback,
    /// Timeout for retrieving rendered markup in milliseconds
    pub markup_timeout_ms: u64,
    /// Queued session events
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            conversation: ConversationConfig::default(),
            conversion_fallback: ConversionFallback::default(),
            markup_timeout_ms: 30_000,
            event_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn with_conversation(mut self, conversation: ConversationConfig) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn with_conversion_fallback(mut self, fallback: ConversionFallback) -> Self {
        self.conversion_fallback = fallback;
        self
    }

    pub fn with_markup_timeout(mut self, timeout_ms: u64) -> Self {
        self.markup_timeout_ms = timeout_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_no_keys_means_no_providers() {
        let config = BackendConfig::from_vars([("HOME", "/root"), ("OPENAI_API_KEY", "  ")]);
        assert!(config.is_empty());
        assert!(config.preferred().is_none());
    }

    #[test]
    fn test_priority_prefers_anthropic() {
        let config = BackendConfig::from_vars([
            ("GOOGLE_API_KEY", "g"),
            ("OPENAI_API_KEY", "o"),
            ("ANTHROPIC_API_KEY", "a"),
        ]);

        assert_eq!(config.available_providers().len(), 3);
        let (kind, credentials) = config.preferred().unwrap();
        assert_eq!(kind, BackendKind::Anthropic);
        assert_eq!(credentials.api_key, "a");
    }

    #[test]
    fn test_openai_beats_google() {
        let config = BackendConfig::from_vars([("GEMINI_API_KEY", "g"), ("OPENAI_API_KEY", "o")]);
        assert_eq!(config.preferred().map(|(k, _)| k), Some(BackendKind::OpenAI));
    }

    #[test]
    fn test_google_key_falls_back_to_gemini_var() {
        let config = BackendConfig::from_vars([("GEMINI_API_KEY", "gem")]);
        let (kind, credentials) = config.preferred().unwrap();
        assert_eq!(kind, BackendKind::Google);
        assert_eq!(credentials.api_key, "gem");

        let config =
            BackendConfig::from_vars([("GEMINI_API_KEY", "gem"), ("GOOGLE_API_KEY", "goo")]);
        assert_eq!(config.preferred().unwrap().1.api_key, "goo");
    }

    #[test]
    fn test_overrides_are_picked_up() {
        let config = BackendConfig::from_vars([
            ("OPENAI_API_KEY", "o"),
            ("OPENAI_BASE_URL", "http://localhost:8080"),
            ("OPENAI_MODEL", "gpt-4o-mini"),
        ]);
        let client = config.preferred().unwrap().1.client_config(30);

        assert_eq!(client.base_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(client.default_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(client.timeout_secs, 30);
    }

    #[test]
    fn test_debug_redacts_key() {
        let credentials = ProviderCredentials::new("sk-secret");
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.conversion_fallback, ConversionFallback::RawMarkup);
        assert_eq!(config.markup_timeout_ms, 30_000);
        assert_eq!(config.conversation.request_timeout_ms, 120_000);
    }
}
