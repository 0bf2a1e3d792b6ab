//! Provider router (component C6): resolves a model string to a concrete
//! upstream (provider, base URL, credential, extra headers) via a
//! four-step algorithm — alias substitution, aggregator-prefix match,
//! direct-provider-prefix match, then fall back to OpenAI.

use agentwall_core::{AgentWallError, ProviderConfig, Result};
use std::collections::HashMap;

/// Aggregator (OpenRouter) prefixes — canonical names under these route to
/// the `openrouter` entry rather than the native provider.
const AGGREGATOR_PREFIXES: &[&str] = &[
    "anthropic/",
    "google/",
    "meta-llama/",
    "mistralai/",
    "cohere/",
    "perplexity/",
    "deepseek/",
    "qwen/",
    "openrouter/",
    "groq/",
];

const GROQ_PREFIXES: &[&str] = &["llama-3", "mixtral", "gemma"];
const DEEPSEEK_PREFIXES: &[&str] = &["deepseek-chat", "deepseek-coder", "deepseek-reasoner"];
const MISTRAL_PREFIXES: &[&str] = &["mistral-", "codestral", "pixtral", "ministral"];
const OLLAMA_PREFIXES: &[&str] = &["ollama/", "local/"];
const QWEN_PREFIXES: &[&str] = &["qwen-"];

/// Canonical provider names this router resolves to. Kept as plain
/// `&'static str` keys into [`ProviderTable::entries`] rather than a closed
/// enum, since operators may add arbitrary OpenAI-compatible providers via
/// config — the built-in set only needs to be recognized, not exhaustive.
pub const OPENAI: &str = "openai";
pub const OPENROUTER: &str = "openrouter";
pub const GROQ: &str = "groq";
pub const DEEPSEEK: &str = "deepseek";
pub const MISTRAL: &str = "mistral";
pub const OLLAMA: &str = "ollama";
pub const QWEN: &str = "qwen";

/// A fully resolved upstream call target.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub provider: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    /// The model name to send upstream (alias-resolved).
    pub model: String,
}

/// The full set of known providers plus model aliases, built from
/// deployment configuration. Holds no credentials of its own beyond what
/// the caller supplied — immutable after construction, freely shared.
#[derive(Debug, Clone)]
pub struct ProviderTable {
    entries: HashMap<String, ProviderConfig>,
    aliases: HashMap<String, String>,
    default_provider: String,
}

impl ProviderTable {
    pub fn new(
        entries: HashMap<String, ProviderConfig>,
        aliases: HashMap<String, String>,
        default_provider: String,
    ) -> Self {
        Self { entries, aliases, default_provider }
    }

    /// The baseline entries a fresh deployment ships with, before any
    /// operator overrides from config are layered on top. Credentials are
    /// left unset here; `agentwall-config` fills them from each provider's
    /// standard environment variable.
    pub fn default_entries() -> HashMap<String, ProviderConfig> {
        let mut m = HashMap::new();
        m.insert(
            OPENAI.to_string(),
            ProviderConfig {
                name: OPENAI.to_string(),
                base_url: "https://api.openai.com".to_string(),
                api_key: None,
                extra_headers: Vec::new(),
            },
        );
        m.insert(
            OPENROUTER.to_string(),
            ProviderConfig {
                name: OPENROUTER.to_string(),
                base_url: "https://openrouter.ai/api".to_string(),
                api_key: None,
                extra_headers: vec![
                    ("HTTP-Referer".to_string(), "https://agentwall.io".to_string()),
                    ("X-Title".to_string(), "AgentWall".to_string()),
                ],
            },
        );
        m.insert(
            GROQ.to_string(),
            ProviderConfig {
                name: GROQ.to_string(),
                base_url: "https://api.groq.com/openai".to_string(),
                api_key: None,
                extra_headers: Vec::new(),
            },
        );
        m.insert(
            DEEPSEEK.to_string(),
            ProviderConfig {
                name: DEEPSEEK.to_string(),
                base_url: "https://api.deepseek.com".to_string(),
                api_key: None,
                extra_headers: Vec::new(),
            },
        );
        m.insert(
            MISTRAL.to_string(),
            ProviderConfig {
                name: MISTRAL.to_string(),
                base_url: "https://api.mistral.ai".to_string(),
                api_key: None,
                extra_headers: Vec::new(),
            },
        );
        m.insert(
            OLLAMA.to_string(),
            ProviderConfig {
                name: OLLAMA.to_string(),
                base_url: "http://localhost:11434".to_string(),
                api_key: None,
                extra_headers: Vec::new(),
            },
        );
        m.insert(
            QWEN.to_string(),
            ProviderConfig {
                name: QWEN.to_string(),
                base_url: "https://dashscope.aliyuncs.com/compatible-mode".to_string(),
                api_key: None,
                extra_headers: Vec::new(),
            },
        );
        m
    }

    /// Baseline model aliases — shortcuts to fully-qualified aggregator
    /// model names, checked before prefix-based routing.
    pub fn default_aliases() -> HashMap<String, String> {
        [
            ("claude-3.5-sonnet", "anthropic/claude-3.5-sonnet"),
            ("claude-3-opus", "anthropic/claude-3-opus"),
            ("claude-3-sonnet", "anthropic/claude-3-sonnet"),
            ("claude-sonnet-4", "anthropic/claude-sonnet-4"),
            ("gemini-pro", "google/gemini-pro"),
            ("gemini-flash", "google/gemini-flash-1.5"),
            ("llama-3.1-70b", "meta-llama/llama-3.1-70b-instruct"),
            ("llama-3.1-405b", "meta-llama/llama-3.1-405b-instruct"),
            ("mixtral-8x7b", "mistralai/mixtral-8x7b-instruct"),
            ("mistral-large", "mistralai/mistral-large"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    /// Resolve `model` to a concrete upstream call target. `override_credential`
    /// is the pass-through credential from the caller's own `Authorization`
    /// header, if any — it wins over the stored provider credential.
    pub fn resolve(&self, model: &str, override_credential: Option<&str>) -> Result<ResolvedRoute> {
        let canonical = self.aliases.get(model).cloned().unwrap_or_else(|| model.to_string());

        let provider_name = self.detect_provider(&canonical);
        let upstream_model = if provider_name == OLLAMA {
            strip_any_prefix(&canonical, OLLAMA_PREFIXES)
        } else {
            canonical.clone()
        };

        let config = self.entries.get(&provider_name).ok_or_else(|| {
            AgentWallError::InvalidRequest(format!("no provider configured for '{provider_name}'"))
        })?;

        Ok(ResolvedRoute {
            provider: provider_name,
            base_url: config.base_url.clone(),
            api_key: override_credential.map(str::to_string).or_else(|| config.api_key.clone()),
            extra_headers: config.extra_headers.clone(),
            model: upstream_model,
        })
    }

    /// Steps 2-4 of the resolution algorithm (step 1, alias substitution,
    /// already ran by the time `canonical` is passed in).
    fn detect_provider(&self, canonical: &str) -> String {
        if AGGREGATOR_PREFIXES.iter().any(|p| canonical.starts_with(p)) {
            return OPENROUTER.to_string();
        }

        if GROQ_PREFIXES.iter().any(|p| canonical.starts_with(p)) && !canonical.starts_with("meta-llama/") {
            return GROQ.to_string();
        }
        if DEEPSEEK_PREFIXES.iter().any(|p| canonical.starts_with(p)) {
            return DEEPSEEK.to_string();
        }
        if MISTRAL_PREFIXES.iter().any(|p| canonical.starts_with(p)) && !canonical.starts_with("mistralai/") {
            return MISTRAL.to_string();
        }
        if QWEN_PREFIXES.iter().any(|p| canonical.starts_with(p)) && !canonical.starts_with("qwen/") {
            return QWEN.to_string();
        }
        if OLLAMA_PREFIXES.iter().any(|p| canonical.starts_with(p)) {
            return OLLAMA.to_string();
        }

        self.default_provider.clone()
    }
}

fn strip_any_prefix(s: &str, prefixes: &[&str]) -> String {
    for p in prefixes {
        if let Some(rest) = s.strip_prefix(p) {
            return rest.to_string();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ProviderTable {
        ProviderTable::new(
            ProviderTable::default_entries(),
            ProviderTable::default_aliases(),
            OPENAI.to_string(),
        )
    }

    #[test]
    fn gpt_models_default_to_openai() {
        let route = table().resolve("gpt-4", None).unwrap();
        assert_eq!(route.provider, OPENAI);
        assert_eq!(route.model, "gpt-4");
    }

    #[test]
    fn alias_routes_to_openrouter_with_full_name() {
        let route = table().resolve("claude-3.5-sonnet", None).unwrap();
        assert_eq!(route.provider, OPENROUTER);
        assert_eq!(route.model, "anthropic/claude-3.5-sonnet");
    }

    #[test]
    fn explicit_aggregator_prefix_routes_to_openrouter() {
        let route = table().resolve("google/gemini-pro", None).unwrap();
        assert_eq!(route.provider, OPENROUTER);
    }

    #[test]
    fn groq_native_model_routes_direct() {
        let route = table().resolve("llama-3.1-70b-versatile", None).unwrap();
        assert_eq!(route.provider, GROQ);
    }

    #[test]
    fn deepseek_native_model_routes_direct() {
        let route = table().resolve("deepseek-chat", None).unwrap();
        assert_eq!(route.provider, DEEPSEEK);
    }

    #[test]
    fn mistral_native_model_routes_direct_and_aggregator_excluded() {
        let route = table().resolve("mistral-large-latest", None).unwrap();
        assert_eq!(route.provider, MISTRAL);
        let route = table().resolve("mistralai/mistral-large", None).unwrap();
        assert_eq!(route.provider, OPENROUTER);
    }

    #[test]
    fn ollama_prefix_routes_local_and_strips_prefix() {
        let route = table().resolve("ollama/llama3", None).unwrap();
        assert_eq!(route.provider, OLLAMA);
        assert_eq!(route.model, "llama3");
    }

    #[test]
    fn override_credential_wins_over_stored() {
        let route = table().resolve("gpt-4", Some("sk-user-supplied")).unwrap();
        assert_eq!(route.api_key.as_deref(), Some("sk-user-supplied"));
    }

    #[test]
    fn openrouter_extra_headers_carried() {
        let route = table().resolve("anthropic/claude-3-opus", None).unwrap();
        assert!(route.extra_headers.iter().any(|(k, _)| k == "HTTP-Referer"));
    }
}
