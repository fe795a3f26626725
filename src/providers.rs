//! Built-in provider presets for common LLM API providers.
//!
//! A model entry can name a preset instead of spelling out the base URL,
//! protocol, and API key variable.

use crate::adapter::Protocol;

#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub base_url: &'static str,
    pub protocol: Protocol,
    pub default_api_key_env: &'static str,
    /// Local servers accept requests without a key.
    pub requires_api_key: bool,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        protocol: Protocol::OpenAi,
        default_api_key_env: "OPENAI_API_KEY",
        requires_api_key: true,
    },
    ProviderPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
        protocol: Protocol::OpenAi,
        default_api_key_env: "OPENROUTER_API_KEY",
        requires_api_key: true,
    },
    ProviderPreset {
        name: "fireworks",
        base_url: "https://api.fireworks.ai/inference/v1",
        protocol: Protocol::OpenAi,
        default_api_key_env: "FIREWORKS_API_KEY",
        requires_api_key: true,
    },
    ProviderPreset {
        name: "groq",
        base_url: "https://api.groq.com/openai/v1",
        protocol: Protocol::OpenAi,
        default_api_key_env: "GROQ_API_KEY",
        requires_api_key: true,
    },
    ProviderPreset {
        name: "deepseek",
        base_url: "https://api.deepseek.com/v1",
        protocol: Protocol::OpenAi,
        default_api_key_env: "DEEPSEEK_API_KEY",
        requires_api_key: true,
    },
    ProviderPreset {
        name: "siliconflow",
        base_url: "https://api.siliconflow.cn/v1",
        protocol: Protocol::OpenAi,
        default_api_key_env: "SILICONFLOW_API_KEY",
        requires_api_key: true,
    },
    ProviderPreset {
        name: "ollama",
        base_url: "http://localhost:11434/v1",
        protocol: Protocol::OpenAi,
        default_api_key_env: "OLLAMA_API_KEY",
        requires_api_key: false,
    },
    ProviderPreset {
        name: "anthropic",
        base_url: "https://api.anthropic.com",
        protocol: Protocol::Anthropic,
        default_api_key_env: "ANTHROPIC_API_KEY",
        requires_api_key: true,
    },
];

impl ProviderPreset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static ProviderPreset> {
        PRESETS.iter().find(|p| p.name == name.to_lowercase())
    }

    #[must_use]
    pub fn all() -> &'static [ProviderPreset] {
        PRESETS
    }
}
