//! What each TTS backend can do.
//!
//! The registry is built once at startup (built-in table, optionally replaced
//! or extended from a YAML file) and is read-only afterwards, so it can be
//! shared across synthesis tasks without locking.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use crate::services::markup::{normalize_dialect, TagSyntax};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderCapability {
    pub provider_id: String,
    #[serde(default)]
    pub supported_languages: HashSet<String>,
    #[serde(default)]
    pub supported_dialects: HashSet<String>,
    #[serde(default)]
    pub supports_voice_tags: bool,
    #[serde(default)]
    pub allowed_voice_tags: HashSet<String>,
    #[serde(default)]
    pub tag_syntax: TagSyntax,
    #[serde(default)]
    pub supports_cloning: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    1
}

impl ProviderCapability {
    pub fn supports_language(&self, language: &str) -> bool {
        let lang = language.trim().to_lowercase();
        let primary = lang.split(['-', '_']).next().unwrap_or(&lang);
        self.supported_languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(&lang) || l.eq_ignore_ascii_case(primary))
    }

    /// "Can this provider speak dialect D?"
    pub fn supports_dialect(&self, dialect: &str) -> bool {
        let d = normalize_dialect(dialect);
        self.supported_dialects.iter().any(|s| normalize_dialect(s) == d)
    }

    /// "May tag T be embedded in text sent to this provider?"
    pub fn allows_tag(&self, tag: &str) -> bool {
        self.supports_voice_tags && self.allowed_voice_tags.contains(&tag.trim().to_lowercase())
    }

    /// The tag vocabulary usable with this provider, empty when tags are unsupported.
    pub fn usable_tags(&self) -> HashSet<String> {
        if self.supports_voice_tags {
            self.allowed_voice_tags
                .iter()
                .map(|t| t.to_lowercase())
                .collect()
        } else {
            HashSet::new()
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("no capability entry for TTS provider '{0}'")]
pub struct UnknownProvider(pub String);

#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    providers: HashMap<String, ProviderCapability>,
}

#[derive(Deserialize)]
struct CapabilityFile {
    #[serde(default)]
    replace_builtin: bool,
    providers: Vec<ProviderCapability>,
}

impl CapabilityRegistry {
    pub fn from_entries(entries: impl IntoIterator<Item = ProviderCapability>) -> Self {
        let providers = entries
            .into_iter()
            .map(|c| (c.provider_id.to_lowercase(), c))
            .collect();
        Self { providers }
    }

    pub fn builtin() -> Self {
        Self::from_entries(builtin_capabilities())
    }

    /// Built-in table merged with (or replaced by) the entries of a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read capabilities file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse capabilities file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: CapabilityFile = serde_yaml_ng::from_str(content)?;
        let mut registry = if file.replace_builtin {
            Self::default()
        } else {
            Self::builtin()
        };
        for cap in file.providers {
            registry.providers.insert(cap.provider_id.to_lowercase(), cap);
        }
        Ok(registry)
    }

    pub fn capabilities_for(&self, provider_id: &str) -> Result<&ProviderCapability, UnknownProvider> {
        self.providers
            .get(&provider_id.to_lowercase())
            .ok_or_else(|| UnknownProvider(provider_id.to_string()))
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(|k| k.as_str()).collect();
        ids.sort();
        ids
    }
}

static GLOBAL: OnceLock<Arc<CapabilityRegistry>> = OnceLock::new();

/// Installs the process-wide registry. Only the first call wins; later
/// calls get the registry that is already installed.
pub fn install(registry: CapabilityRegistry) -> Arc<CapabilityRegistry> {
    GLOBAL.get_or_init(|| Arc::new(registry)).clone()
}

fn set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn builtin_capabilities() -> Vec<ProviderCapability> {
    vec![
        ProviderCapability {
            provider_id: "openai".to_string(),
            supported_languages: set(&["en", "zh"]),
            supported_dialects: set(&["mandarin"]),
            supports_voice_tags: false,
            allowed_voice_tags: HashSet::new(),
            tag_syntax: TagSyntax::Bracket,
            supports_cloning: false,
            max_concurrency: 5,
        },
        ProviderCapability {
            provider_id: "elevenlabs".to_string(),
            supported_languages: set(&[
                "en", "zh", "ja", "ko", "es", "fr", "de", "it", "pt", "pl", "tr", "ru", "nl",
                "cs", "ar", "hu", "sv",
            ]),
            supported_dialects: set(&["mandarin"]),
            supports_voice_tags: true,
            allowed_voice_tags: set(&["laughter", "sigh", "breath", "pause"]),
            tag_syntax: TagSyntax::Bracket,
            supports_cloning: true,
            max_concurrency: 3,
        },
        ProviderCapability {
            provider_id: "kokoro".to_string(),
            supported_languages: set(&["en", "zh"]),
            supported_dialects: set(&["mandarin"]),
            supports_voice_tags: false,
            allowed_voice_tags: HashSet::new(),
            tag_syntax: TagSyntax::Bracket,
            supports_cloning: false,
            max_concurrency: 2,
        },
        ProviderCapability {
            provider_id: "qwen".to_string(),
            supported_languages: set(&["en", "zh"]),
            supported_dialects: set(&["mandarin"]),
            supports_voice_tags: false,
            allowed_voice_tags: HashSet::new(),
            tag_syntax: TagSyntax::Bracket,
            supports_cloning: false,
            max_concurrency: 3,
        },
        ProviderCapability {
            provider_id: "soulx".to_string(),
            supported_languages: set(&["zh", "en"]),
            supported_dialects: set(&["mandarin", "sichuan", "henan", "yue"]),
            supports_voice_tags: true,
            allowed_voice_tags: set(&["laughter", "sigh", "breathing", "coughing", "throat_clearing"]),
            tag_syntax: TagSyntax::AngleBar,
            supports_cloning: true,
            max_concurrency: 1,
        },
        ProviderCapability {
            provider_id: "index-tts".to_string(),
            supported_languages: set(&["zh", "en"]),
            supported_dialects: set(&["mandarin"]),
            supports_voice_tags: false,
            allowed_voice_tags: HashSet::new(),
            tag_syntax: TagSyntax::Bracket,
            supports_cloning: true,
            max_concurrency: 1,
        },
    ]
}
