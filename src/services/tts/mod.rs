use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::info;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::core::error::ProviderError;
use crate::core::state::AudioFormat;

pub mod elevenlabs;
pub mod openai;

/// One synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: String,
    pub emotion: String,
    pub speed: f32,
    /// Normalized dialect name, only set when the provider speaks it.
    pub dialect: Option<String>,
    /// Reference audio for cloning, only set when the provider supports it.
    pub reference_audio: Option<PathBuf>,
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub data: Vec<u8>,
    pub format: AudioFormat,
    pub duration: Option<Duration>,
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Key into the capability registry.
    fn provider_id(&self) -> &str;

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesizedAudio, ProviderError>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TtsConfig {
    /// "openai", "elevenlabs", or an OpenAI compatible deployment
    /// ("kokoro", "qwen", "soulx", "index-tts", ...).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Requested container, e.g. "wav" or "mp3".
    #[serde(default = "default_response_format")]
    pub response_format: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_response_format() -> String {
    "wav".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            api_key: None,
            model: None,
            response_format: default_response_format(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl TtsConfig {
    /// Configured key, falling back to `<PROVIDER>_API_KEY` in the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().filter(|k| !k.is_empty()).or_else(|| {
            let var = format!(
                "{}_API_KEY",
                self.provider.to_uppercase().replace('-', "_")
            );
            std::env::var(var).ok().filter(|k| !k.is_empty())
        })
    }
}

pub fn create_tts_provider(config: &TtsConfig) -> Result<Arc<dyn TtsProvider>> {
    info!("Initializing TTS provider: {}", config.provider);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    match config.provider.as_str() {
        "elevenlabs" => Ok(Arc::new(elevenlabs::ElevenLabsProvider::new(config, http)?)),
        "openai" | "kokoro" | "qwen" | "soulx" | "index-tts" => {
            Ok(Arc::new(openai::OpenAiSpeechProvider::new(config, http)?))
        }
        other => {
            if config.base_url.is_some() {
                info!("Treating '{}' as an OpenAI compatible speech endpoint", other);
                Ok(Arc::new(openai::OpenAiSpeechProvider::new(config, http)?))
            } else {
                Err(anyhow!("Unknown TTS provider: {}", other))
            }
        }
    }
}

/// Joins `path` onto `base`, keeping any path prefix `base` already has.
pub(crate) fn endpoint(base: &str, path: &str) -> Result<Url> {
    let mut base = base.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    let base = Url::parse(&base).with_context(|| format!("Invalid base URL: {}", base))?;
    base.join(path.trim_start_matches('/'))
        .with_context(|| format!("Invalid endpoint path: {}", path))
}

/// `Retry-After` in its delta-seconds form.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

pub(crate) fn content_format(headers: &HeaderMap, requested: &str) -> AudioFormat {
    let from_header = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(AudioFormat::from_content_type)
        .unwrap_or(AudioFormat::Other);
    if from_header != AudioFormat::Other {
        return from_header;
    }
    match requested.to_lowercase().as_str() {
        r if r.starts_with("wav") || r.starts_with("pcm_wav") => AudioFormat::Wav,
        r if r.starts_with("mp3") => AudioFormat::Mp3,
        _ => AudioFormat::Other,
    }
}

/// Passes successful responses through, classifies everything else.
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = parse_retry_after(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    let body: String = body.chars().take(500).collect();
    Err(ProviderError::from_status(status.as_u16(), &body, retry_after))
}

/// Reads the whole audio body. A stream cut short counts as `Unavailable`.
pub(crate) async fn read_audio(resp: reqwest::Response) -> Result<Vec<u8>, ProviderError> {
    let data = resp
        .bytes()
        .await
        .map_err(|e| ProviderError::Unavailable(format!("audio body interrupted: {}", e)))?;
    if data.is_empty() {
        return Err(ProviderError::Unknown("empty audio response".into()));
    }
    Ok(data.to_vec())
}
