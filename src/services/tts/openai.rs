//! OpenAI `/audio/speech` and the many self-hosted servers that mimic it.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use log::{debug, warn};
use serde::Serialize;
use std::path::Path;
use url::Url;

use super::{
    check_status, content_format, endpoint, read_audio, SynthesisRequest, SynthesizedAudio, TtsConfig,
    TtsProvider,
};
use crate::core::error::ProviderError;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiSpeechProvider {
    provider_id: String,
    url: Url,
    api_key: Option<String>,
    model: String,
    response_format: String,
    client: reqwest::Client,
}

impl OpenAiSpeechProvider {
    pub fn new(config: &TtsConfig, client: reqwest::Client) -> Result<Self> {
        let base_url = match (&config.base_url, config.provider.as_str()) {
            (Some(url), _) => url.clone(),
            (None, "openai") => OPENAI_BASE_URL.to_string(),
            (None, other) => return Err(anyhow!("audio.tts.base_url is required for provider '{}'", other)),
        };
        let api_key = config.resolve_api_key();
        if api_key.is_none() && config.provider == "openai" {
            warn!("No API key configured for OpenAI speech, requests will likely be rejected");
        }
        Ok(Self {
            provider_id: config.provider.clone(),
            url: endpoint(&base_url, "audio/speech")?,
            api_key,
            model: config.model.clone().unwrap_or_else(|| "gpt-4o-mini-tts".to_string()),
            response_format: config.response_format.clone(),
            client,
        })
    }

    fn body(&self, request: &SynthesisRequest, reference_audio: Option<String>) -> serde_json::Value {
        let speech = SpeechRequest {
            model: &self.model,
            input: &request.text,
            voice: &request.voice_id,
            speed: request.speed,
            response_format: &self.response_format,
            instructions: Some(request.emotion.as_str()).filter(|e| !e.is_empty()),
            dialect: request.dialect.as_deref(),
            reference_audio,
        };
        let mut body = serde_json::to_value(&speech).unwrap_or_default();
        if let Some(obj) = body.as_object_mut() {
            for (k, v) in &request.params {
                obj.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        body
    }
}

/// Reference recording as base64, the form self-hosted cloning servers accept.
async fn encode_reference(path: &Path) -> Result<String, ProviderError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        ProviderError::InvalidInput(format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(general_purpose::STANDARD.encode(bytes))
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dialect: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_audio: Option<String>,
}

#[async_trait]
impl TtsProvider for OpenAiSpeechProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesizedAudio, ProviderError> {
        debug!(
            "{}: synthesizing {} chars with voice {}",
            self.provider_id,
            request.text.len(),
            request.voice_id
        );
        let reference_audio = match &request.reference_audio {
            Some(path) => Some(encode_reference(path).await?),
            None => None,
        };
        let mut builder = self
            .client
            .post(self.url.clone())
            .json(&self.body(request, reference_audio));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = check_status(builder.send().await?).await?;
        let format = content_format(resp.headers(), &self.response_format);
        let data = read_audio(resp).await?;
        Ok(SynthesizedAudio {
            data,
            format,
            duration: None,
        })
    }
}
