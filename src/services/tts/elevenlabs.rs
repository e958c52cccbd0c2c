use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use url::Url;

use super::{
    check_status, content_format, endpoint, read_audio, SynthesisRequest, SynthesizedAudio, TtsConfig,
    TtsProvider,
};
use crate::core::error::ProviderError;

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io/v1";

pub struct ElevenLabsProvider {
    base_url: String,
    api_key: Option<String>,
    model: String,
    output_format: String,
    client: reqwest::Client,
    /// Reference audio path -> cloned voice id.
    cloned: Mutex<HashMap<PathBuf, String>>,
}

#[derive(Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: serde_json::Value,
}

#[derive(Deserialize)]
struct AddVoiceResponse {
    voice_id: String,
}

impl ElevenLabsProvider {
    pub fn new(config: &TtsConfig, client: reqwest::Client) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| ELEVENLABS_BASE_URL.to_string());
        // Validate early so a bad URL fails at startup.
        endpoint(&base_url, "text-to-speech")?;
        let api_key = config.resolve_api_key();
        if api_key.is_none() {
            warn!("No ElevenLabs API key configured (audio.tts.api_key or ELEVENLABS_API_KEY)");
        }
        Ok(Self {
            base_url,
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "eleven_multilingual_v2".to_string()),
            output_format: output_format(&config.response_format),
            client,
            cloned: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ProviderError> {
        endpoint(&self.base_url, path).map_err(|e| ProviderError::InvalidInput(format!("{:#}", e)))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("xi-api-key", key),
            None => builder,
        }
    }

    /// Voice id for a reference recording, cloning it on first use.
    async fn cloned_voice(&self, reference: &Path) -> Result<String, ProviderError> {
        let mut cloned = self.cloned.lock().await;
        if let Some(id) = cloned.get(reference) {
            return Ok(id.clone());
        }

        let bytes = tokio::fs::read(reference).await.map_err(|e| {
            ProviderError::InvalidInput(format!("cannot read {}: {}", reference.display(), e))
        })?;
        let file_name = reference
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "reference.wav".to_string());
        let name = reference
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "cloned voice".to_string());

        info!("Cloning ElevenLabs voice from {}", reference.display());
        let form = multipart::Form::new()
            .text("name", name)
            .part("files", multipart::Part::bytes(bytes).file_name(file_name));
        let resp = self
            .authorized(self.client.post(self.url("voices/add")?))
            .multipart(form)
            .send()
            .await?;
        let added: AddVoiceResponse = check_status(resp).await?.json().await?;
        cloned.insert(reference.to_path_buf(), added.voice_id.clone());
        Ok(added.voice_id)
    }
}

fn output_format(requested: &str) -> String {
    match requested {
        "wav" => "wav_44100".to_string(),
        "mp3" => "mp3_44100_128".to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl TtsProvider for ElevenLabsProvider {
    fn provider_id(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesizedAudio, ProviderError> {
        let voice_id = match &request.reference_audio {
            Some(reference) => self.cloned_voice(reference).await?,
            None => request.voice_id.clone(),
        };
        debug!("elevenlabs: {} chars with voice {}", request.text.len(), voice_id);

        let mut settings = serde_json::Map::new();
        settings.insert("speed".into(), serde_json::json!(request.speed));
        for (k, v) in &request.params {
            settings.insert(k.clone(), v.clone());
        }
        let body = ElevenLabsRequest {
            text: &request.text,
            model_id: &self.model,
            voice_settings: serde_json::Value::Object(settings),
        };

        let mut url = self.url(&format!("text-to-speech/{}", voice_id))?;
        url.query_pairs_mut()
            .append_pair("output_format", &self.output_format);

        let resp = self
            .authorized(self.client.post(url))
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let format = content_format(resp.headers(), &self.output_format);
        let data = read_audio(resp).await?;
        Ok(SynthesizedAudio {
            data,
            format,
            duration: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_mapping() {
        assert_eq!(output_format("wav"), "wav_44100");
        assert_eq!(output_format("mp3"), "mp3_44100_128");
        assert_eq!(output_format("pcm_16000"), "pcm_16000");
    }

    #[test]
    fn test_urls() {
        let config = TtsConfig {
            provider: "elevenlabs".into(),
            api_key: Some("k".into()),
            ..Default::default()
        };
        let provider = ElevenLabsProvider::new(&config, reqwest::Client::new()).unwrap();
        assert_eq!(
            provider.url("text-to-speech/abc").unwrap().as_str(),
            "https://api.elevenlabs.io/v1/text-to-speech/abc"
        );
        assert_eq!(provider.model, "eleven_multilingual_v2");
    }

    #[tokio::test]
    async fn test_missing_reference_audio_is_invalid_input() {
        let config = TtsConfig {
            provider: "elevenlabs".into(),
            api_key: Some("k".into()),
            ..Default::default()
        };
        let provider = ElevenLabsProvider::new(&config, reqwest::Client::new()).unwrap();
        let err = provider
            .cloned_voice(Path::new("/definitely/not/here.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidInput(_)));
    }
}
