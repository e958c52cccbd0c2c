use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::SpeakerProfile;
use crate::services::llm::LlmConfig;
use crate::services::retry::RetryPolicy;
use crate::services::tts::TtsConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    pub llm: LlmConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    pub episode: EpisodeProfile,

    pub speakers: SpeakerProfile,

    /// YAML table overriding the built-in provider capabilities.
    #[serde(default)]
    pub capabilities_file: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Silence inserted between turns when the clips are WAV.
    #[serde(default)]
    pub silence_ms: u32,

    #[serde(default)]
    pub show_progress: bool,

    #[serde(default)]
    pub tts: TtsConfig,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
            silence_ms: 0,
            show_progress: false,
            tts: TtsConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EpisodeProfile {
    pub name: String,
    #[serde(default)]
    pub briefing: String,
    /// Plain-text source material.
    pub content_file: String,
    #[serde(default = "default_num_segments")]
    pub num_segments: usize,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub dialect: Option<String>,
    #[serde(default = "default_min_turns")]
    pub min_turns_per_segment: usize,
    /// Content above this many characters is condensed before outlining. 0 disables.
    #[serde(default = "default_digest_threshold")]
    pub digest_threshold_chars: usize,
}

pub const MAX_SEGMENTS: usize = 12;

fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    5
}
fn default_num_segments() -> usize {
    3
}
fn default_language() -> String {
    "en".to_string()
}
fn default_min_turns() -> usize {
    1
}
fn default_digest_threshold() -> usize {
    5000
}

impl EpisodeProfile {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Config("episode name cannot be empty".into()));
        }
        if self.num_segments == 0 || self.num_segments > MAX_SEGMENTS {
            return Err(PipelineError::Config(format!(
                "num_segments must be between 1 and {}, got {}",
                MAX_SEGMENTS, self.num_segments
            )));
        }
        if self.language.trim().is_empty() {
            return Err(PipelineError::Config("language cannot be empty".into()));
        }
        Ok(())
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Structural validation of everything the pipeline consumes.
    pub fn validate(&self) -> PipelineResult<()> {
        self.episode.validate()?;
        self.speakers.validate()?;
        if self.audio.max_concurrency == 0 {
            return Err(PipelineError::Config("audio.max_concurrency must be at least 1".into()));
        }
        if self.audio.retry.max_attempts == 0 {
            return Err(PipelineError::Config("audio.retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
llm:
  provider: openai
  openai:
    api_key: sk-test
    model: gpt-4o-mini
audio:
  max_concurrency: 3
  tts:
    provider: elevenlabs
episode:
  name: weekly
  briefing: Two hosts discuss the article
  content_file: article.txt
  num_segments: 4
  dialect: sichuanese
speakers:
  speakers:
    - name: Alice
      voice_id: nova
    - name: Bob
      voice_id: onyx
"#;

    #[test]
    fn test_parse_and_validate() -> Result<()> {
        let config: Config = serde_yaml_ng::from_str(SAMPLE)?;
        assert_eq!(config.output_folder, "output");
        assert!(config.audio.enabled);
        assert_eq!(config.audio.max_concurrency, 3);
        assert_eq!(config.audio.tts.provider, "elevenlabs");
        assert_eq!(config.episode.num_segments, 4);
        assert_eq!(config.episode.language, "en");
        assert_eq!(config.episode.dialect.as_deref(), Some("sichuanese"));
        assert_eq!(config.llm.retry_count, 2);
        config.validate()?;
        Ok(())
    }

    #[test]
    fn test_rejects_segment_count_out_of_range() -> Result<()> {
        let mut config: Config = serde_yaml_ng::from_str(SAMPLE)?;
        config.episode.num_segments = 0;
        assert!(config.validate().is_err());
        config.episode.num_segments = MAX_SEGMENTS + 1;
        assert!(config.validate().is_err());
        Ok(())
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load_from(&dir.path().join("config.yml"));
        assert!(result.is_err());
    }
}
