use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::error::{PipelineError, PipelineResult};

// --- Outline ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SegmentSize {
    Short,
    Medium,
    Long,
}

impl SegmentSize {
    pub const ALL: [&'static str; 3] = ["short", "medium", "long"];

    /// Number of turns the transcript prompt asks for. Advisory only.
    pub fn suggested_turns(self) -> usize {
        match self {
            SegmentSize::Short => 2,
            SegmentSize::Medium => 5,
            SegmentSize::Long => 8,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SegmentRole {
    Intro,
    Body,
    Outro,
}

impl SegmentRole {
    pub fn for_position(index: usize, count: usize) -> Self {
        if index == 0 {
            SegmentRole::Intro
        } else if index + 1 == count {
            SegmentRole::Outro
        } else {
            SegmentRole::Body
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Segment {
    pub name: String,
    pub description: String,
    pub size: SegmentSize,
    pub role: SegmentRole,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Outline {
    pub segments: Vec<Segment>,
}

// --- Transcript ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DialogueTurn {
    pub speaker: String,
    pub text: String,
    /// Free-text delivery hint, passed through to synthesis untouched.
    #[serde(default)]
    pub emotion: String,
    #[serde(default = "default_speed")]
    pub speed: f32,
}

fn default_speed() -> f32 {
    1.0
}

pub const MIN_SPEED: f32 = 0.5;
pub const MAX_SPEED: f32 = 2.0;

/// Speed as the model writes it: a number or a named speed.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeedValue {
    Number(f32),
    Named(String),
}

impl SpeedValue {
    pub fn resolve(&self) -> f32 {
        let value = match self {
            SpeedValue::Number(n) => *n,
            SpeedValue::Named(name) => match name.trim().to_lowercase().as_str() {
                "slow" => 0.9,
                "fast" => 1.1,
                "normal" => 1.0,
                other => {
                    log::warn!("Unknown speed '{}', using normal", other);
                    1.0
                }
            },
        };
        if value.is_finite() {
            value.clamp(MIN_SPEED, MAX_SPEED)
        } else {
            1.0
        }
    }
}

impl<'de> Deserialize<'de> for SpeedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f32),
            Named(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => SpeedValue::Number(n),
            Raw::Named(s) => match s.trim().parse::<f32>() {
                Ok(n) => SpeedValue::Number(n),
                Err(_) => SpeedValue::Named(s),
            },
        })
    }
}

// --- Speakers ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Speaker {
    pub name: String,
    pub voice_id: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub personality: String,
    /// Reference audio for voice cloning.
    #[serde(default)]
    pub custom_voice: Option<PathBuf>,
    /// Extra provider-specific synthesis parameters.
    #[serde(default)]
    pub voice_params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SpeakerProfile {
    pub speakers: Vec<Speaker>,
}

pub const MAX_SPEAKERS: usize = 4;

impl SpeakerProfile {
    pub fn names(&self) -> Vec<String> {
        self.speakers.iter().map(|s| s.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Speaker> {
        self.speakers.iter().find(|s| s.name == name)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.speakers.is_empty() || self.speakers.len() > MAX_SPEAKERS {
            return Err(PipelineError::Config(format!(
                "must have between 1 and {} speakers, got {}",
                MAX_SPEAKERS,
                self.speakers.len()
            )));
        }

        let mut names = HashSet::new();
        let mut voices = HashSet::new();
        for speaker in &self.speakers {
            let name = speaker.name.trim();
            if name.is_empty() {
                return Err(PipelineError::Config("speaker name cannot be empty".into()));
            }
            if name != speaker.name {
                return Err(PipelineError::Config(format!(
                    "speaker name '{}' has surrounding whitespace",
                    speaker.name
                )));
            }
            if !names.insert(name.to_string()) {
                return Err(PipelineError::Config(format!(
                    "duplicate speaker name '{}'",
                    name
                )));
            }
            let voice_key = match &speaker.custom_voice {
                Some(path) => format!("custom:{}", path.display()),
                None => speaker.voice_id.clone(),
            };
            if !voices.insert(voice_key) {
                return Err(PipelineError::Config(format!(
                    "voice of speaker '{}' is already used by another speaker",
                    name
                )));
            }
        }
        Ok(())
    }
}

// --- Audio ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Other,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Other => "bin",
        }
    }

    pub fn from_content_type(content_type: &str) -> Self {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("wav") {
            AudioFormat::Wav
        } else if ct.contains("mpeg") || ct.contains("mp3") {
            AudioFormat::Mp3
        } else {
            AudioFormat::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub turn_index: usize,
    pub data: Vec<u8>,
    pub format: AudioFormat,
    pub duration: Option<Duration>,
    pub provider_used: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SegmentBoundary {
    pub turn_index: usize,
    pub speaker: String,
    pub byte_start: u64,
    pub byte_end: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EpisodeAudio {
    pub path: String,
    pub manifest_path: String,
    pub format: AudioFormat,
    pub boundaries: Vec<SegmentBoundary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
}

// --- Pipeline state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    ContentReady,
    OutlineBuilt,
    TranscriptBuilt,
    AudioSynthesized,
    Assembled,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::ContentReady => "content_ready",
            Stage::OutlineBuilt => "outline_built",
            Stage::TranscriptBuilt => "transcript_built",
            Stage::AudioSynthesized => "audio_synthesized",
            Stage::Assembled => "assembled",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Final product of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    TextOnly { transcript_path: String },
    Audio(EpisodeAudio),
}

#[derive(Debug, Clone)]
pub struct PipelineState {
    pub briefing: String,
    pub content: String,
    /// Set once the content has been condensed, so it is never condensed twice.
    pub content_digested: bool,
    pub language: String,
    pub dialect: Option<String>,
    pub num_segments: usize,
    pub speakers: SpeakerProfile,
    pub audio_enabled: bool,
    pub outline: Option<Outline>,
    pub transcript: Vec<DialogueTurn>,
    /// Number of turns produced by each outline segment, in outline order.
    pub turns_per_segment: Vec<usize>,
    pub audio: Vec<AudioSegment>,
    pub artifact: Option<Artifact>,
    pub stage: Stage,
}

impl PipelineState {
    pub fn new(
        briefing: impl Into<String>,
        content: impl Into<String>,
        speakers: SpeakerProfile,
    ) -> Self {
        Self {
            briefing: briefing.into(),
            content: content.into(),
            content_digested: false,
            language: "en".to_string(),
            dialect: None,
            num_segments: 3,
            speakers,
            audio_enabled: true,
            outline: None,
            transcript: Vec::new(),
            turns_per_segment: Vec::new(),
            audio: Vec::new(),
            artifact: None,
            stage: Stage::ContentReady,
        }
    }
}

/// Output of one stage. The engine applies it in one step.
#[derive(Debug, Clone)]
pub enum StatePatch {
    Content(String),
    Outline(Outline),
    Transcript {
        turns: Vec<DialogueTurn>,
        turns_per_segment: Vec<usize>,
    },
    Audio(Vec<AudioSegment>),
    Artifact(Artifact),
}

impl PipelineState {
    pub(crate) fn apply(&mut self, patch: Option<StatePatch>, next: Stage) {
        if let Some(patch) = patch {
            self.apply_patch(patch);
        }
        self.stage = next;
    }

    fn apply_patch(&mut self, patch: StatePatch) {
        match patch {
            StatePatch::Content(content) => {
                self.content = content;
                self.content_digested = true;
            }
            StatePatch::Outline(outline) => self.outline = Some(outline),
            StatePatch::Transcript {
                turns,
                turns_per_segment,
            } => {
                self.transcript = turns;
                self.turns_per_segment = turns_per_segment;
            }
            StatePatch::Audio(audio) => self.audio = audio,
            StatePatch::Artifact(artifact) => self.artifact = Some(artifact),
        }
    }
}
