//! Sequences the stages of an episode.
//!
//! `ContentReady -> OutlineBuilt -> TranscriptBuilt -> AudioSynthesized -> Assembled -> Done`,
//! with `TranscriptBuilt -> Done` when audio is disabled. Each stage reads the
//! current state and returns a patch; the engine applies the patch and moves
//! the cursor in one step, so a failed stage leaves the state untouched.

use log::{error, info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::config::Config;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::io::Storage;
use crate::core::state::{Artifact, DialogueTurn, Outline, PipelineState, Stage, StatePatch};
use crate::services::assembler::AudioAssembler;
use crate::services::capability::{CapabilityRegistry, ProviderCapability};
use crate::services::digest::{digest_content, needs_digest};
use crate::services::dispatcher::AudioSynthesisDispatcher;
use crate::services::llm::LlmClient;
use crate::services::outline::OutlineStage;
use crate::services::structured::StructuredClient;
use crate::services::transcript::{turns_with_foreign_tags, TranscriptStage};
use crate::services::tts::TtsProvider;

/// Terminal failure of a run: the stage the engine was in, and why.
#[derive(Debug, Error)]
#[error("pipeline failed in stage {stage}: {error}")]
pub struct PipelineFailure {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

/// Decides the branch out of `TranscriptBuilt`.
pub fn should_synthesize_audio(state: &PipelineState) -> bool {
    state.audio_enabled && !state.transcript.is_empty()
}

struct Transition {
    patch: Option<StatePatch>,
    next: Stage,
}

impl Transition {
    fn to(next: Stage, patch: StatePatch) -> Self {
        Self {
            patch: Some(patch),
            next,
        }
    }
}

#[derive(Serialize)]
struct TranscriptDocument<'a> {
    episode: &'a str,
    outline: Option<&'a Outline>,
    turns_per_segment: &'a [usize],
    transcript: &'a [DialogueTurn],
}

pub struct PipelineEngine {
    config: Config,
    llm: Box<dyn LlmClient>,
    tts: Option<Arc<dyn TtsProvider>>,
    capabilities: Arc<CapabilityRegistry>,
    storage: Arc<dyn Storage>,
    cancel: CancellationToken,
}

impl PipelineEngine {
    pub fn new(
        config: Config,
        llm: Box<dyn LlmClient>,
        tts: Option<Arc<dyn TtsProvider>>,
        capabilities: Arc<CapabilityRegistry>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            config,
            llm,
            tts,
            capabilities,
            storage,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fresh `ContentReady` state for this episode.
    pub fn initial_state(&self, content: impl Into<String>) -> PipelineState {
        let episode = &self.config.episode;
        let mut state = PipelineState::new(
            episode.briefing.clone(),
            content,
            self.config.speakers.clone(),
        );
        state.language = episode.language.clone();
        state.dialect = episode.dialect.clone();
        state.num_segments = episode.num_segments;
        state.audio_enabled = self.config.audio.enabled;
        state
    }

    /// Reads the episode's content file through storage and runs it.
    pub async fn run_episode(&self) -> Result<PipelineState, PipelineFailure> {
        let path = &self.config.episode.content_file;
        let present = self.storage.exists(path).await.map_err(|e| PipelineFailure {
            stage: Stage::ContentReady,
            error: PipelineError::Storage(e),
        })?;
        if !present {
            return Err(PipelineFailure {
                stage: Stage::ContentReady,
                error: PipelineError::Config(format!("content file {} does not exist", path)),
            });
        }
        let bytes = self.storage.read(path).await.map_err(|e| PipelineFailure {
            stage: Stage::ContentReady,
            error: PipelineError::Storage(e.context(format!("Failed to read {}", path))),
        })?;
        let content = String::from_utf8_lossy(&bytes).to_string();
        self.run(self.initial_state(content)).await
    }

    /// Drives `state` to `Done`, or stops at the first failing stage.
    pub async fn run(&self, mut state: PipelineState) -> Result<PipelineState, PipelineFailure> {
        info!(
            "Starting episode '{}' ({} segment(s), audio {})",
            self.config.episode.name,
            state.num_segments,
            if state.audio_enabled { "on" } else { "off" }
        );
        while state.stage != Stage::Done {
            let stage = state.stage;
            let result = if self.cancel.is_cancelled() {
                Err(PipelineError::Cancelled)
            } else {
                self.step(&state).await
            };
            match result {
                Ok(transition) => {
                    if transition.next != stage {
                        info!("Stage {} -> {}", stage, transition.next);
                    }
                    state.apply(transition.patch, transition.next);
                }
                Err(error) => {
                    if error.is_cancelled() {
                        info!("Run cancelled during stage {}", stage);
                    } else {
                        error!("Stage {} failed: {}", stage, error);
                    }
                    return Err(PipelineFailure { stage, error });
                }
            }
        }
        info!("Episode '{}' done", self.config.episode.name);
        Ok(state)
    }

    async fn step(&self, state: &PipelineState) -> PipelineResult<Transition> {
        match state.stage {
            Stage::ContentReady => self.prepare_outline(state).await,
            Stage::OutlineBuilt => self.build_transcript(state).await,
            Stage::TranscriptBuilt => {
                if should_synthesize_audio(state) {
                    self.synthesize(state).await
                } else {
                    self.write_text_artifact(state).await
                }
            }
            Stage::AudioSynthesized => self.assemble(state).await,
            Stage::Assembled => Ok(Transition {
                patch: None,
                next: Stage::Done,
            }),
            Stage::Done => Ok(Transition {
                patch: None,
                next: Stage::Done,
            }),
        }
    }

    fn structured_client(&self) -> StructuredClient<'_> {
        StructuredClient::new(
            self.llm.as_ref(),
            self.config.llm.retry_count,
            Duration::from_millis(self.config.llm.retry_delay_ms),
        )
        .with_cancellation(self.cancel.clone())
    }

    fn capability(&self) -> PipelineResult<&ProviderCapability> {
        self.capabilities
            .capabilities_for(&self.config.audio.tts.provider)
            .map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Digests long content first (staying in `ContentReady`), then outlines.
    async fn prepare_outline(&self, state: &PipelineState) -> PipelineResult<Transition> {
        let client = self.structured_client();
        let threshold = self.config.episode.digest_threshold_chars;

        if !state.content_digested && needs_digest(&state.content, threshold) {
            if let Some(digest) = digest_content(&client, &state.briefing, &state.content, threshold).await? {
                return Ok(Transition::to(Stage::ContentReady, StatePatch::Content(digest)));
            }
        }

        let outline = OutlineStage::new(&client)
            .build_outline(
                &state.briefing,
                &state.content,
                &state.speakers,
                state.num_segments,
                &state.language,
            )
            .await?;
        self.write_json("outline.json", &outline).await?;
        Ok(Transition::to(Stage::OutlineBuilt, StatePatch::Outline(outline)))
    }

    async fn build_transcript(&self, state: &PipelineState) -> PipelineResult<Transition> {
        let outline = state
            .outline
            .as_ref()
            .ok_or_else(|| PipelineError::Validation("no outline to build a transcript from".into()))?;
        let capability = self.capability()?;
        let client = self.structured_client();
        let stage = TranscriptStage::new(
            &client,
            &state.briefing,
            &state.language,
            state.dialect.as_deref(),
            self.config.episode.min_turns_per_segment,
        );
        let built = stage
            .build_transcript(outline, &state.speakers, capability)
            .await?;

        if built.turns_per_segment.len() != outline.segments.len() {
            return Err(PipelineError::Validation(format!(
                "transcript covers {} segment(s), outline has {}",
                built.turns_per_segment.len(),
                outline.segments.len()
            )));
        }
        if let Some(turn) = built
            .turns
            .iter()
            .find(|t| state.speakers.get(&t.speaker).is_none())
        {
            return Err(PipelineError::Validation(format!(
                "transcript references unknown speaker '{}'",
                turn.speaker
            )));
        }
        let foreign = turns_with_foreign_tags(&built.turns, capability);
        if !foreign.is_empty() && state.audio_enabled {
            warn!(
                "{} turn(s) carry voice tags '{}' cannot render; they will be dropped",
                foreign.len(),
                capability.provider_id
            );
        }

        self.write_json(
            "transcript.json",
            &TranscriptDocument {
                episode: &self.config.episode.name,
                outline: Some(outline),
                turns_per_segment: &built.turns_per_segment,
                transcript: &built.turns,
            },
        )
        .await?;
        info!("Transcript ready: {} turn(s)", built.turns.len());
        Ok(Transition::to(
            Stage::TranscriptBuilt,
            StatePatch::Transcript {
                turns: built.turns,
                turns_per_segment: built.turns_per_segment,
            },
        ))
    }

    async fn synthesize(&self, state: &PipelineState) -> PipelineResult<Transition> {
        let provider = self
            .tts
            .clone()
            .ok_or_else(|| PipelineError::Config("audio is enabled but no TTS provider is configured".into()))?;
        let capability = self.capability()?.clone();
        let audio = &self.config.audio;
        let dispatcher = AudioSynthesisDispatcher::new(
            provider,
            capability,
            state.dialect.as_deref(),
            audio.max_concurrency,
            audio.retry.clone(),
        )
        .with_progress(audio.show_progress);

        let segments = dispatcher
            .synthesize_all(&state.transcript, &state.speakers, &self.cancel)
            .await?;
        Ok(Transition::to(Stage::AudioSynthesized, StatePatch::Audio(segments)))
    }

    async fn assemble(&self, state: &PipelineState) -> PipelineResult<Transition> {
        let assembler = AudioAssembler::new(
            self.storage.clone(),
            &self.config.output_folder,
            self.config.audio.silence_ms,
        );
        let episode = assembler
            .assemble(&self.config.episode.name, &state.audio, &state.transcript)
            .await?;
        Ok(Transition::to(
            Stage::Assembled,
            StatePatch::Artifact(Artifact::Audio(episode)),
        ))
    }

    async fn write_text_artifact(&self, state: &PipelineState) -> PipelineResult<Transition> {
        let path = Path::new(&self.config.output_folder)
            .join(format!("{}.transcript.json", self.config.episode.name))
            .to_string_lossy()
            .to_string();
        let document = TranscriptDocument {
            episode: &self.config.episode.name,
            outline: state.outline.as_ref(),
            turns_per_segment: &state.turns_per_segment,
            transcript: &state.transcript,
        };
        let json = serde_json::to_string_pretty(&document).map_err(|e| PipelineError::Storage(e.into()))?;
        self.storage
            .write(&path, json.as_bytes())
            .await
            .map_err(PipelineError::Storage)?;
        info!("Audio disabled, transcript written to {}", path);
        Ok(Transition::to(
            Stage::Done,
            StatePatch::Artifact(Artifact::TextOnly {
                transcript_path: path,
            }),
        ))
    }

    async fn write_json<T: Serialize>(&self, file_name: &str, value: &T) -> PipelineResult<()> {
        let path = Path::new(&self.config.build_folder)
            .join(&self.config.episode.name)
            .join(file_name)
            .to_string_lossy()
            .to_string();
        let json = serde_json::to_string_pretty(value).map_err(|e| PipelineError::Storage(e.into()))?;
        self.storage
            .write(&path, json.as_bytes())
            .await
            .map_err(PipelineError::Storage)
    }
}
