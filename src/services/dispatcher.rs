//! Fans dialogue turns out to the TTS provider and back in, in turn order.
//!
//! All capability negotiation (dialect markers, voice tags, cloning) happens
//! here, so providers only ever see text they can render.

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::error::{PipelineError, PipelineResult, ProviderError, TurnFailure};
use crate::core::state::{AudioFormat, AudioSegment, DialogueTurn, SpeakerProfile};
use crate::services::capability::ProviderCapability;
use crate::services::markup::{apply_dialect_marker, dialect_marker, filter_voice_tags, normalize_dialect, remove_dialect_markers};
use crate::services::retry::RetryPolicy;
use crate::services::tts::{SynthesisRequest, TtsProvider};
use crate::utils::audio::wav_duration;

pub struct AudioSynthesisDispatcher {
    provider: Arc<dyn TtsProvider>,
    capability: ProviderCapability,
    dialect: Option<String>,
    global_concurrency: usize,
    retry: RetryPolicy,
    show_progress: bool,
}

enum TurnError {
    Cancelled,
    Failed(TurnFailure),
}

impl AudioSynthesisDispatcher {
    pub fn new(
        provider: Arc<dyn TtsProvider>,
        capability: ProviderCapability,
        dialect: Option<&str>,
        global_concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            capability,
            dialect: dialect.map(|d| d.to_string()),
            global_concurrency,
            retry,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.global_concurrency
            .min(self.capability.max_concurrency)
            .max(1)
    }

    /// Dialect marker to prefix, only when the provider speaks the configured dialect.
    fn active_marker(&self) -> Option<&'static str> {
        let dialect = self.dialect.as_deref()?;
        let normalized = normalize_dialect(dialect);
        if !self.capability.supports_dialect(&normalized) {
            return None;
        }
        dialect_marker(&normalized)
    }

    /// Provider request for one turn, with every unsupported feature downgraded.
    pub fn build_request(
        &self,
        turn: &DialogueTurn,
        speakers: &SpeakerProfile,
    ) -> Result<SynthesisRequest, ProviderError> {
        let speaker = speakers.get(&turn.speaker).ok_or_else(|| {
            ProviderError::InvalidInput(format!("unknown speaker '{}'", turn.speaker))
        })?;

        let tags = self.capability.usable_tags();
        let mut text = filter_voice_tags(
            &remove_dialect_markers(&turn.text),
            &tags,
            self.capability.tag_syntax,
        );
        let marker = self.active_marker();
        if let Some(marker) = marker {
            text = apply_dialect_marker(&text, marker);
        }

        let reference_audio = match &speaker.custom_voice {
            Some(path) if self.capability.supports_cloning => Some(path.clone()),
            Some(path) => {
                warn!(
                    "Provider '{}' cannot clone voices, ignoring {} for {}",
                    self.capability.provider_id,
                    path.display(),
                    speaker.name
                );
                None
            }
            None => None,
        };

        Ok(SynthesisRequest {
            text,
            voice_id: speaker.voice_id.clone(),
            emotion: turn.emotion.clone(),
            speed: turn.speed,
            dialect: marker.and(self.dialect.as_deref().map(normalize_dialect)),
            reference_audio,
            params: speaker.voice_params.clone(),
        })
    }

    /// One `AudioSegment` per turn, in turn order.
    ///
    /// Every turn is resolved before failures are reported. Cancellation stops
    /// in-flight calls and pending retries.
    pub async fn synthesize_all(
        &self,
        turns: &[DialogueTurn],
        speakers: &SpeakerProfile,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<AudioSegment>> {
        let concurrency = self.concurrency();
        info!(
            "Synthesizing {} turn(s) with '{}', concurrency {}",
            turns.len(),
            self.provider.provider_id(),
            concurrency
        );

        let pb = if self.show_progress {
            let pb = ProgressBar::new(turns.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let results: Vec<(usize, Result<AudioSegment, TurnError>)> =
            futures_util::stream::iter(turns.iter().enumerate())
                .map(|(i, turn)| {
                    let pb = pb.clone();
                    async move {
                        let result = match self.build_request(turn, speakers) {
                            Ok(request) => self.synthesize_turn(i, &request, cancel).await,
                            Err(error) => Err(TurnError::Failed(TurnFailure {
                                turn_index: i,
                                attempts: 0,
                                error,
                            })),
                        };
                        pb.inc(1);
                        (i, result)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut slots: Vec<Option<AudioSegment>> = vec![None; turns.len()];
        let mut failures = Vec::new();
        let mut cancelled = false;
        for (i, result) in results {
            match result {
                Ok(segment) => slots[i] = Some(segment),
                Err(TurnError::Cancelled) => cancelled = true,
                Err(TurnError::Failed(failure)) => failures.push(failure),
            }
        }

        if cancelled || cancel.is_cancelled() {
            pb.abandon_with_message("Cancelled");
            info!("Synthesis cancelled");
            return Err(PipelineError::Cancelled);
        }
        if !failures.is_empty() {
            pb.abandon_with_message("Synthesis failed");
            failures.sort_by_key(|f| f.turn_index);
            return Err(PipelineError::SynthesisFailed { failures });
        }
        pb.finish_with_message("Synthesis complete");

        let segments: Vec<AudioSegment> = slots.into_iter().flatten().collect();
        if segments.len() != turns.len() {
            let missing = (0..turns.len())
                .filter(|i| !segments.iter().any(|s| s.turn_index == *i))
                .collect();
            return Err(PipelineError::IncompleteAudioSet {
                missing,
                expected: turns.len(),
            });
        }
        Ok(segments)
    }

    async fn synthesize_turn(
        &self,
        turn_index: usize,
        request: &SynthesisRequest,
        cancel: &CancellationToken,
    ) -> Result<AudioSegment, TurnError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                r = self.provider.synthesize(request) => r,
            };

            match result {
                Ok(audio) => {
                    debug!("Turn {} synthesized on attempt {}", turn_index, attempt);
                    let duration = audio.duration.or_else(|| match audio.format {
                        AudioFormat::Wav => wav_duration(&audio.data),
                        _ => None,
                    });
                    return Ok(AudioSegment {
                        turn_index,
                        data: audio.data,
                        format: audio.format,
                        duration,
                        provider_used: self.provider.provider_id().to_string(),
                    });
                }
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_with_hint(attempt, error.retry_after());
                    warn!(
                        "Turn {} attempt {}/{} failed: {}. Retrying in {:?}",
                        turn_index, attempt, max_attempts, error, delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    warn!("Turn {} failed after {} attempt(s): {}", turn_index, attempt, error);
                    return Err(TurnError::Failed(TurnFailure {
                        turn_index,
                        attempts: attempt,
                        error,
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Speaker;
    use crate::services::capability::CapabilityRegistry;
    use crate::services::tts::SynthesizedAudio;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Fails the first `failures_per_text` calls for each text, then succeeds.
    struct FlakyProvider {
        failures_per_text: u32,
        delay: Duration,
        error: ProviderError,
        attempts: Arc<Mutex<HashMap<String, u32>>>,
        requests: Arc<Mutex<Vec<SynthesisRequest>>>,
        in_flight: Arc<Mutex<(usize, usize)>>,
    }

    impl FlakyProvider {
        fn new(failures_per_text: u32) -> Self {
            Self {
                failures_per_text,
                delay: Duration::from_millis(5),
                error: ProviderError::Unavailable("connection reset".into()),
                attempts: Arc::new(Mutex::new(HashMap::new())),
                requests: Arc::new(Mutex::new(Vec::new())),
                in_flight: Arc::new(Mutex::new((0, 0))),
            }
        }
    }

    #[async_trait]
    impl TtsProvider for FlakyProvider {
        fn provider_id(&self) -> &str {
            "openai"
        }

        async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesizedAudio, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            {
                let mut f = self.in_flight.lock().unwrap();
                f.0 += 1;
                f.1 = f.1.max(f.0);
            }
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(request.text.clone()).or_insert(0);
                *n += 1;
                *n
            };
            // Later turns finish first to exercise reordering.
            let index: u64 = request.text.trim_start_matches("turn ").parse().unwrap_or(0);
            tokio::time::sleep(self.delay + Duration::from_millis(20u64.saturating_sub(index * 2))).await;
            self.in_flight.lock().unwrap().0 -= 1;

            if attempt <= self.failures_per_text {
                return Err(self.error.clone());
            }
            Ok(SynthesizedAudio {
                data: request.text.as_bytes().to_vec(),
                format: AudioFormat::Mp3,
                duration: None,
            })
        }
    }

    fn speakers() -> SpeakerProfile {
        let mut bob = Speaker {
            name: "Bob".into(),
            voice_id: "onyx".into(),
            ..Default::default()
        };
        bob.custom_voice = Some(PathBuf::from("bob.wav"));
        SpeakerProfile {
            speakers: vec![
                Speaker {
                    name: "Alice".into(),
                    voice_id: "nova".into(),
                    ..Default::default()
                },
                bob,
            ],
        }
    }

    fn turns(k: usize) -> Vec<DialogueTurn> {
        (0..k)
            .map(|i| DialogueTurn {
                speaker: if i % 2 == 0 { "Alice" } else { "Bob" }.to_string(),
                text: format!("turn {}", i),
                emotion: "calm".into(),
                speed: 1.0,
            })
            .collect()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
        }
    }

    fn capability(id: &str) -> ProviderCapability {
        CapabilityRegistry::builtin().capabilities_for(id).unwrap().clone()
    }

    #[tokio::test]
    async fn test_retry_then_success_keeps_order() {
        let k = 8;
        let provider = Arc::new(FlakyProvider::new(2));
        let attempts = provider.attempts.clone();
        let in_flight = provider.in_flight.clone();
        let dispatcher = AudioSynthesisDispatcher::new(provider, capability("openai"), None, 3, fast_retry());

        let segments = dispatcher
            .synthesize_all(&turns(k), &speakers(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(segments.len(), k);
        for (i, seg) in segments.iter().enumerate() {
            assert_eq!(seg.turn_index, i);
            assert_eq!(seg.data, format!("turn {}", i).into_bytes());
            assert_eq!(seg.provider_used, "openai");
        }
        assert!(attempts.lock().unwrap().values().all(|n| *n == 3));
        assert!(in_flight.lock().unwrap().1 <= 3);
    }

    #[tokio::test]
    async fn test_exhausted_turns_fail_at_end() {
        let provider = Arc::new(FlakyProvider::new(10));
        let requests = provider.requests.clone();
        let dispatcher = AudioSynthesisDispatcher::new(provider, capability("openai"), None, 5, fast_retry());

        match dispatcher
            .synthesize_all(&turns(4), &speakers(), &CancellationToken::new())
            .await
        {
            Err(PipelineError::SynthesisFailed { failures }) => {
                assert_eq!(
                    failures.iter().map(|f| f.turn_index).collect::<Vec<_>>(),
                    vec![0, 1, 2, 3]
                );
                assert!(failures.iter().all(|f| f.attempts == 3));
            }
            other => panic!("unexpected: {:?}", other.map(|s| s.len())),
        }
        // every sibling ran to completion
        assert_eq!(requests.lock().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_invalid_input_is_not_retried() {
        let mut provider = FlakyProvider::new(10);
        provider.error = ProviderError::InvalidInput("bad voice".into());
        let provider = Arc::new(provider);
        let requests = provider.requests.clone();
        let dispatcher = AudioSynthesisDispatcher::new(provider, capability("openai"), None, 5, fast_retry());

        let err = dispatcher
            .synthesize_all(&turns(2), &speakers(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SynthesisFailed { .. }));
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_no_dialect_marker_when_unsupported() {
        let provider: Arc<dyn TtsProvider> = Arc::new(FlakyProvider::new(0));
        let mut turn = turns(1).remove(0);
        turn.text = "<|Sichuan|>巴适得板 [laughter]".into();

        let plain = AudioSynthesisDispatcher::new(provider.clone(), capability("openai"), Some("sichuan"), 5, fast_retry());
        let request = plain.build_request(&turn, &speakers()).unwrap();
        assert!(!request.text.contains("<|"));
        assert!(!request.text.contains('['));
        assert_eq!(request.dialect, None);

        let soulx = AudioSynthesisDispatcher::new(provider, capability("soulx"), Some("sichuanese"), 5, fast_retry());
        let request = soulx.build_request(&turn, &speakers()).unwrap();
        assert_eq!(request.text, "<|Sichuan|>巴适得板 <|laughter|>");
        assert_eq!(request.dialect.as_deref(), Some("sichuan"));
        assert_eq!(soulx.concurrency(), 1);
    }

    #[test]
    fn test_cloning_only_when_supported() {
        let provider: Arc<dyn TtsProvider> = Arc::new(FlakyProvider::new(0));
        let turn = turns(2).remove(1);

        let openai = AudioSynthesisDispatcher::new(provider.clone(), capability("openai"), None, 5, fast_retry());
        assert_eq!(openai.build_request(&turn, &speakers()).unwrap().reference_audio, None);

        let eleven = AudioSynthesisDispatcher::new(provider, capability("elevenlabs"), None, 5, fast_retry());
        assert_eq!(
            eleven.build_request(&turn, &speakers()).unwrap().reference_audio,
            Some(PathBuf::from("bob.wav"))
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_in_flight_work() {
        let mut provider = FlakyProvider::new(0);
        provider.delay = Duration::from_secs(30);
        let provider = Arc::new(provider);
        let requests = provider.requests.clone();
        let dispatcher = AudioSynthesisDispatcher::new(provider, capability("openai"), None, 3, fast_retry());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = dispatcher
            .synthesize_all(&turns(5), &speakers(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
        // 3 were in flight, the 2 queued turns never reached the provider
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(requests.lock().unwrap().len(), 3);
    }
}
