use log::{debug, info};
use serde::Deserialize;

use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::{DialogueTurn, Outline, Segment, SegmentRole, SpeakerProfile, SpeedValue};
use crate::services::capability::ProviderCapability;
use crate::services::markup::{dialect_marker, normalize_dialect, voice_tags_in};
use crate::services::structured::{
    describe_speakers, invalid_json, OutputSchema, PromptContext, StructuredClient,
};

const TRANSCRIPT_SYSTEM: &str = "You write natural podcast dialogue. \
You always answer with a single JSON object and no other text.";

/// How many prior turns are quoted back as continuity context.
const CONTEXT_TURNS: usize = 30;

/// Expects at least `min_turns` turns, every speaker from `roster`.
pub struct TranscriptSchema {
    pub roster: Vec<String>,
    pub min_turns: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTranscript {
    transcript: Vec<RawTurn>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTurn {
    speaker: String,
    #[serde(alias = "text")]
    dialogue: String,
    emotion: String,
    speed: SpeedValue,
}

impl OutputSchema for TranscriptSchema {
    type Output = Vec<DialogueTurn>;

    fn stage(&self) -> &'static str {
        "transcript"
    }

    fn describe(&self) -> String {
        format!(
            r#"{{"transcript": [{{"speaker": one of {:?}, "dialogue": string, "emotion": string, "speed": number or "slow" | "normal" | "fast"}}]}} with at least {} element(s)"#,
            self.roster, self.min_turns
        )
    }

    fn parse(&self, raw: &str) -> PipelineResult<Vec<DialogueTurn>> {
        let parsed: RawTranscript = serde_json::from_str(raw).map_err(invalid_json)?;

        if parsed.transcript.len() < self.min_turns {
            return Err(PipelineError::Validation(format!(
                "expected at least {} turns, got {}",
                self.min_turns,
                parsed.transcript.len()
            )));
        }

        let mut turns = Vec::with_capacity(parsed.transcript.len());
        for (i, turn) in parsed.transcript.into_iter().enumerate() {
            let speaker = turn.speaker.trim();
            if !self.roster.iter().any(|name| name == speaker) {
                return Err(PipelineError::Validation(format!(
                    "turn {} uses speaker '{}', allowed speakers are: {}",
                    i,
                    turn.speaker,
                    self.roster.join(", ")
                )));
            }
            let text = turn.dialogue.trim();
            if text.is_empty() {
                return Err(PipelineError::Validation(format!("turn {} has no dialogue", i)));
            }
            turns.push(DialogueTurn {
                speaker: speaker.to_string(),
                text: text.to_string(),
                emotion: turn.emotion.trim().to_string(),
                speed: turn.speed.resolve(),
            });
        }
        Ok(turns)
    }
}

/// Transcript of a whole outline.
#[derive(Debug, Clone)]
pub struct BuiltTranscript {
    pub turns: Vec<DialogueTurn>,
    pub turns_per_segment: Vec<usize>,
}

pub struct TranscriptStage<'a> {
    client: &'a StructuredClient<'a>,
    briefing: String,
    language: String,
    dialect: Option<String>,
    min_turns: usize,
}

impl<'a> TranscriptStage<'a> {
    pub fn new(
        client: &'a StructuredClient<'a>,
        briefing: &str,
        language: &str,
        dialect: Option<&str>,
        min_turns: usize,
    ) -> Self {
        Self {
            client,
            briefing: briefing.to_string(),
            language: language.to_string(),
            dialect: dialect.map(|d| d.to_string()),
            min_turns: min_turns.max(1),
        }
    }

    /// Segments run strictly in order; each one sees every turn produced before it.
    pub async fn build_transcript(
        &self,
        outline: &Outline,
        speakers: &SpeakerProfile,
        capability: &ProviderCapability,
    ) -> PipelineResult<BuiltTranscript> {
        let total = outline.segments.len();
        let mut turns: Vec<DialogueTurn> = Vec::new();
        let mut turns_per_segment = Vec::with_capacity(total);

        for index in 0..total {
            info!(
                "Generating transcript for segment {}/{}: {}",
                index + 1,
                total,
                outline.segments[index].name
            );
            let is_final = index + 1 == total;
            let batch = self
                .generate_segment_transcript(outline, index, &turns, speakers, capability, is_final)
                .await?;
            info!("Segment {} produced {} turn(s)", index + 1, batch.len());
            turns_per_segment.push(batch.len());
            turns.extend(batch);
        }

        Ok(BuiltTranscript {
            turns,
            turns_per_segment,
        })
    }

    pub async fn generate_segment_transcript(
        &self,
        outline: &Outline,
        index: usize,
        prior: &[DialogueTurn],
        speakers: &SpeakerProfile,
        capability: &ProviderCapability,
        is_final: bool,
    ) -> PipelineResult<Vec<DialogueTurn>> {
        let segment = outline.segments.get(index).ok_or_else(|| {
            PipelineError::Validation(format!("outline has no segment {}", index))
        })?;

        let dialect = self.resolve_dialect(capability);
        let mut tags: Vec<String> = capability.usable_tags().into_iter().collect();
        tags.sort();
        debug!(
            "Segment {} uses dialect {:?} and voice tags {:?}",
            index, dialect, tags
        );

        let schema = TranscriptSchema {
            roster: speakers.names(),
            min_turns: self.min_turns,
        };
        let prompt = PromptContext {
            system: TRANSCRIPT_SYSTEM.to_string(),
            user: self.render_prompt(
                outline,
                segment,
                prior,
                speakers,
                dialect.as_deref(),
                &tags,
                is_final,
                &schema,
            ),
        };
        self.client.generate(&prompt, &schema).await
    }

    /// Dialect the text should be written in, if the provider can also speak it.
    fn resolve_dialect(&self, capability: &ProviderCapability) -> Option<String> {
        let dialect = self.dialect.as_deref()?;
        let normalized = normalize_dialect(dialect);
        if dialect_marker(&normalized).is_some() && capability.supports_dialect(&normalized) {
            Some(normalized)
        } else {
            if normalized != "mandarin" {
                info!(
                    "Provider '{}' cannot speak dialect '{}', writing standard text",
                    capability.provider_id, normalized
                );
            }
            None
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn render_prompt(
        &self,
        outline: &Outline,
        segment: &Segment,
        prior: &[DialogueTurn],
        speakers: &SpeakerProfile,
        dialect: Option<&str>,
        tags: &[String],
        is_final: bool,
        schema: &TranscriptSchema,
    ) -> String {
        let plan = outline
            .segments
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}: {}", i + 1, s.name, s.description))
            .collect::<Vec<_>>()
            .join("\n");

        let start = prior.len().saturating_sub(CONTEXT_TURNS);
        let so_far = if prior.is_empty() {
            "(nothing yet, this is the start of the episode)".to_string()
        } else {
            prior[start..]
                .iter()
                .map(|t| format!("{}: {}", t.speaker, t.text))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut rules = vec![
            format!(
                "Write about {} turns of dialogue for the segment \"{}\": {}",
                segment.size.suggested_turns(),
                segment.name,
                segment.description
            ),
            format!("Write at least {} turn(s).", self.min_turns),
            format!(
                "\"speaker\" must be exactly one of: {}. Never use placeholders such as Host or Guest.",
                speakers.names().join(", ")
            ),
            format!("Write the dialogue in language \"{}\".", self.language),
            "\"emotion\" is a short description of how the line is delivered.".to_string(),
            "Continue naturally from the conversation so far; do not repeat it.".to_string(),
        ];

        match segment.role {
            SegmentRole::Intro if prior.is_empty() => {
                rules.push("Open the episode and introduce the hosts.".to_string())
            }
            _ => rules.push("Do not greet the audience again.".to_string()),
        }
        if is_final {
            rules.push("This is the final segment: wrap up the episode and say goodbye.".to_string());
        } else {
            rules.push("Do not end the episode yet.".to_string());
        }

        if let Some(d) = dialect {
            rules.push(format!(
                "Write every line in the colloquial {} dialect, using its typical words and phrasing.",
                d
            ));
        }
        if tags.is_empty() {
            rules.push("Do not use bracketed sound cues.".to_string());
        } else {
            rules.push(format!(
                "You may embed sound cues inline, only from this list: {}.",
                tags.iter()
                    .map(|t| format!("[{}]", t))
                    .collect::<Vec<_>>()
                    .join(" ")
            ));
        }

        format!(
            "Briefing:\n{briefing}\n\n\
             Hosts:\n{hosts}\n\n\
             Episode plan:\n{plan}\n\n\
             Conversation so far:\n{so_far}\n\n\
             Rules:\n{rules}\n\n\
             Answer with: {schema}",
            briefing = self.briefing,
            hosts = describe_speakers(speakers),
            plan = plan,
            so_far = so_far,
            rules = rules
                .iter()
                .map(|r| format!("- {}", r))
                .collect::<Vec<_>>()
                .join("\n"),
            schema = schema.describe(),
        )
    }
}

/// Turns whose text carries a tag outside the provider vocabulary.
pub fn turns_with_foreign_tags(turns: &[DialogueTurn], capability: &ProviderCapability) -> Vec<usize> {
    turns
        .iter()
        .enumerate()
        .filter(|(_, t)| voice_tags_in(&t.text).iter().any(|tag| !capability.allows_tag(tag)))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{SegmentSize, Speaker};
    use crate::services::capability::CapabilityRegistry;
    use crate::services::llm::LlmClient;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn speakers() -> SpeakerProfile {
        SpeakerProfile {
            speakers: vec![
                Speaker {
                    name: "Alice".into(),
                    voice_id: "nova".into(),
                    ..Default::default()
                },
                Speaker {
                    name: "Bob".into(),
                    voice_id: "onyx".into(),
                    ..Default::default()
                },
            ],
        }
    }

    fn outline(n: usize) -> Outline {
        Outline {
            segments: (0..n)
                .map(|i| Segment {
                    name: format!("Seg{}", i),
                    description: "desc".into(),
                    size: SegmentSize::Short,
                    role: SegmentRole::for_position(i, n),
                })
                .collect(),
        }
    }

    /// Replies in order; records every prompt.
    #[derive(Debug)]
    struct RecordingLlm {
        replies: Mutex<Vec<String>>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingLlm {
        fn new(replies: Vec<String>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().rev().collect()),
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl LlmClient for RecordingLlm {
        async fn chat(&self, _system: &str, user: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(user.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("exhausted"))
        }
    }

    fn turns_json(pairs: &[(&str, &str)]) -> String {
        let turns: Vec<String> = pairs
            .iter()
            .map(|(s, d)| {
                format!(
                    r#"{{"speaker": "{}", "dialogue": "{}", "emotion": "calm", "speed": "normal"}}"#,
                    s, d
                )
            })
            .collect();
        format!(r#"{{"transcript": [{}]}}"#, turns.join(","))
    }

    #[tokio::test]
    async fn test_segments_run_in_order_with_continuity() {
        let llm = RecordingLlm::new(vec![
            turns_json(&[("Alice", "Welcome"), ("Bob", "Hi")]),
            turns_json(&[("Bob", "So anyway"), ("Alice", "Right"), ("Bob", "Yes")]),
            turns_json(&[("Alice", "Goodbye")]),
        ]);
        let prompts = llm.prompts.clone();
        let client = StructuredClient::new(&llm, 2, Duration::ZERO);
        let stage = TranscriptStage::new(&client, "brief", "en", None, 1);
        let registry = CapabilityRegistry::builtin();
        let cap = registry.capabilities_for("openai").unwrap();

        let built = stage.build_transcript(&outline(3), &speakers(), cap).await.unwrap();
        assert_eq!(built.turns_per_segment, vec![2, 3, 1]);
        assert_eq!(built.turns.len(), 6);
        assert_eq!(built.turns[2].text, "So anyway");

        let prompts = prompts.lock().unwrap();
        assert!(prompts[0].contains("nothing yet"));
        assert!(prompts[1].contains("Bob: Hi"));
        assert!(prompts[1].contains("Do not end the episode yet"));
        assert!(prompts[2].contains("Alice: Right"));
        assert!(prompts[2].contains("final segment"));
        assert!(prompts[0].contains("Do not use bracketed sound cues"));
    }

    #[tokio::test]
    async fn test_generic_speaker_is_rejected_and_retried() {
        let llm = RecordingLlm::new(vec![
            turns_json(&[("Host", "Hello")]),
            turns_json(&[("Alice", "Hello")]),
        ]);
        let client = StructuredClient::new(&llm, 2, Duration::ZERO);
        let stage = TranscriptStage::new(&client, "brief", "en", None, 1);
        let registry = CapabilityRegistry::builtin();
        let cap = registry.capabilities_for("openai").unwrap();

        let built = stage.build_transcript(&outline(1), &speakers(), cap).await.unwrap();
        let roster = speakers().names();
        assert!(built.turns.iter().all(|t| roster.contains(&t.speaker)));
        assert_eq!(llm.prompts.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_min_turns_enforced() {
        let schema = TranscriptSchema {
            roster: vec!["Alice".into()],
            min_turns: 2,
        };
        assert!(schema.parse(&turns_json(&[("Alice", "one")])).is_err());
        let turns = schema
            .parse(r#"{"transcript": [{"speaker": "Alice", "text": "a", "emotion": "", "speed": 1.5}, {"speaker": "Alice", "dialogue": "b", "emotion": "warm", "speed": "fast"}]}"#)
            .unwrap();
        assert_eq!(turns[0].speed, 1.5);
        assert_eq!(turns[1].speed, 1.1);
        assert_eq!(turns[0].emotion, "");
    }

    #[test]
    fn test_schema_requires_exact_key_set() {
        let schema = TranscriptSchema {
            roster: vec!["Alice".into()],
            min_turns: 1,
        };
        let missing = schema.parse(r#"{"transcript": [{"speaker": "Alice", "dialogue": "hi"}]}"#);
        assert!(matches!(missing, Err(PipelineError::Validation(_))));

        let extra_turn = schema.parse(
            r#"{"transcript": [{"speaker": "Alice", "dialogue": "hi", "emotion": "", "speed": 1.0, "volume": 3}]}"#,
        );
        assert!(matches!(extra_turn, Err(PipelineError::Validation(_))));

        let extra_top = schema.parse(&turns_json(&[("Alice", "hi")]).replacen('{', r#"{"notes": "x", "#, 1));
        assert!(matches!(extra_top, Err(PipelineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_dialect_and_tags_follow_capability() {
        let llm = RecordingLlm::new(vec![turns_json(&[("Alice", "hi")]), turns_json(&[("Alice", "hi")])]);
        let prompts = llm.prompts.clone();
        let client = StructuredClient::new(&llm, 0, Duration::ZERO);
        let stage = TranscriptStage::new(&client, "brief", "zh", Some("Sichuanese"), 1);
        let registry = CapabilityRegistry::builtin();

        let soulx = registry.capabilities_for("soulx").unwrap();
        stage.build_transcript(&outline(1), &speakers(), soulx).await.unwrap();
        let openai = registry.capabilities_for("openai").unwrap();
        stage.build_transcript(&outline(1), &speakers(), openai).await.unwrap();

        let prompts = prompts.lock().unwrap();
        assert!(prompts[0].contains("sichuan dialect"));
        assert!(prompts[0].contains("[laughter]"));
        assert!(!prompts[1].contains("dialect"));
        assert!(!prompts[1].contains("[laughter]"));
    }

    #[test]
    fn test_foreign_tags_detected() {
        let registry = CapabilityRegistry::builtin();
        let cap = registry.capabilities_for("elevenlabs").unwrap();
        let turns = vec![
            DialogueTurn {
                speaker: "Alice".into(),
                text: "ha [laughter]".into(),
                emotion: String::new(),
                speed: 1.0,
            },
            DialogueTurn {
                speaker: "Bob".into(),
                text: "[cough] sorry".into(),
                emotion: String::new(),
                speed: 1.0,
            },
        ];
        assert_eq!(turns_with_foreign_tags(&turns, cap), vec![1]);
    }
}
