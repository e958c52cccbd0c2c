use log::info;
use serde::Deserialize;

use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::{Outline, Segment, SegmentRole, SegmentSize, SpeakerProfile};
use crate::services::structured::{
    describe_speakers, invalid_json, OutputSchema, PromptContext, StructuredClient,
};

const OUTLINE_SYSTEM: &str = "You plan podcast episodes. \
You always answer with a single JSON object and no other text.";

/// Expects exactly `count` segments, each with a known size.
pub struct OutlineSchema {
    pub count: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOutline {
    segments: Vec<RawSegment>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSegment {
    name: String,
    description: String,
    size: String,
}

impl OutputSchema for OutlineSchema {
    type Output = Outline;

    fn stage(&self) -> &'static str {
        "outline"
    }

    fn describe(&self) -> String {
        format!(
            r#"{{"segments": [{{"name": string, "description": string, "size": "short" | "medium" | "long"}}]}} with exactly {} element(s) in "segments""#,
            self.count
        )
    }

    fn parse(&self, raw: &str) -> PipelineResult<Outline> {
        let parsed: RawOutline = serde_json::from_str(raw).map_err(invalid_json)?;

        if parsed.segments.len() != self.count {
            return Err(PipelineError::Validation(format!(
                "expected exactly {} segments, got {}",
                self.count,
                parsed.segments.len()
            )));
        }

        let mut segments = Vec::with_capacity(self.count);
        for (i, seg) in parsed.segments.into_iter().enumerate() {
            if seg.name.trim().is_empty() {
                return Err(PipelineError::Validation(format!(
                    "segment {} has an empty name",
                    i
                )));
            }
            let size = parse_size(&seg.size).ok_or_else(|| {
                PipelineError::Validation(format!(
                    "segment {} has size '{}', allowed: {}",
                    i,
                    seg.size,
                    SegmentSize::ALL.join(", ")
                ))
            })?;
            segments.push(Segment {
                name: seg.name.trim().to_string(),
                description: seg.description.trim().to_string(),
                size,
                role: SegmentRole::for_position(i, self.count),
            });
        }
        Ok(Outline { segments })
    }
}

fn parse_size(s: &str) -> Option<SegmentSize> {
    match s.trim().to_lowercase().as_str() {
        "short" => Some(SegmentSize::Short),
        "medium" => Some(SegmentSize::Medium),
        "long" => Some(SegmentSize::Long),
        _ => None,
    }
}

pub struct OutlineStage<'a> {
    client: &'a StructuredClient<'a>,
}

impl<'a> OutlineStage<'a> {
    pub fn new(client: &'a StructuredClient<'a>) -> Self {
        Self { client }
    }

    pub async fn build_outline(
        &self,
        briefing: &str,
        content: &str,
        speakers: &SpeakerProfile,
        num_segments: usize,
        language: &str,
    ) -> PipelineResult<Outline> {
        info!("Building outline with {} segment(s)", num_segments);
        let schema = OutlineSchema {
            count: num_segments,
        };
        let prompt = PromptContext {
            system: OUTLINE_SYSTEM.to_string(),
            user: render_outline_prompt(briefing, content, speakers, num_segments, language, &schema),
        };
        let outline = self.client.generate(&prompt, &schema).await?;
        info!(
            "Outline ready: {}",
            outline
                .segments
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(" | ")
        );
        Ok(outline)
    }
}

fn render_outline_prompt(
    briefing: &str,
    content: &str,
    speakers: &SpeakerProfile,
    num_segments: usize,
    language: &str,
    schema: &OutlineSchema,
) -> String {
    format!(
        "Plan a podcast episode in {num} segment(s).\n\n\
         Briefing:\n{briefing}\n\n\
         Hosts:\n{speakers}\n\n\
         Source material:\n{content}\n\n\
         Rules:\n\
         - The first segment introduces the topic and the hosts.\n\
         - The last segment wraps up the episode.\n\
         - Segments follow the narrative order of the episode.\n\
         - \"size\" is how much discussion a segment deserves: short, medium or long.\n\
         - Write names and descriptions in language \"{language}\".\n\n\
         Answer with: {schema}",
        num = num_segments,
        briefing = briefing,
        speakers = describe_speakers(speakers),
        content = content,
        language = language,
        schema = schema.describe(),
    )
}
