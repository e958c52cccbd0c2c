//! "Ask the model for JSON matching a schema" with bounded corrective retries.

use log::{debug, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::SpeakerProfile;
use crate::services::llm::{clean_response, LlmClient};

/// A rendered prompt.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub system: String,
    pub user: String,
}

/// Shape of the JSON a stage expects, and how to check it.
pub trait OutputSchema {
    type Output;

    /// Stage name used in logs and errors.
    fn stage(&self) -> &'static str;

    /// Human readable description of the expected object, embedded in prompts.
    fn describe(&self) -> String;

    /// Parses and validates a cleaned response. Any contract violation is a
    /// `PipelineError::Validation`.
    fn parse(&self, raw: &str) -> PipelineResult<Self::Output>;
}

pub struct StructuredClient<'a> {
    llm: &'a dyn LlmClient,
    retry_count: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl<'a> StructuredClient<'a> {
    pub fn new(llm: &'a dyn LlmClient, retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            llm,
            retry_count,
            retry_delay,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// One free-form completion, no schema. Used for auxiliary calls such as digests.
    pub async fn complete(&self, prompt: &PromptContext) -> PipelineResult<String> {
        let raw = self.chat(&prompt.system, &prompt.user).await?;
        Ok(clean_response(&raw))
    }

    pub async fn generate<S: OutputSchema>(
        &self,
        prompt: &PromptContext,
        schema: &S,
    ) -> PipelineResult<S::Output> {
        let max_attempts = self.retry_count + 1;
        let mut last_reason = String::new();
        let mut last_response = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                warn!(
                    "{}: retrying ({}/{}) after: {}",
                    schema.stage(),
                    attempt,
                    max_attempts,
                    last_reason
                );
                if !self.retry_delay.is_zero() {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }

            let user = if attempt == 1 {
                prompt.user.clone()
            } else {
                corrective_prompt(&prompt.user, &last_reason, &schema.describe())
            };

            let raw = match self.chat(&prompt.system, &user).await {
                Ok(raw) => raw,
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    last_reason = e.to_string();
                    continue;
                }
            };
            debug!("{}: raw response ({} chars)", schema.stage(), raw.len());

            let cleaned = clean_response(&raw);
            match schema.parse(&cleaned) {
                Ok(output) => {
                    if attempt > 1 {
                        info!("{}: valid response on attempt {}", schema.stage(), attempt);
                    }
                    return Ok(output);
                }
                Err(e) => {
                    last_reason = match e {
                        PipelineError::Validation(reason) => reason,
                        other => other.to_string(),
                    };
                    last_response = raw;
                }
            }
        }

        Err(PipelineError::GenerationFailed {
            stage: schema.stage().to_string(),
            attempts: max_attempts,
            reason: last_reason,
            last_response,
        })
    }

    async fn chat(&self, system: &str, user: &str) -> PipelineResult<String> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            result = self.llm.chat(system, user) => result.map_err(PipelineError::Llm),
        }
    }
}

fn corrective_prompt(original: &str, reason: &str, schema: &str) -> String {
    format!(
        "{}\n\nYour previous answer was rejected: {}.\n\
         Reply again with a single JSON object of this exact shape and nothing else:\n{}",
        original, reason, schema
    )
}

/// Speaker roster as prompt text.
pub fn describe_speakers(speakers: &SpeakerProfile) -> String {
    speakers
        .speakers
        .iter()
        .map(|s| {
            let mut line = format!("- {}", s.name);
            if !s.personality.is_empty() {
                line.push_str(&format!(" (personality: {})", s.personality));
            }
            if !s.backstory.is_empty() {
                line.push_str(&format!(". Backstory: {}", s.backstory));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn invalid_json(e: serde_json::Error) -> PipelineError {
    PipelineError::Validation(format!("response is not the expected JSON object ({})", e))
}
