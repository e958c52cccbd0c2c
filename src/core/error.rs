use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a failed TTS call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider rejected input: {0}")]
    InvalidInput(String),
    #[error("provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Network failures and rate limits are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Unavailable(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Maps an HTTP status (and optional body) onto the provider taxonomy.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        match status {
            429 => ProviderError::RateLimited { retry_after },
            500..=599 => ProviderError::Unavailable(format!("HTTP {}: {}", status, body)),
            400..=499 => ProviderError::InvalidInput(format!("HTTP {}: {}", status, body)),
            _ => ProviderError::Unknown(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            ProviderError::Unavailable(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::from_status(status.as_u16(), &e.to_string(), None)
        } else {
            ProviderError::Unknown(e.to_string())
        }
    }
}

/// A single turn that could not be synthesized.
#[derive(Debug, Clone)]
pub struct TurnFailure {
    pub turn_index: usize,
    pub attempts: u32,
    pub error: ProviderError,
}

impl fmt::Display for TurnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "turn {} failed after {} attempt(s): {}",
            self.turn_index, self.attempts, self.error
        )
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Out-of-contract LLM output. Recovered by the structured client's retry loop.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{stage} generation failed after {attempts} attempt(s): {reason}")]
    GenerationFailed {
        stage: String,
        attempts: u32,
        reason: String,
        last_response: String,
    },

    #[error("synthesis failed for {} turn(s): {}", failures.len(), join_failures(failures))]
    SynthesisFailed { failures: Vec<TurnFailure> },

    #[error("incomplete audio set, missing turn indices {missing:?} of {expected}")]
    IncompleteAudioSet { missing: Vec<usize>, expected: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("llm request failed: {0:#}")]
    Llm(anyhow::Error),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

fn join_failures(failures: &[TurnFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
