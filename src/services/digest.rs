use log::info;

use crate::core::error::PipelineResult;
use crate::services::structured::{PromptContext, StructuredClient};

const DIGEST_SYSTEM: &str = "You condense source material for podcast hosts. \
Keep facts, numbers, names and quotes. Answer in plain text.";

pub fn needs_digest(content: &str, threshold_chars: usize) -> bool {
    threshold_chars > 0 && content.chars().count() > threshold_chars
}

/// Condenses long content, guided by the briefing.
///
/// Returns `None` when the content is short enough to use as is.
pub async fn digest_content(
    client: &StructuredClient<'_>,
    briefing: &str,
    content: &str,
    threshold_chars: usize,
) -> PipelineResult<Option<String>> {
    if !needs_digest(content, threshold_chars) {
        return Ok(None);
    }
    info!(
        "Content has {} chars (limit {}), condensing",
        content.chars().count(),
        threshold_chars
    );
    let prompt = PromptContext {
        system: DIGEST_SYSTEM.to_string(),
        user: format!(
            "Briefing:\n{}\n\nCondense the following material to what the briefing needs, \
             in at most {} characters:\n\n{}",
            briefing, threshold_chars, content
        ),
    };
    let digest = client.complete(&prompt).await?;
    let digest = digest.trim();
    if digest.is_empty() {
        info!("Digest came back empty, keeping original content");
        return Ok(None);
    }
    info!("Content condensed to {} chars", digest.chars().count());
    Ok(Some(digest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::LlmClient;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug)]
    struct SummaryLlm {
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl LlmClient for SummaryLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            Ok("<think>short it</think>the gist".to_string())
        }
    }

    #[tokio::test]
    async fn test_digest_only_above_threshold() {
        let llm = SummaryLlm {
            calls: Arc::new(Mutex::new(0)),
        };
        let client = StructuredClient::new(&llm, 0, Duration::ZERO);

        assert_eq!(digest_content(&client, "b", "short", 100).await.unwrap(), None);
        assert_eq!(digest_content(&client, "b", &"x".repeat(500), 0).await.unwrap(), None);
        assert_eq!(*llm.calls.lock().unwrap(), 0);

        let digest = digest_content(&client, "b", &"x".repeat(500), 100).await.unwrap();
        assert_eq!(digest.as_deref(), Some("the gist"));
        assert_eq!(*llm.calls.lock().unwrap(), 1);
    }
}
