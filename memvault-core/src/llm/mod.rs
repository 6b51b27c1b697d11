//! External LLM collaborator.
//!
//! The core only needs text-in / text-out completion: classification and
//! entity extraction parse the full reply. Streaming is offered so hosts
//! can surface partial output, with the single requirement that completion
//! can be awaited for post-processing.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::{Error, Result};

/// Text-completion service.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt and return the full reply.
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;

    /// Stream a completion chunk by chunk.
    ///
    /// Default implementation yields the full reply as a single chunk.
    async fn complete_stream(
        &self,
        prompt: &str,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<String>>> {
        let full = self.complete(prompt).await?;
        Ok(futures::stream::once(async move { Ok(full) }).boxed())
    }
}

/// Await a streaming completion to its full text.
pub async fn collect_stream(
    mut stream: BoxStream<'static, anyhow::Result<String>>,
) -> Result<String> {
    let mut full = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::LlmUnavailable(e.to_string()))?;
        full.push_str(&chunk);
    }
    Ok(full)
}

/// Strip common markdown fencing so strict JSON parsing can proceed.
#[must_use]
pub fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}
