//! Should-save classification of utterances.
//!
//! Delegates to the LLM collaborator with a fixed prompt and strictly
//! parses the reply; anything that fails the schema degrades to
//! "don't save" rather than guessing.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::{strip_code_fences, LlmProvider};
use crate::types::Category;

const CLASSIFY_PROMPT: &str = r#"Decide whether the utterance below contains personal information worth remembering long-term for the speaker.

Reply with JSON only, no prose, in exactly this shape:
{"should_save":true,"category":"personal|preference|fact|event|task|relationship|other","confidence":0.0}

Guidelines: save stable personal facts, preferences, relationships and
commitments; do not save small talk, questions, or transient chatter.

Utterance:
"#;

/// Classifier verdict for one utterance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub should_save: bool,
    pub category: Category,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

impl Classification {
    /// The verdict used when a reply fails the schema.
    #[must_use]
    pub fn rejected() -> Self {
        Self {
            should_save: false,
            category: Category::Other,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReply {
    should_save: bool,
    category: String,
    confidence: f32,
}

/// LLM-backed should-save classifier.
pub struct Classifier {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl Classifier {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Classify one utterance.
    ///
    /// Transport faults surface as [`Error::LlmUnavailable`]; schema
    /// failures return [`Classification::rejected`] per contract.
    pub async fn classify(&self, utterance: &str) -> Result<Classification> {
        let prompt = format!("{CLASSIFY_PROMPT}{utterance}");
        let reply = tokio::time::timeout(self.timeout, self.llm.complete(&prompt))
            .await
            .map_err(|_| Error::ExecutionTimeout)?
            .map_err(|e| Error::LlmUnavailable(e.to_string()))?;

        match serde_json::from_str::<RawReply>(strip_code_fences(&reply)) {
            Ok(raw) => Ok(Classification {
                should_save: raw.should_save,
                category: Category::parse(&raw.category),
                confidence: raw.confidence.clamp(0.0, 1.0),
            }),
            Err(e) => {
                debug!(error = %e, "classifier reply failed schema; rejecting");
                Ok(Classification::rejected())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Scripted(std::result::Result<String, String>);

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            match &self.0 {
                Ok(reply) => Ok(reply.clone()),
                Err(e) => anyhow::bail!("{e}"),
            }
        }
    }

    fn classifier(reply: std::result::Result<&str, &str>) -> Classifier {
        Classifier::new(
            Arc::new(Scripted(
                reply.map(str::to_string).map_err(str::to_string),
            )),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn parses_affirmative_reply() {
        let c = classifier(Ok(
            r#"{"should_save":true,"category":"personal","confidence":0.93}"#,
        ));
        let verdict = c.classify("My dog is Pepper").await.unwrap();
        assert!(verdict.should_save);
        assert_eq!(verdict.category, Category::Personal);
        assert!((verdict.confidence - 0.93).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unknown_category_maps_to_other() {
        let c = classifier(Ok(
            r#"{"should_save":true,"category":"galactic","confidence":0.5}"#,
        ));
        let verdict = c.classify("x").await.unwrap();
        assert_eq!(verdict.category, Category::Other);
    }

    #[tokio::test]
    async fn schema_failure_rejects() {
        for bad in [
            "not json at all",
            r#"{"should_save":"yes","category":"fact","confidence":1}"#,
            r#"{"should_save":true,"category":"fact","confidence":0.4,"extra":1}"#,
        ] {
            let verdict = classifier(Ok(bad)).classify("x").await.unwrap();
            assert_eq!(verdict, Classification::rejected(), "reply: {bad}");
        }
    }

    #[tokio::test]
    async fn confidence_is_clamped() {
        let c = classifier(Ok(
            r#"{"should_save":true,"category":"fact","confidence":7.5}"#,
        ));
        let verdict = c.classify("x").await.unwrap();
        assert!((verdict.confidence - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn transport_fault_surfaces() {
        let err = classifier(Err("503")).classify("x").await.unwrap_err();
        assert!(matches!(err, Error::LlmUnavailable(_)));
    }
}
