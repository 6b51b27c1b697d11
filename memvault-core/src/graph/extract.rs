//! Entity/relationship extraction via the LLM collaborator.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::{strip_code_fences, LlmProvider};

const EXTRACT_PROMPT: &str = r#"Extract entities and relationships from the utterance below.

Reply with JSON only, no prose, in exactly this shape:
{"nodes":[{"kind":"person|animal|place|thing|concept|event","name":"...","props":{}}],
 "edges":[{"from_name":"...","to_name":"...","label":"...","weight":1.0}]}

Edges must reference node names from the same reply. Use few, meaningful
entities; skip stop words and pronouns.

Utterance:
"#;

/// One extracted entity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExtractedNode {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// One extracted relationship, named by endpoint node names.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExtractedEdge {
    pub from_name: String,
    pub to_name: String,
    pub label: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

fn default_weight() -> f32 {
    1.0
}

/// Raw extraction output, prior to normalisation and upserting.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub nodes: Vec<ExtractedNode>,
    #[serde(default)]
    pub edges: Vec<ExtractedEdge>,
}

impl Extraction {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// LLM-backed extractor with strict reply parsing.
pub struct GraphExtractor {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl GraphExtractor {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Extract entities and relationships from free text.
    ///
    /// Transport faults surface as [`Error::LlmUnavailable`]; an unparsable
    /// reply is [`Error::InvalidState`] so the caller can defer and retry.
    pub async fn extract(&self, text: &str) -> Result<Extraction> {
        let prompt = format!("{EXTRACT_PROMPT}{text}");
        let reply = tokio::time::timeout(self.timeout, self.llm.complete(&prompt))
            .await
            .map_err(|_| Error::ExecutionTimeout)?
            .map_err(|e| Error::LlmUnavailable(e.to_string()))?;

        let parsed: Extraction = serde_json::from_str(strip_code_fences(&reply))
            .map_err(|e| Error::InvalidState(format!("unparsable extraction reply: {e}")))?;

        // Drop edges whose endpoints were not named in the same reply.
        let names: std::collections::HashSet<String> = parsed
            .nodes
            .iter()
            .map(|n| crate::graph::normalise_name(&n.name))
            .collect();
        let (kept, dropped): (Vec<ExtractedEdge>, Vec<ExtractedEdge>) =
            parsed.edges.into_iter().partition(|e| {
                names.contains(&crate::graph::normalise_name(&e.from_name))
                    && names.contains(&crate::graph::normalise_name(&e.to_name))
            });
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropped dangling extracted edges");
        }

        Ok(Extraction {
            nodes: parsed.nodes,
            edges: kept,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Scripted(String);

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    fn extractor(reply: &str) -> GraphExtractor {
        GraphExtractor::new(Arc::new(Scripted(reply.to_string())), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn parses_well_formed_reply() {
        let reply = r#"{"nodes":[{"kind":"animal","name":"Pepper"},{"kind":"person","name":"Ada"}],
            "edges":[{"from_name":"Ada","to_name":"Pepper","label":"owns"}]}"#;
        let extraction = extractor(reply).extract("Ada owns Pepper").await.unwrap();
        assert_eq!(extraction.nodes.len(), 2);
        assert_eq!(extraction.edges.len(), 1);
        assert!((extraction.edges[0].weight - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn parses_fenced_reply() {
        let reply = "```json\n{\"nodes\":[{\"kind\":\"thing\",\"name\":\"bike\"}],\"edges\":[]}\n```";
        let extraction = extractor(reply).extract("I have a bike").await.unwrap();
        assert_eq!(extraction.nodes.len(), 1);
    }

    #[tokio::test]
    async fn rejects_prose_replies() {
        let err = extractor("Sure! Here are the entities…")
            .extract("whatever")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn drops_dangling_edges() {
        let reply = r#"{"nodes":[{"kind":"person","name":"Ada"}],
            "edges":[{"from_name":"Ada","to_name":"Ghost","label":"knows"}]}"#;
        let extraction = extractor(reply).extract("x").await.unwrap();
        assert!(extraction.edges.is_empty());
    }
}
