//! Interfaces to the services this crate consumes but does not own.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::model::RetrievedChunk;

/// Organization-scoped similarity search over the knowledge base.
pub trait Retriever {
    fn retrieve(
        &self,
        query: &str,
        organization_id: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>>;
}

/// Chat-completion endpoint of the language model.
pub trait ChatCompletion {
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// Retrieval that degrades to an empty chunk set when the collaborator fails.
pub fn retrieve_or_empty(
    retriever: &dyn Retriever,
    query: &str,
    organization_id: &str,
    top_k: usize,
) -> Vec<RetrievedChunk> {
    match retriever.retrieve(query, organization_id, top_k) {
        Ok(chunks) => chunks,
        Err(err) => {
            warn!(
                organization_id,
                error = %err,
                "retrieval failed; continuing with an empty chunk set"
            );
            Vec::new()
        }
    }
}

/// Parses the first JSON array in a model response, tolerating prose or code fences around it.
pub fn parse_json_array<T: DeserializeOwned>(response: &str) -> Result<Vec<T>> {
    let start = response
        .find('[')
        .context("model response contains no JSON array")?;
    let end = response
        .rfind(']')
        .filter(|end| *end > start)
        .context("model response contains an unterminated JSON array")?;

    serde_json::from_str(&response[start..=end]).context("model response is not a valid array")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingRetriever;

    impl Retriever for FailingRetriever {
        fn retrieve(&self, _: &str, _: &str, _: usize) -> Result<Vec<RetrievedChunk>> {
            anyhow::bail!("vector store unreachable")
        }
    }

    #[test]
    fn retrieve_or_empty_swallows_collaborator_errors() {
        let chunks = retrieve_or_empty(&FailingRetriever, "budget", "org-1", 5);
        assert!(chunks.is_empty());
    }

    #[test]
    fn parse_json_array_accepts_fenced_output() {
        let response = "Here you go:\n```json\n[{\"value\": 1}, {\"value\": 2}]\n```";
        let values: Vec<serde_json::Value> =
            parse_json_array(response).expect("array should parse");
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn parse_json_array_rejects_missing_array() {
        let result: Result<Vec<serde_json::Value>> = parse_json_array("no structured data");
        assert!(result.is_err());
    }
}
