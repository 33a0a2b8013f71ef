//! Schema retrieval tool: semantic search over embedded table descriptions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{ParamType, ToolError, ToolHandler, ToolInput, ToolSpec};
use crate::embedding::Embedder;
use crate::retry::{with_retry, RetryPolicy, Retryable};
use crate::vector_index::VectorIndex;

pub const SCHEMA_TOOL_NAME: &str = "retrieve_schema_context";

const QUERY_PARAM: &str = "natural_language_query";
const VALIDATION_TEXT: &str = "test validation string";

const CONTEXT_HEADER: &str = "Retrieved Database Schema Context (relevant to query):\n";
const CONTEXT_SEPARATOR: &str = "\n---\n";
pub const NO_SCHEMA_FOUND: &str =
    "No relevant schema context found for your query. Please rephrase or simplify.";
pub const EMBEDDER_UNAVAILABLE: &str = "Error: Embedding model not initialized for schema retrieval. \
     Cannot perform RAG. Please check your API key and embedding model configuration.";

/// Embeds a question and returns the best-matching schema documents as text.
pub struct SchemaRetriever {
    embedder: Option<Arc<dyn Embedder>>,
    index: Arc<dyn VectorIndex>,
    top_k: usize,
    retry: RetryPolicy,
    timeout: Duration,
}

impl SchemaRetriever {
    /// Retriever without an embedder; every lookup returns the diagnostic string.
    pub fn new(index: Arc<dyn VectorIndex>, top_k: usize) -> Self {
        Self {
            embedder: None,
            index,
            top_k: top_k.max(1),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_transport(mut self, retry: RetryPolicy, timeout: Duration) -> Self {
        self.retry = retry;
        self.timeout = timeout;
        self
    }

    /// Embed a fixed text once at startup and keep the embedder only if it answers.
    ///
    /// A failed check is logged and leaves the retriever without an
    /// embedder instead of aborting startup.
    pub async fn initialize(mut self, embedder: Arc<dyn Embedder>) -> Self {
        let check = with_retry(&self.retry, self.timeout, "embedding check", || {
            embedder.embed(VALIDATION_TEXT)
        })
        .await;
        match check {
            Ok(vector) => {
                tracing::info!(
                    "Embedding model {} initialized ({} dimensions)",
                    embedder.model_name(),
                    vector.len()
                );
                self.embedder = Some(embedder);
            }
            Err(e) => {
                tracing::error!(
                    "Error initializing embedding model {}: {}",
                    embedder.model_name(),
                    e
                );
                self.embedder = None;
            }
        }
        self
    }

    pub fn is_ready(&self) -> bool {
        self.embedder.is_some()
    }

    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            SCHEMA_TOOL_NAME,
            "Retrieves relevant database schema information (tables, columns, relationships, \
             descriptions) from the sales database knowledge base using semantic search. \
             Call this first if you need to understand the schema before writing SQL.",
        )
        .param(QUERY_PARAM, ParamType::String)
    }

    /// Look up schema context for `query`.
    ///
    /// Index failures and non-transient embedding failures are returned as
    /// text; only an embedding call that exhausts its retries is an error.
    pub async fn retrieve_schema_context(&self, query: &str) -> Result<String, ToolError> {
        let Some(embedder) = &self.embedder else {
            return Ok(EMBEDDER_UNAVAILABLE.to_string());
        };

        let embedding = match with_retry(&self.retry, self.timeout, "query embedding", || {
            embedder.embed(query)
        })
        .await
        {
            Ok(embedding) => embedding,
            Err(e) if e.is_retryable() => return Err(ToolError::Transport(e.to_string())),
            Err(e) => return Ok(self.index_failure(&e)),
        };

        let matches = match self.index.query(&embedding, self.top_k).await {
            Ok(matches) => matches,
            Err(e) => {
                tracing::error!("Error in retrieve_schema_context: {}", e);
                return Ok(self.index_failure(&e));
            }
        };

        if matches.is_empty() {
            return Ok(NO_SCHEMA_FOUND.to_string());
        }

        tracing::debug!(
            "Schema lookup matched: {}",
            matches
                .iter()
                .map(|m| format!("{} ({:.3})", m.metadata.table_name, m.score))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let snippets: Vec<&str> = matches.iter().map(|m| m.text.as_str()).collect();
        Ok(format!("{}{}", CONTEXT_HEADER, snippets.join(CONTEXT_SEPARATOR)))
    }

    fn index_failure(&self, err: &dyn std::fmt::Display) -> String {
        format!(
            "Error retrieving schema from RAG: {}. Ensure the schema index is built at {} \
             and the embedding model is compatible.",
            err,
            self.index.location()
        )
    }
}

#[async_trait]
impl ToolHandler for SchemaRetriever {
    async fn call(&self, input: &ToolInput) -> Result<String, ToolError> {
        let query = input
            .get(QUERY_PARAM)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::Failed(format!("missing '{}'", QUERY_PARAM)))?;
        self.retrieve_schema_context(query).await
    }

    fn is_ready(&self) -> bool {
        SchemaRetriever::is_ready(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingError;
    use crate::vector_index::{
        DocumentMetadata, InMemoryVectorIndex, SchemaDocument, ScoredDocument, VectorIndexError,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Maps text to a 2-d vector: "sale" words point one way, everything else the other.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.to_lowercase().contains("sale") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }

        fn model_name(&self) -> &str {
            "keyword"
        }
    }

    struct BrokenEmbedder {
        calls: AtomicU32,
        status: u16,
    }

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EmbeddingError::Api {
                status: self.status,
                body: "nope".to_string(),
            })
        }

        fn model_name(&self) -> &str {
            "broken"
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl VectorIndex for BrokenIndex {
        async fn query(
            &self,
            _embedding: &[f32],
            _top_k: usize,
        ) -> Result<Vec<ScoredDocument>, VectorIndexError> {
            Err(VectorIndexError::Worker("disk unavailable".to_string()))
        }

        fn location(&self) -> String {
            "/tmp/missing.db".to_string()
        }
    }

    fn doc(table: &str, embedding: Vec<f32>) -> SchemaDocument {
        SchemaDocument {
            id: table.to_string(),
            text: format!("Table Name: {}", table),
            embedding,
            metadata: DocumentMetadata {
                table_name: table.to_string(),
                source: "data_dictionary".to_string(),
            },
        }
    }

    fn retriever(index: Arc<dyn VectorIndex>) -> SchemaRetriever {
        SchemaRetriever::new(index, 2)
            .with_transport(RetryPolicy::immediate(2), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn matches_are_joined_in_rank_order() {
        let index = Arc::new(InMemoryVectorIndex::new(vec![
            doc("customers", vec![0.0, 1.0]),
            doc("sales", vec![1.0, 0.0]),
            doc("regions", vec![0.8, 0.6]),
        ]));
        let tool = retriever(index).with_embedder(Arc::new(KeywordEmbedder));
        let out = tool
            .retrieve_schema_context("total sales by region")
            .await
            .expect("lookup");
        assert_eq!(
            out,
            "Retrieved Database Schema Context (relevant to query):\n\
             Table Name: sales\n---\nTable Name: regions"
        );
    }

    #[tokio::test]
    async fn empty_index_returns_sentinel() {
        let tool = retriever(Arc::new(InMemoryVectorIndex::default()))
            .with_embedder(Arc::new(KeywordEmbedder));
        let out = tool.retrieve_schema_context("anything").await.expect("lookup");
        assert_eq!(out, NO_SCHEMA_FOUND);
    }

    #[tokio::test]
    async fn missing_embedder_returns_diagnostic() {
        let tool = retriever(Arc::new(InMemoryVectorIndex::default()));
        assert!(!tool.is_ready());
        let out = tool.retrieve_schema_context("anything").await.expect("lookup");
        assert_eq!(out, EMBEDDER_UNAVAILABLE);
    }

    #[tokio::test]
    async fn failed_startup_check_leaves_retriever_uninitialized() {
        let embedder = Arc::new(BrokenEmbedder {
            calls: AtomicU32::new(0),
            status: 401,
        });
        let tool = retriever(Arc::new(InMemoryVectorIndex::default()))
            .initialize(embedder)
            .await;
        assert!(!tool.is_ready());
    }

    #[tokio::test]
    async fn index_failures_are_descriptive_text() {
        let tool = retriever(Arc::new(BrokenIndex)).with_embedder(Arc::new(KeywordEmbedder));
        let out = tool.retrieve_schema_context("sales").await.expect("lookup");
        assert!(out.starts_with("Error retrieving schema from RAG: index worker failed"));
        assert!(out.contains("/tmp/missing.db"));
    }

    #[tokio::test]
    async fn exhausted_embedding_retries_are_transport_errors() {
        let embedder = Arc::new(BrokenEmbedder {
            calls: AtomicU32::new(0),
            status: 503,
        });
        let tool = retriever(Arc::new(InMemoryVectorIndex::default()))
            .with_embedder(embedder.clone());
        let err = tool.retrieve_schema_context("sales").await.unwrap_err();
        assert!(matches!(err, ToolError::Transport(_)));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_embedding_requests_are_descriptive_text() {
        let embedder = Arc::new(BrokenEmbedder {
            calls: AtomicU32::new(0),
            status: 400,
        });
        let tool = retriever(Arc::new(InMemoryVectorIndex::default())).with_embedder(embedder);
        let out = tool.retrieve_schema_context("sales").await.expect("lookup");
        assert!(out.starts_with("Error retrieving schema from RAG"));
    }
}
