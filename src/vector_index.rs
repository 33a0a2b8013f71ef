//! Vector index over embedded schema documents.
//!
//! The index is built offline by the ingestion tooling; the agent only reads
//! it. Two implementations share the [`VectorIndex`] trait:
//! - [`SqliteVectorIndex`] reads a SQLite file (one row per document, the
//!   embedding stored as a JSON array) and ranks by cosine similarity.
//! - [`InMemoryVectorIndex`] holds documents in memory, used by tests and
//!   small deployments.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::cosine_similarity;

#[derive(Debug, Error)]
pub enum VectorIndexError {
    #[error("index storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("corrupt document '{id}': {reason}")]
    CorruptDocument { id: String, reason: String },

    #[error("query embedding has {query} dimensions but indexed documents have {indexed}")]
    DimensionMismatch { query: usize, indexed: usize },

    #[error("index worker failed: {0}")]
    Worker(String),
}

/// Provenance of a schema document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub source: String,
}

/// One embedded table description (human description + DDL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    /// Table name, unique within a collection
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: DocumentMetadata,
}

/// A query match, best first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredDocument {
    pub text: String,
    pub metadata: DocumentMetadata,
    pub score: f32,
}

/// Read-only nearest-neighbour lookup.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return at most `top_k` documents ordered by descending similarity.
    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredDocument>, VectorIndexError>;

    /// Human-readable location, used in diagnostics.
    fn location(&self) -> String;
}

/// Rank `documents` against `embedding`, keeping the best `top_k`.
///
/// Documents whose dimension differs from the query are skipped; if that
/// leaves nothing although documents exist, the mismatch is reported.
fn rank<'a, I>(
    embedding: &[f32],
    top_k: usize,
    documents: I,
) -> Result<Vec<ScoredDocument>, VectorIndexError>
where
    I: IntoIterator<Item = &'a SchemaDocument>,
{
    let mut indexed_dim = None;
    let mut scored: Vec<ScoredDocument> = Vec::new();
    for doc in documents {
        match cosine_similarity(embedding, &doc.embedding) {
            Some(score) => scored.push(ScoredDocument {
                text: doc.text.clone(),
                metadata: doc.metadata.clone(),
                score,
            }),
            None => {
                if indexed_dim.is_none() {
                    indexed_dim = Some(doc.embedding.len());
                }
                tracing::warn!(
                    "Skipping schema document '{}': {} dimensions, query has {}",
                    doc.id,
                    doc.embedding.len(),
                    embedding.len()
                );
            }
        }
    }

    if scored.is_empty() {
        if let Some(indexed) = indexed_dim {
            return Err(VectorIndexError::DimensionMismatch {
                query: embedding.len(),
                indexed,
            });
        }
    }

    // Stable sort keeps insertion order among equal scores.
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(top_k);
    Ok(scored)
}

/// In-memory index; contents are fixed at construction.
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    documents: Vec<SchemaDocument>,
}

impl InMemoryVectorIndex {
    pub fn new(documents: Vec<SchemaDocument>) -> Self {
        Self { documents }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredDocument>, VectorIndexError> {
        rank(embedding, top_k, &self.documents)
    }

    fn location(&self) -> String {
        "in-memory index".to_string()
    }
}

/// Index stored in a SQLite file, opened read-only on every query.
///
/// Expected layout:
///
/// ```sql
/// CREATE TABLE schema_documents (
///     id TEXT NOT NULL,
///     collection TEXT NOT NULL,
///     text TEXT NOT NULL,
///     embedding TEXT NOT NULL,  -- JSON array of floats
///     metadata TEXT NOT NULL,   -- JSON object
///     PRIMARY KEY (collection, id)
/// );
/// ```
#[derive(Debug, Clone)]
pub struct SqliteVectorIndex {
    path: PathBuf,
    collection: String,
}

impl SqliteVectorIndex {
    pub fn new(path: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            collection: collection.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path, collection: &str) -> Result<Vec<SchemaDocument>, VectorIndexError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut stmt = conn.prepare(
            "SELECT id, text, embedding, metadata FROM schema_documents \
             WHERE collection = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([collection], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, text, embedding, metadata) = row?;
            let embedding: Vec<f32> = serde_json::from_str(&embedding).map_err(|e| {
                VectorIndexError::CorruptDocument {
                    id: id.clone(),
                    reason: format!("embedding: {}", e),
                }
            })?;
            let metadata: DocumentMetadata = serde_json::from_str(&metadata).map_err(|e| {
                VectorIndexError::CorruptDocument {
                    id: id.clone(),
                    reason: format!("metadata: {}", e),
                }
            })?;
            documents.push(SchemaDocument {
                id,
                text,
                embedding,
                metadata,
            });
        }
        Ok(documents)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredDocument>, VectorIndexError> {
        let path = self.path.clone();
        let collection = self.collection.clone();
        let documents = tokio::task::spawn_blocking(move || Self::load(&path, &collection))
            .await
            .map_err(|e| VectorIndexError::Worker(e.to_string()))??;
        tracing::debug!(
            "Loaded {} schema documents from collection '{}'",
            documents.len(),
            self.collection
        );
        rank(embedding, top_k, &documents)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, embedding: Vec<f32>) -> SchemaDocument {
        SchemaDocument {
            id: id.to_string(),
            text: format!("Table Name: {}", id),
            embedding,
            metadata: DocumentMetadata {
                table_name: id.to_string(),
                source: "data_dictionary".to_string(),
            },
        }
    }

    fn write_index(path: &Path, docs: &[SchemaDocument], collection: &str) {
        let conn = Connection::open(path).expect("open index");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_documents (
                id TEXT NOT NULL,
                collection TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding TEXT NOT NULL,
                metadata TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );",
        )
        .expect("create table");
        for d in docs {
            conn.execute(
                "INSERT INTO schema_documents (id, collection, text, embedding, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    d.id,
                    collection,
                    d.text,
                    serde_json::to_string(&d.embedding).expect("embedding json"),
                    serde_json::to_string(&d.metadata).expect("metadata json"),
                ],
            )
            .expect("insert");
        }
    }

    #[tokio::test]
    async fn in_memory_query_orders_by_similarity() {
        let index = InMemoryVectorIndex::new(vec![
            doc("customers", vec![0.0, 1.0]),
            doc("sales", vec![1.0, 0.1]),
            doc("regions", vec![0.7, 0.7]),
        ]);
        let hits = index.query(&[1.0, 0.0], 2).await.expect("query");
        let names: Vec<_> = hits.iter().map(|h| h.metadata.table_name.as_str()).collect();
        assert_eq!(names, vec!["sales", "regions"]);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn empty_index_returns_no_matches() {
        let index = InMemoryVectorIndex::default();
        let hits = index.query(&[1.0, 0.0], 2).await.expect("query");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_reported() {
        let index = InMemoryVectorIndex::new(vec![doc("sales", vec![1.0, 0.0, 0.0])]);
        let err = index.query(&[1.0, 0.0], 2).await.unwrap_err();
        assert!(matches!(
            err,
            VectorIndexError::DimensionMismatch {
                query: 2,
                indexed: 3
            }
        ));
    }

    #[tokio::test]
    async fn sqlite_index_reads_only_its_collection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("schema_index.db");
        write_index(
            &path,
            &[doc("sales", vec![1.0, 0.0]), doc("regions", vec![0.0, 1.0])],
            "schema_kb",
        );
        write_index(&path, &[doc("kpi", vec![1.0, 0.0])], "kpi_kb");

        let index = SqliteVectorIndex::new(&path, "schema_kb");
        let hits = index.query(&[1.0, 0.0], 5).await.expect("query");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata.table_name, "sales");
        assert_eq!(hits[0].metadata.source, "data_dictionary");
    }

    #[tokio::test]
    async fn sqlite_index_missing_file_is_a_storage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = SqliteVectorIndex::new(dir.path().join("absent.db"), "schema_kb");
        let err = index.query(&[1.0], 2).await.unwrap_err();
        assert!(matches!(err, VectorIndexError::Storage(_)));
    }

    #[tokio::test]
    async fn sqlite_index_rejects_corrupt_embeddings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("schema_index.db");
        write_index(&path, &[doc("sales", vec![1.0])], "schema_kb");
        let conn = Connection::open(&path).expect("open");
        conn.execute("UPDATE schema_documents SET embedding = 'nope'", [])
            .expect("corrupt");

        let index = SqliteVectorIndex::new(&path, "schema_kb");
        let err = index.query(&[1.0], 2).await.unwrap_err();
        assert!(matches!(err, VectorIndexError::CorruptDocument { .. }));
    }
}
