//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::Step;

/// Request to answer a question.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    /// The natural-language question
    pub query: String,

    /// Include the step-by-step transcript in the response
    #[serde(default)]
    pub include_transcript: bool,
}

/// Outcome of a query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// The agent produced a final answer
    Answered,
    /// The agent gave up; `answer` holds the failure message
    Failed,
}

/// Response to a query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    /// Request identifier, also used in logs
    pub id: Uuid,

    pub status: QueryStatus,

    /// Final answer, or a labelled failure message
    pub answer: String,

    /// Number of transcript steps taken
    pub steps: usize,

    /// Full transcript, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Vec<Step>>,

    pub completed_at: DateTime<Utc>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Model the agent talks to
    pub model: String,

    /// Whether schema lookups have a working embedding model
    pub embedding_ready: bool,
}

/// Error body for rejected requests.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
