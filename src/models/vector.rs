//! Vector search models.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorSearchRequest {
    pub vector: Vec<f64>,
    #[serde(alias = "top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// One stored embedding and its similarity to the query vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: JsonValue,
    /// Cosine similarity in [-1, 1]
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorSearchResponse {
    pub success: bool,
    pub matches: Vec<VectorMatch>,
    /// Rows skipped for malformed or mismatched embeddings
    pub skipped: usize,
}
