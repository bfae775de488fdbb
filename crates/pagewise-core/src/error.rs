//! Error taxonomy shared by the ingestion pipeline and the record layer.
//!
//! Ingestion failures never reach a polling caller: the pipeline absorbs
//! every [`IngestError`] into the document's `FAILED` status. Access errors
//! are returned to callers and mapped onto HTTP status codes by the server.

use thiserror::Error;

/// A failure in one stage of ingestion.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("fetch failed for key '{key}': {reason}")]
    Fetch { key: String, reason: String },
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("embedding failed: {0}")]
    Embed(String),
    #[error("index write failed for namespace '{namespace}': {reason}")]
    Index { namespace: String, reason: String },
    #[error("status write failed: {0}")]
    Status(String),
}

impl IngestError {
    /// Short stage label used in log fields.
    pub fn stage(&self) -> &'static str {
        match self {
            IngestError::Fetch { .. } => "fetch",
            IngestError::Parse(_) => "parse",
            IngestError::Embed(_) => "embed",
            IngestError::Index { .. } => "index",
            IngestError::Status(_) => "status",
        }
    }
}

/// Ownership and lookup failures on the record layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The document exists but is not in a state that allows the operation.
    #[error("not ready: {0}")]
    NotReady(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_labels() {
        let e = IngestError::Fetch {
            key: "k".into(),
            reason: "404".into(),
        };
        assert_eq!(e.stage(), "fetch");
        assert_eq!(e.to_string(), "fetch failed for key 'k': 404");
        assert_eq!(IngestError::Parse("bad".into()).stage(), "parse");
    }
}
