//! Logical request/response types
//!
//! The inbound surface (HTTP parsing, auth) lives outside the control
//! plane; these structs are what reaches the orchestrator after that
//! layer is done.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// One inbound search request as seen by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub request_id: Uuid,
    /// Stable id for experiment assignment; absent for anonymous traffic.
    pub participant_id: Option<String>,
    /// Session key for node affinity.
    pub session_id: Option<String>,
    pub request_type: String,
    pub data_size_bytes: Option<u64>,
    pub vector_count: Option<usize>,
    /// Caller-provided dispatch deadline.
    pub deadline: Option<Duration>,
    pub payload: Value,
}

impl SearchRequest {
    pub fn new(request_type: &str, payload: Value) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            participant_id: None,
            session_id: None,
            request_type: request_type.to_string(),
            data_size_bytes: None,
            vector_count: None,
            deadline: None,
            payload,
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_participant(mut self, participant_id: &str) -> Self {
        self.participant_id = Some(participant_id.to_string());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_data_size(mut self, bytes: u64) -> Self {
        self.data_size_bytes = Some(bytes);
        self
    }
}

/// Completed backend call with dispatch accounting attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResponse {
    pub node_id: String,
    pub latency_ms: f64,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_fields() {
        let req = SearchRequest::new("vector_search", serde_json::json!({"k": 10}))
            .with_session("sess-1")
            .with_participant("user-42")
            .with_data_size(2048);
        assert_eq!(req.session_id.as_deref(), Some("sess-1"));
        assert_eq!(req.participant_id.as_deref(), Some("user-42"));
        assert_eq!(req.data_size_bytes, Some(2048));
        assert!(req.deadline.is_none());
    }
}
