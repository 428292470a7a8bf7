//! Wire types for the IPC protocol (one JSON object per line, per §6 of the
//! specification). Field names are already snake_case on the wire, so no
//! `rename_all` is needed.

use serde::Deserialize;
use serde::Serialize;

pub const DEFAULT_MAX_CANDIDATES: u32 = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub request_id: u64,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub cursor_pos: i64,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub max_candidates: Option<i64>,
}

impl Request {
    /// Effective candidate cap: non-positive or absent falls back to the
    /// default of 4.
    pub fn effective_max_candidates(&self) -> usize {
        match self.max_candidates {
            Some(n) if n > 0 => n as usize,
            _ => DEFAULT_MAX_CANDIDATES as usize,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Candidate {
    pub completion: String,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_pos: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub request_id: u64,
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn empty(request_id: u64) -> Self {
        Response {
            request_id,
            candidates: Vec::new(),
            error: None,
        }
    }

    pub fn error(request_id: u64, code: crate::error::ClientErrorCode, message: impl Into<String>) -> Self {
        Response {
            request_id,
            candidates: Vec::new(),
            error: Some(ErrorBody {
                code: code.as_str().to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigRequest {
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ConfigReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}
