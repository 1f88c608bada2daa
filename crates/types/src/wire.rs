//! Raw wire shapes of the status endpoint and the push channel.
//!
//! These are deliberately loose: every field is optional and the common
//! alternative spellings used by different job kinds are accepted as serde
//! aliases. Turning them into a [`crate::ProgressUpdate`] (and rejecting
//! what cannot be turned) is the client's job.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Frame `type` values on the push channel.
pub mod frame {
    pub const PROGRESS: &str = "progress";
    pub const GENERATION_PROGRESS: &str = "generation_progress";
    pub const EXECUTION_PROGRESS: &str = "execution_progress";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const PONG: &str = "pong";
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Body of `GET /jobs/{id}/status`, also embedded in every push frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../bindings/"))]
pub struct StatusBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "processedCount",
        alias = "processed_count",
        alias = "completed",
        alias = "completed_count",
        alias = "generated_count",
        alias = "current_persona"
    )]
    #[ts(type = "number | null")]
    pub processed: Option<u64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "totalCount",
        alias = "total_count",
        alias = "total_personas",
        alias = "total_respondents"
    )]
    #[ts(type = "number | null")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "seq")]
    #[ts(type = "number | null")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// One JSON frame on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../bindings/"))]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub body: StatusBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl StreamMessage {
    pub fn progress(body: StatusBody) -> Self {
        Self {
            kind: frame::PROGRESS.to_string(),
            body,
            data: None,
        }
    }

    pub fn result(body: StatusBody, data: serde_json::Value) -> Self {
        Self {
            kind: frame::RESULT.to_string(),
            body,
            data: Some(data),
        }
    }

    pub fn error(body: StatusBody, error: impl Into<String>) -> Self {
        Self {
            kind: frame::ERROR.to_string(),
            body: StatusBody {
                error: Some(error.into()),
                ..body
            },
            data: None,
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: frame::PONG.to_string(),
            body: StatusBody::default(),
            data: None,
        }
    }
}

/// Messages the client sends up the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../bindings/"))]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Ping,
}
