//! Wire types of the hot-reload control plane.

use crate::common;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A reload request as accepted from external build tools.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReloadRequest {
    pub control_name: String,
    pub build_id: String,
    pub trigger: String,
    pub changed_files: Option<Vec<String>>,
}

/// A reload dispatched to connected in-page runtimes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadMessage {
    pub id: String,
    pub control_name: String,
    pub build_id: String,
    pub trigger: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_files: Option<Vec<String>>,
    /// Epoch-ms at enqueue.
    pub timestamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Partial,
    Failed,
}

/// Outcome of a reload attempt as reported by the in-page runtime,
/// or synthesized by the control plane on timeout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadAck {
    pub id: String,
    pub control_name: String,
    pub build_id: String,
    pub status: AckStatus,
    pub instances_total: u64,
    pub instances_reloaded: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Epoch-ms at receipt, always assigned by the server.
    pub timestamp: i64,
}

/// (outgoing) communication messages with the websocket
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundFrame {
    #[serde(rename = "pcf-hmr:reload")]
    Reload(ReloadMessage),
}

/// (incoming) communication messages from the websocket
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum InboundFrame {
    #[serde(rename = "pcf-hmr:ack")]
    Ack(Value),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AckParseError {
    #[error("ACK missing required fields")]
    MissingFields,
    #[error("Invalid ACK status")]
    InvalidStatus,
}

/// Normalize an arbitrary JSON body into a [`ReloadRequest`].
///
/// Anything that is not an object is treated as an empty one; every field
/// falls back to a sensible default, so this conversion never fails.
pub fn to_reload_request(body: &Value, fallback_control: &str) -> ReloadRequest {
    let field = |name: &str| body.as_object().and_then(|map| map.get(name));
    let trimmed = |name: &str| {
        field(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };

    ReloadRequest {
        control_name: trimmed("controlName").unwrap_or_else(|| fallback_control.to_owned()),
        build_id: trimmed("buildId").unwrap_or_else(common::now_rfc3339),
        trigger: trimmed("trigger").unwrap_or_else(|| "manual".to_owned()),
        changed_files: field("changedFiles").and_then(Value::as_array).map(|files| {
            files
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        }),
    }
}

/// Validate an arbitrary JSON body as a [`ReloadAck`].
///
/// The reported timestamp is always replaced with the server clock.
pub fn to_reload_ack(body: &Value) -> Result<ReloadAck, AckParseError> {
    let map = body.as_object().ok_or(AckParseError::MissingFields)?;
    let required = |name: &str| {
        map.get(name)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(AckParseError::MissingFields)
    };
    let number = |name: &str| {
        map.get(name)
            .and_then(Value::as_f64)
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n as u64)
            .unwrap_or(0)
    };

    let status = match map.get("status").and_then(Value::as_str) {
        Some("success") => AckStatus::Success,
        Some("partial") => AckStatus::Partial,
        Some("failed") => AckStatus::Failed,
        _ => return Err(AckParseError::InvalidStatus),
    };

    Ok(ReloadAck {
        id: required("id")?,
        control_name: required("controlName")?,
        build_id: required("buildId")?,
        status,
        instances_total: number("instancesTotal"),
        instances_reloaded: number("instancesReloaded"),
        duration_ms: number("durationMs"),
        error: map.get("error").and_then(Value::as_str).map(str::to_owned),
        timestamp: common::now_epoch_ms(),
    })
}
