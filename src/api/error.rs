use serde::de::DeserializeOwned;
use serde_json::Value;

const CODE_RUN_IN_PROGRESS: &str = "run_in_progress";
const CODE_COOLDOWN_ACTIVE: &str = "scrape_cooldown_active";

/// Failure of a call against the runs backend, decoded once at the boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum ApiError {
    /// Another run is already in progress for this account.
    #[error("{message}")]
    Conflict {
        run_id: Option<u64>,
        message: String,
        request_id: Option<String>,
    },
    /// The safety cooldown blocks new runs. `safety_state` is the raw payload.
    #[error("{message}")]
    Cooldown {
        safety_state: Value,
        message: String,
        request_id: Option<String>,
    },
    /// Any other structured rejection from the server.
    #[error("{message} (HTTP {status}, {code})")]
    Validation {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },
    /// The request never produced a usable response.
    #[error("{message}")]
    Transport { message: String },
}

impl ApiError {
    pub fn transport(message: impl Into<String>) -> Self {
        ApiError::Transport {
            message: message.into(),
        }
    }

    /// Message suitable for `last_error_message`.
    pub fn message(&self) -> &str {
        match self {
            ApiError::Conflict { message, .. }
            | ApiError::Cooldown { message, .. }
            | ApiError::Validation { message, .. }
            | ApiError::Transport { message } => message,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            ApiError::Conflict { request_id, .. }
            | ApiError::Cooldown { request_id, .. }
            | ApiError::Validation { request_id, .. } => request_id.as_deref(),
            ApiError::Transport { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Conflict { .. } => Some(409),
            ApiError::Cooldown { .. } => Some(429),
            ApiError::Validation { status, .. } => Some(*status),
            ApiError::Transport { .. } => None,
        }
    }

    /// Machine-readable code, for display and correlation only.
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Conflict { .. } => Some(CODE_RUN_IN_PROGRESS),
            ApiError::Cooldown { .. } => Some(CODE_COOLDOWN_ACTIVE),
            ApiError::Validation { code, .. } => Some(code),
            ApiError::Transport { .. } => None,
        }
    }

    /// Decode a non-2xx response body.
    pub fn from_error_body(status: u16, body: Option<&Value>, request_id: Option<String>) -> Self {
        let error = body.and_then(|v| v.get("error"));
        let code = error
            .and_then(|e| e.get("code"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let message = error
            .and_then(|e| e.get("message"))
            .or_else(|| body.and_then(|v| v.get("detail")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Request failed with HTTP {status}."));
        let details = error.and_then(|e| e.get("details"));

        match (code, status) {
            (Some(CODE_RUN_IN_PROGRESS), _) | (None, 409) => ApiError::Conflict {
                run_id: details.and_then(|d| d.get("run_id")).and_then(as_id),
                message,
                request_id,
            },
            (Some(CODE_COOLDOWN_ACTIVE), _) => ApiError::Cooldown {
                safety_state: details
                    .and_then(|d| d.get("safety_state"))
                    .cloned()
                    .unwrap_or(Value::Null),
                message,
                request_id,
            },
            (code, status) => ApiError::Validation {
                status,
                code: code.unwrap_or("http_error").to_string(),
                message,
                request_id,
            },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            "timed out"
        } else if e.is_connect() {
            "connection failed"
        } else {
            "failed"
        };
        ApiError::transport(format!("Request {kind}: {e}"))
    }
}

/// Decode a `{"data": .., "meta": {"request_id": ..}}` response envelope.
///
/// Bodies without a `data` key are decoded as the payload itself.
pub(crate) fn decode_envelope<T: DeserializeOwned>(
    status: u16,
    header_request_id: Option<String>,
    body: &[u8],
) -> Result<T, ApiError> {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let request_id = parsed
        .as_ref()
        .and_then(|v| v.pointer("/meta/request_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(header_request_id);

    if !(200..300).contains(&status) {
        return Err(ApiError::from_error_body(status, parsed.as_ref(), request_id));
    }

    let Some(mut value) = parsed else {
        return Err(ApiError::transport("Response body is not valid JSON."));
    };
    let data = if value.get("data").is_some() {
        value["data"].take()
    } else {
        value
    };
    serde_json::from_value(data)
        .map_err(|e| ApiError::transport(format!("Unexpected response shape: {e}")))
}

fn as_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ManualRunResult, RunListing, RunStatus};
    use serde_json::json;

    fn body(v: Value) -> Vec<u8> {
        serde_json::to_vec(&v).unwrap()
    }

    #[test]
    fn run_in_progress_becomes_conflict_with_request_id() {
        let raw = body(json!({
            "error": {
                "code": "run_in_progress",
                "message": "A run is already in progress for this account.",
                "details": {"run_id": 42}
            },
            "meta": {"request_id": "req_123"}
        }));
        let err = decode_envelope::<ManualRunResult>(409, None, &raw).unwrap_err();
        match err {
            ApiError::Conflict {
                run_id, request_id, ..
            } => {
                assert_eq!(run_id, Some(42));
                assert_eq!(request_id.as_deref(), Some("req_123"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cooldown_carries_embedded_safety_state() {
        let raw = body(json!({
            "error": {
                "code": "scrape_cooldown_active",
                "message": "Scrape safety cooldown is active; run start is temporarily blocked.",
                "details": {
                    "safety_state": {"cooldown_active": true, "cooldown_remaining_seconds": 600}
                }
            }
        }));
        let err = decode_envelope::<ManualRunResult>(429, Some("hdr_1".into()), &raw).unwrap_err();
        assert_eq!(err.request_id(), Some("hdr_1"));
        match err {
            ApiError::Cooldown { safety_state, .. } => {
                assert_eq!(safety_state["cooldown_remaining_seconds"], json!(600));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn other_codes_are_validation_errors() {
        let raw = body(json!({
            "error": {"code": "manual_runs_disabled", "message": "Manual runs are disabled."}
        }));
        let err = decode_envelope::<RunListing>(403, None, &raw).unwrap_err();
        assert_eq!(err.status(), Some(403));
        assert_eq!(err.code(), Some("manual_runs_disabled"));
        assert_eq!(err.message(), "Manual runs are disabled.");
    }

    #[test]
    fn non_json_error_body_still_gets_a_message() {
        let err =
            decode_envelope::<RunListing>(502, None, b"<html>bad gateway</html>").unwrap_err();
        assert_eq!(err.code(), Some("http_error"));
        assert_eq!(err.message(), "Request failed with HTTP 502.");

        let detail = body(json!({"detail": "Authentication required."}));
        let err = decode_envelope::<RunListing>(401, None, &detail).unwrap_err();
        assert_eq!(err.message(), "Authentication required.");
    }

    #[test]
    fn bare_409_is_a_conflict() {
        let err = decode_envelope::<ManualRunResult>(409, None, b"").unwrap_err();
        assert!(matches!(err, ApiError::Conflict { run_id: None, .. }));
    }

    #[test]
    fn success_unwraps_data() {
        let raw = body(json!({
            "data": {
                "runs": [{
                    "id": 7,
                    "trigger_type": "scheduled",
                    "status": "running",
                    "start_dt": "2026-02-19T12:00:00Z",
                    "end_dt": null
                }],
                "safety_state": {"cooldown_active": false}
            },
            "meta": {"request_id": "abc"}
        }));
        let listing: RunListing = decode_envelope(200, None, &raw).unwrap();
        assert_eq!(listing.runs.len(), 1);
        assert_eq!(listing.runs[0].status, RunStatus::Running);
    }

    #[test]
    fn success_with_wrong_shape_is_transport_error() {
        let raw = body(json!({"data": {"runs": "nope"}}));
        let err = decode_envelope::<RunListing>(200, None, &raw).unwrap_err();
        assert!(matches!(err, ApiError::Transport { .. }));
    }
}
