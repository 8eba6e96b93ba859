//! Frame types exchanged over the bridge.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::PROTOCOL_VERSION;
use crate::error::ProtocolError;

/// Versioned wrapper around every frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: String,
    pub frame: Frame,
}

impl Envelope {
    pub fn new(frame: Frame) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            frame,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}

/// One unit of bridge traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// UI → worker call.
    Request(RequestFrame),
    /// Worker → UI answer to a request with the same id.
    Response(ResponseFrame),
    /// Worker → UI fire-and-forget event.
    Broadcast(BroadcastFrame),
    /// Worker → UI announcement of the currently registered services.
    Ready { services: Vec<String> },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Broadcast(_) => "broadcast",
            Self::Ready { .. } => "ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RequestFrame {
    pub fn new(
        id: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            method: method.into(),
            args,
        }
    }
}

/// Settled state of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Outcome {
    Fulfilled { value: Value },
    Rejected { reason: ErrorResponse },
}

impl Outcome {
    pub fn into_result(self) -> Result<Value, ErrorResponse> {
        match self {
            Self::Fulfilled { value } => Ok(value),
            Self::Rejected { reason } => Err(reason),
        }
    }
}

impl From<Result<Value, ErrorResponse>> for Outcome {
    fn from(result: Result<Value, ErrorResponse>) -> Self {
        match result {
            Ok(value) => Self::Fulfilled { value },
            Err(reason) => Self::Rejected { reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub outcome: Outcome,
}

impl ResponseFrame {
    pub fn fulfilled(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Fulfilled { value },
        }
    }

    pub fn rejected(id: impl Into<String>, reason: ErrorResponse) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Rejected { reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastFrame {
    pub event: EventName,
    #[serde(default)]
    pub payload: Value,
}

impl BroadcastFrame {
    pub fn new(event: EventName, payload: Value) -> Self {
        Self { event, payload }
    }
}

/// The closed vocabulary of broadcast events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventName {
    SyncStart,
    SyncProgress,
    SyncComplete,
    SyncError,
    SyncOffline,
    ExpandStart,
    ExpandComplete,
}

impl EventName {
    pub const ALL: [EventName; 7] = [
        Self::SyncStart,
        Self::SyncProgress,
        Self::SyncComplete,
        Self::SyncError,
        Self::SyncOffline,
        Self::ExpandStart,
        Self::ExpandComplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncStart => "syncStart",
            Self::SyncProgress => "syncProgress",
            Self::SyncComplete => "syncComplete",
            Self::SyncError => "syncError",
            Self::SyncOffline => "syncOffline",
            Self::ExpandStart => "expandStart",
            Self::ExpandComplete => "expandComplete",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownEvent(s.to_string()))
    }
}

/// Error codes carried by rejected responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InternalError,
    InvalidRequest,
    /// No service registered under the requested name.
    UnknownService,
    /// The service exists but has no such method.
    MethodNotFound,
    NotFound,
    Timeout,
    Authentication,
    InvalidServer,
    ServerFailure,
    Offline,
    /// The backend does not allow the operation.
    PermissionDenied,
    ShuttingDown,
}

impl ErrorCode {
    pub fn description(&self) -> &'static str {
        match self {
            Self::InternalError => "An internal error occurred",
            Self::InvalidRequest => "The request was invalid",
            Self::UnknownService => "No such service",
            Self::MethodNotFound => "No such method",
            Self::NotFound => "Requested record not found",
            Self::Timeout => "The request timed out",
            Self::Authentication => "Authentication failed",
            Self::InvalidServer => "The server is not a valid calendar server",
            Self::ServerFailure => "The calendar server failed",
            Self::Offline => "The device is offline",
            Self::PermissionDenied => "Operation not permitted for this calendar",
            Self::ShuttingDown => "Worker is shutting down",
        }
    }
}

/// Rejection reason of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// Structured diagnostic context.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: Value::Null,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

impl std::error::Error for ErrorResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_json_shape() {
        let envelope = Envelope::new(Frame::Request(RequestFrame::new(
            "req-1",
            "calendar",
            "getAccount",
            vec![json!("work")],
        )));
        insta::assert_json_snapshot!(envelope, @r#"
        {
          "protocol_version": "1",
          "frame": {
            "type": "request",
            "id": "req-1",
            "service": "calendar",
            "method": "getAccount",
            "args": [
              "work"
            ]
          }
        }
        "#);
    }

    #[test]
    fn rejected_response_json_shape() {
        let frame = Frame::Response(ResponseFrame::rejected(
            "req-2",
            ErrorResponse::new(ErrorCode::UnknownService, "no service named caldav"),
        ));
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "response",
          "id": "req-2",
          "outcome": {
            "state": "rejected",
            "reason": {
              "code": "unknown_service",
              "message": "no service named caldav"
            }
          }
        }
        "#);
    }

    #[test]
    fn missing_args_default_to_empty() {
        let frame: Frame = serde_json::from_str(
            r#"{"type":"request","id":"1","service":"calendar","method":"listAccounts"}"#,
        )
        .unwrap();
        match frame {
            Frame::Request(request) => assert!(request.args.is_empty()),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn broadcast_uses_camel_case_names() {
        let frame = Frame::Broadcast(BroadcastFrame::new(
            EventName::SyncOffline,
            json!({"account_id": "work"}),
        ));
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""event":"syncOffline""#));
    }

    #[test]
    fn unknown_event_on_the_wire_fails_to_decode() {
        let result: Result<Frame, _> =
            serde_json::from_str(r#"{"type":"broadcast","event":"syncBogus","payload":null}"#);
        assert!(result.is_err());
    }

    #[test]
    fn event_names_parse() {
        for event in EventName::ALL {
            assert_eq!(event.as_str().parse::<EventName>().unwrap(), event);
            let json = serde_json::to_string(&event).unwrap();
            assert_eq!(json, format!("\"{}\"", event.as_str()));
        }
        assert!(matches!(
            "synccomplete".parse::<EventName>(),
            Err(ProtocolError::UnknownEvent(name)) if name == "synccomplete"
        ));
    }

    #[test]
    fn outcome_converts_to_result() {
        let ok = Outcome::from(Ok(json!(3)));
        assert_eq!(ok.into_result().unwrap(), json!(3));

        let err = Outcome::from(Err(ErrorResponse::not_found("evt-9")));
        assert_eq!(err.into_result().unwrap_err().code, ErrorCode::NotFound);
    }

    #[test]
    fn error_detail_round_trips() {
        let error = ErrorResponse::new(ErrorCode::Authentication, "bad password")
            .with_detail(json!({"status": 401}));
        let json = serde_json::to_string(&error).unwrap();
        let parsed: ErrorResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.detail["status"], 401);
        assert!(error.to_string().contains("bad password"));
    }

    #[test]
    fn incompatible_version_is_detected() {
        let mut envelope = Envelope::new(Frame::Ready { services: vec![] });
        assert!(envelope.is_compatible());
        envelope.protocol_version = "2".to_string();
        assert!(!envelope.is_compatible());
    }
}
