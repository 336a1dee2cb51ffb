//! Wire envelopes
//!
//! One JSON object per frame. The variant is recognised by shape:
//!
//! | Keys present                          | Variant         |
//! |---------------------------------------|-----------------|
//! | `action`                              | Request         |
//! | `errorCode` + `destination`           | ResponseError   |
//! | `errorCode`                           | RequestError    |
//! | `payload` (no `action`/`errorCode`)   | Response        |
//!
//! Every variant carries `requestId`. Anything else is a parse failure.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::addressing::{Destination, NetworkPath};
use crate::signature::Signature;
use crate::types::{now, RequestId, ResultCode};

/// Frame classification failures
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no requestId")]
    MissingRequestId,

    #[error("frame {request_id} matches no message kind")]
    Unclassifiable { request_id: RequestId },

    #[error("malformed {kind} frame {request_id}: {reason}")]
    Malformed {
        kind: EnvelopeKind,
        request_id: RequestId,
        network_path: Option<NetworkPath>,
        reason: String,
    },
}

impl FrameError {
    /// Request id of the offending frame, when it could be recovered
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            FrameError::Unclassifiable { request_id } => Some(request_id),
            FrameError::Malformed { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Network path of the offending frame, when it could be recovered
    pub fn network_path(&self) -> Option<&NetworkPath> {
        match self {
            FrameError::Malformed { network_path, .. } => network_path.as_ref(),
            _ => None,
        }
    }
}

/// The four message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Response,
    RequestError,
    ResponseError,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Request frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_id: RequestId,
    pub action: String,
    pub destination: Destination,
    #[serde(default)]
    pub network_path: NetworkPath,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_tracking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<Value>,
}

impl Request {
    pub fn new(
        action: impl Into<String>,
        destination: Destination,
        payload: impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            request_id: RequestId::new(),
            action: action.into(),
            destination,
            network_path: NetworkPath::new(),
            payload: serde_json::to_value(payload)?,
            signatures: Vec::new(),
            timestamp: now(),
            event_tracking_id: None,
            custom_data: None,
        })
    }
}

/// Successful response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: RequestId,
    #[serde(default)]
    pub network_path: NetworkPath,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<Value>,
}

impl Response {
    /// Response to `request`, addressed back along its reversed path
    pub fn for_request(request: &Request, payload: Value) -> Self {
        Self {
            request_id: request.request_id.clone(),
            network_path: request.network_path.reversed(),
            payload,
            signatures: Vec::new(),
            timestamp: now(),
            custom_data: None,
        }
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Error frame, shared by RequestError and ResponseError
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub request_id: RequestId,
    /// Present only on ResponseError frames, which travel toward the responder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    #[serde(default)]
    pub network_path: NetworkPath,
    pub error_code: ResultCode,
    #[serde(default)]
    pub error_description: String,
    #[serde(default = "empty_details")]
    pub error_details: Value,
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<Value>,
}

fn empty_details() -> Value {
    Value::Object(Map::new())
}

impl ErrorFrame {
    /// RequestError answering `request_id`, routed along `reply_path`
    pub fn request_error(
        request_id: RequestId,
        reply_path: NetworkPath,
        error_code: ResultCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            destination: None,
            network_path: reply_path,
            error_code,
            error_description: error_description.into(),
            error_details: empty_details(),
            timestamp: now(),
            custom_data: None,
        }
    }

    /// ResponseError telling the responder its response was rejected
    pub fn response_error(
        request_id: RequestId,
        destination: Destination,
        error_code: ResultCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            destination: Some(destination),
            network_path: NetworkPath::new(),
            error_code,
            error_description: error_description.into(),
            error_details: empty_details(),
            timestamp: now(),
            custom_data: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }
}

/// Parsed frame of any kind
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    RequestError(ErrorFrame),
    ResponseError(ErrorFrame),
}

impl Envelope {
    /// Classify and parse a raw frame
    pub fn classify(bytes: &[u8]) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::classify_value(value)
    }

    pub fn classify_value(value: Value) -> Result<Self, FrameError> {
        let Value::Object(object) = &value else {
            return Err(FrameError::NotAnObject);
        };

        let request_id = match object.get("requestId") {
            Some(Value::String(id)) if !id.is_empty() => RequestId::from(id.as_str()),
            _ => return Err(FrameError::MissingRequestId),
        };

        let has = |key: &str| object.contains_key(key);
        let kind = match (has("action"), has("errorCode")) {
            (true, false) => EnvelopeKind::Request,
            (false, true) if has("destination") => EnvelopeKind::ResponseError,
            (false, true) => EnvelopeKind::RequestError,
            (false, false) if has("payload") => EnvelopeKind::Response,
            _ => return Err(FrameError::Unclassifiable { request_id }),
        };

        let network_path = object
            .get("networkPath")
            .and_then(|p| serde_json::from_value::<NetworkPath>(p.clone()).ok());

        let malformed = |e: serde_json::Error| FrameError::Malformed {
            kind,
            request_id: request_id.clone(),
            network_path: network_path.clone(),
            reason: e.to_string(),
        };

        let envelope = match kind {
            EnvelopeKind::Request => {
                Envelope::Request(serde_json::from_value(value.clone()).map_err(malformed)?)
            }
            EnvelopeKind::Response => {
                Envelope::Response(serde_json::from_value(value.clone()).map_err(malformed)?)
            }
            EnvelopeKind::RequestError => {
                Envelope::RequestError(serde_json::from_value(value.clone()).map_err(malformed)?)
            }
            EnvelopeKind::ResponseError => {
                Envelope::ResponseError(serde_json::from_value(value.clone()).map_err(malformed)?)
            }
        };

        Ok(envelope)
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Request(_) => EnvelopeKind::Request,
            Envelope::Response(_) => EnvelopeKind::Response,
            Envelope::RequestError(_) => EnvelopeKind::RequestError,
            Envelope::ResponseError(_) => EnvelopeKind::ResponseError,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        match self {
            Envelope::Request(r) => &r.request_id,
            Envelope::Response(r) => &r.request_id,
            Envelope::RequestError(e) | Envelope::ResponseError(e) => &e.request_id,
        }
    }

    pub fn network_path(&self) -> &NetworkPath {
        match self {
            Envelope::Request(r) => &r.network_path,
            Envelope::Response(r) => &r.network_path,
            Envelope::RequestError(e) | Envelope::ResponseError(e) => &e.network_path,
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Envelope::Request(r) => serde_json::to_vec(r),
            Envelope::Response(r) => serde_json::to_vec(r),
            Envelope::RequestError(e) | Envelope::ResponseError(e) => serde_json::to_vec(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_classification() {
        let json = r#"{
            "requestId": "req-1",
            "action": "Ping",
            "destination": "CSMS",
            "networkPath": ["A"],
            "payload": {}
        }"#;

        match Envelope::classify(json.as_bytes()).unwrap() {
            Envelope::Request(req) => {
                assert_eq!(req.request_id.as_str(), "req-1");
                assert_eq!(req.action, "Ping");
                assert_eq!(req.destination, Destination::Csms);
                assert_eq!(req.network_path, NetworkPath::from(vec!["A"]));
                assert!(req.signatures.is_empty());
            }
            other => panic!("Expected Request, got {:?}", other),
        }
    }

    #[test]
    fn test_response_classification() {
        let json = r#"{"requestId": "req-1", "networkPath": ["B", "A"], "payload": {"status": "Accepted"}}"#;
        let env = Envelope::classify(json.as_bytes()).unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Response);
        assert_eq!(env.network_path(), &NetworkPath::from(vec!["B", "A"]));
    }

    #[test]
    fn test_error_classification() {
        let request_error = r#"{"requestId": "r", "errorCode": "Failed", "errorDescription": "nope"}"#;
        match Envelope::classify(request_error.as_bytes()).unwrap() {
            Envelope::RequestError(e) => {
                assert_eq!(e.error_code, ResultCode::Failed);
                assert_eq!(e.error_details, json!({}));
            }
            other => panic!("Expected RequestError, got {:?}", other),
        }

        let response_error =
            r#"{"requestId": "r", "destination": "CS1", "errorCode": "SignatureError"}"#;
        let env = Envelope::classify(response_error.as_bytes()).unwrap();
        assert_eq!(env.kind(), EnvelopeKind::ResponseError);
    }

    #[test]
    fn test_unclassifiable_frames() {
        assert!(matches!(
            Envelope::classify(b"[2, \"x\", \"Ping\", {}]"),
            Err(FrameError::NotAnObject)
        ));
        assert!(matches!(
            Envelope::classify(br#"{"action": "Ping", "payload": {}}"#),
            Err(FrameError::MissingRequestId)
        ));

        let err = Envelope::classify(br#"{"requestId": "r", "customData": {}}"#).unwrap_err();
        assert_eq!(err.request_id().map(|id| id.as_str()), Some("r"));

        // action and errorCode together are ambiguous
        let err = Envelope::classify(
            br#"{"requestId": "r", "action": "Ping", "errorCode": "Failed"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, FrameError::Unclassifiable { .. }));
    }

    #[test]
    fn test_malformed_request_keeps_request_id_and_path() {
        // destination is missing
        let err = Envelope::classify(
            br#"{"requestId": "r-9", "action": "Ping", "networkPath": ["A", "B"], "payload": {}}"#,
        )
        .unwrap_err();

        assert_eq!(err.request_id().map(|id| id.as_str()), Some("r-9"));
        assert_eq!(err.network_path(), Some(&NetworkPath::from(vec!["A", "B"])));
    }

    #[test]
    fn test_custom_data_passthrough() {
        let json = r#"{"requestId": "r", "payload": {}, "customData": {"vendorId": "EK"}}"#;
        let env = Envelope::classify(json.as_bytes()).unwrap();
        let bytes = env.to_bytes().unwrap();
        let reparsed = Envelope::classify(&bytes).unwrap();

        match reparsed {
            Envelope::Response(r) => assert_eq!(r.custom_data, Some(json!({"vendorId": "EK"}))),
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_response_for_request_reverses_path() {
        let mut req = Request::new("Ping", Destination::Csms, json!({})).unwrap();
        req.network_path = NetworkPath::from(vec!["A", "B"]);

        let resp = Response::for_request(&req, json!({"status": "Accepted"}));
        assert_eq!(resp.request_id, req.request_id);
        assert_eq!(resp.network_path, NetworkPath::from(vec!["B", "A"]));
    }
}
