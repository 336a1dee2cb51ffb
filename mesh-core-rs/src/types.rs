//! Core types shared across the mesh stack

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a networking node (charging station, relay or CSMS)
pub type NodeId = String;

/// Well-known logical destination naming the central system
pub const CSMS_DESTINATION: &str = "CSMS";

/// Correlation token linking a request to its response or error
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Mint a fresh request id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Machine-readable outcome codes carried by error frames and events
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResultCode {
    /// Request processed and answered
    Ok,
    /// Payload failed schema validation
    CouldNotParse,
    /// Envelope itself could not be constructed or parsed
    FormationViolation,
    /// Signature verification or signing failed
    SignatureError,
    /// No business subscriber produced a result
    Failed,
    /// A business subscriber raised an error
    ExceptionOccurred,
    /// Action is not known to the codec registry
    NotImplemented,
    /// Message could not be routed (unreachable, cycle, misrouted)
    NetworkError,
    /// Outbound request expired without a reply
    TimedOut,
    /// Outbound request cancelled by the caller
    Cancelled,
    ProtocolError,
    GenericError,
    /// Code reported by a remote peer that this node does not know
    Other(String),
}

impl ResultCode {
    pub fn as_str(&self) -> &str {
        match self {
            ResultCode::Ok => "Ok",
            ResultCode::CouldNotParse => "CouldNotParse",
            ResultCode::FormationViolation => "FormationViolation",
            ResultCode::SignatureError => "SignatureError",
            ResultCode::Failed => "Failed",
            ResultCode::ExceptionOccurred => "ExceptionOccurred",
            ResultCode::NotImplemented => "NotImplemented",
            ResultCode::NetworkError => "NetworkError",
            ResultCode::TimedOut => "TimedOut",
            ResultCode::Cancelled => "Cancelled",
            ResultCode::ProtocolError => "ProtocolError",
            ResultCode::GenericError => "GenericError",
            ResultCode::Other(code) => code,
        }
    }
}

impl From<String> for ResultCode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Ok" => ResultCode::Ok,
            "CouldNotParse" => ResultCode::CouldNotParse,
            "FormationViolation" => ResultCode::FormationViolation,
            "SignatureError" => ResultCode::SignatureError,
            "Failed" => ResultCode::Failed,
            "ExceptionOccurred" => ResultCode::ExceptionOccurred,
            "NotImplemented" => ResultCode::NotImplemented,
            "NetworkError" => ResultCode::NetworkError,
            "TimedOut" => ResultCode::TimedOut,
            "Cancelled" => ResultCode::Cancelled,
            "ProtocolError" => ResultCode::ProtocolError,
            "GenericError" => ResultCode::GenericError,
            _ => ResultCode::Other(s),
        }
    }
}

impl From<ResultCode> for String {
    fn from(code: ResultCode) -> Self {
        code.as_str().to_string()
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current wall-clock time, used for envelope timestamps
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_result_code_wire_names() {
        let json = serde_json::to_string(&ResultCode::CouldNotParse).unwrap();
        assert_eq!(json, "\"CouldNotParse\"");

        let parsed: ResultCode = serde_json::from_str("\"SignatureError\"").unwrap();
        assert_eq!(parsed, ResultCode::SignatureError);

        // Unknown remote codes survive the round trip
        let parsed: ResultCode = serde_json::from_str("\"SecurityError\"").unwrap();
        assert_eq!(parsed, ResultCode::Other("SecurityError".to_string()));
        assert_eq!(parsed.to_string(), "SecurityError");
    }
}
