//! Codec registry
//!
//! Maps action names to payload parsers. Concrete schemas implement
//! [`ActionCodec`]; plain serde data types get parse and serialize for free,
//! schemas with structural rules override [`ActionCodec::try_parse`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::addressing::{Destination, NetworkPath};
use crate::envelope::Request;
use crate::types::{NodeId, RequestId};

/// Everything about a request except its payload
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub action: String,
    pub destination: Destination,
    pub network_path: NetworkPath,
    pub timestamp: DateTime<Utc>,
    pub event_tracking_id: Option<String>,
    /// Neighbor whose link delivered the request
    pub received_from: NodeId,
}

impl RequestContext {
    pub fn received(request: &Request, from: impl Into<NodeId>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            action: request.action.clone(),
            destination: request.destination.clone(),
            network_path: request.network_path.clone(),
            timestamp: request.timestamp,
            event_tracking_id: request.event_tracking_id.clone(),
            received_from: from.into(),
        }
    }
}

/// Context of a request that arrived over the link named by its last hop
impl From<&Request> for RequestContext {
    fn from(request: &Request) -> Self {
        let from = request.network_path.last_hop().cloned().unwrap_or_default();
        Self::received(request, from)
    }
}

/// Parse/serialize contract of one concrete message schema
pub trait ActionCodec: Send + Sync + 'static {
    /// Wire action name
    const ACTION: &'static str;

    type Request: DeserializeOwned + Send + Sync + 'static;
    type Response: Serialize + Send + 'static;

    /// Parse and validate a request payload
    fn try_parse(payload: &Value, _ctx: &RequestContext) -> Result<Self::Request, String> {
        if !payload.is_object() {
            return Err(format!("payload must be a JSON object, got {}", json_type(payload)));
        }
        serde_json::from_value(payload.clone()).map_err(|e| e.to_string())
    }

    fn to_json(response: &Self::Response) -> Result<Value, serde_json::Error> {
        serde_json::to_value(response)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parsed request with its concrete type erased
pub type TypedRequest = Arc<dyn Any + Send + Sync>;

type ParseFn = dyn Fn(&Value, &RequestContext) -> Result<TypedRequest, String> + Send + Sync;

/// Registered schema
pub struct CodecEntry {
    action: &'static str,
    parse: Box<ParseFn>,
}

impl CodecEntry {
    fn of<C: ActionCodec>() -> Self {
        Self {
            action: C::ACTION,
            parse: Box::new(|payload, ctx| {
                C::try_parse(payload, ctx).map(|req| Arc::new(req) as TypedRequest)
            }),
        }
    }

    pub fn action(&self) -> &'static str {
        self.action
    }

    pub fn try_parse(&self, payload: &Value, ctx: &RequestContext) -> Result<TypedRequest, String> {
        (self.parse)(payload, ctx)
    }
}

/// Action name -> schema
#[derive(Default)]
pub struct CodecRegistry {
    entries: RwLock<HashMap<String, Arc<CodecEntry>>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema; re-registering an action replaces the entry
    pub fn register<C: ActionCodec>(&self) {
        self.entries
            .write()
            .insert(C::ACTION.to_string(), Arc::new(CodecEntry::of::<C>()));
    }

    /// Register a schema unless the action is already known
    pub fn ensure<C: ActionCodec>(&self) {
        let mut entries = self.entries.write();
        if !entries.contains_key(C::ACTION) {
            entries.insert(C::ACTION.to_string(), Arc::new(CodecEntry::of::<C>()));
        }
    }

    pub fn get(&self, action: &str) -> Option<Arc<CodecEntry>> {
        self.entries.read().get(action).cloned()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.entries.read().contains_key(action)
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.entries.read().keys().cloned().collect();
        actions.sort();
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct SetLimit {
        evse_id: i32,
        limit_kw: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    }

    struct SetLimitAction;

    impl ActionCodec for SetLimitAction {
        const ACTION: &'static str = "SetLimit";
        type Request = SetLimit;
        type Response = SetLimit;

        fn try_parse(payload: &Value, _ctx: &RequestContext) -> Result<SetLimit, String> {
            let req: SetLimit = serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
            if req.limit_kw < 0.0 {
                return Err("limitKw must not be negative".to_string());
            }
            Ok(req)
        }
    }

    fn ctx() -> RequestContext {
        let req = Request::new("SetLimit", Destination::node("CS1"), json!({})).unwrap();
        RequestContext::from(&req)
    }

    #[test]
    fn test_round_trip_preserves_declared_fields() {
        let json = json!({"evseId": 1, "limitKw": 11.5, "note": "night tariff"});
        let parsed = SetLimitAction::try_parse(&json, &ctx()).unwrap();
        assert_eq!(SetLimitAction::to_json(&parsed).unwrap(), json);
    }

    #[test]
    fn test_structural_validation() {
        let err = SetLimitAction::try_parse(&json!({"evseId": 1, "limitKw": -1.0}), &ctx()).unwrap_err();
        assert!(err.contains("negative"));
    }

    #[test]
    fn test_registry_lookup_and_downcast() {
        let registry = CodecRegistry::new();
        registry.register::<SetLimitAction>();

        assert!(registry.contains("SetLimit"));
        assert!(registry.get("Unknown").is_none());
        assert_eq!(registry.actions(), vec!["SetLimit".to_string()]);

        let entry = registry.get("SetLimit").unwrap();
        let typed = entry.try_parse(&json!({"evseId": 2, "limitKw": 7.0}), &ctx()).unwrap();
        let req = typed.downcast::<SetLimit>().unwrap();
        assert_eq!(req.evse_id, 2);
    }

    proptest! {
        /// ToJSON(Parse(json)) gives back every declared field
        #[test]
        fn prop_round_trip_set_limit(
            evse_id in any::<i32>(),
            limit_kw in 0.0f64..1.0e6,
            note in proptest::option::of("[ -~]{0,24}"),
        ) {
            let mut json = json!({"evseId": evse_id, "limitKw": limit_kw});
            if let Some(note) = &note {
                json["note"] = json!(note);
            }

            let parsed = SetLimitAction::try_parse(&json, &ctx()).unwrap();
            prop_assert_eq!(SetLimitAction::to_json(&parsed).unwrap(), json);
        }
    }
}
