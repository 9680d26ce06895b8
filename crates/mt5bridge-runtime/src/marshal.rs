//! Request/response marshaling through the runtime's own JSON codec.
//!
//! Requests go out as compact text and are decoded by the runtime; results are
//! encoded by the runtime and parsed back here. Numbers and strings therefore
//! take exactly the shape the runtime itself would give them.

use serde_json::Value;

use crate::error::BridgeError;
use crate::runtime::RuntimeSession;

pub fn marshal_in<'s, S: RuntimeSession>(
    session: &'s S,
    request: &Value,
) -> Result<S::Object<'s>, BridgeError> {
    let text = serde_json::to_string(request)
        .map_err(|e| BridgeError::Marshaling(format!("failed to serialize request: {e}")))?;
    session
        .loads(&text)
        .map_err(|fault| BridgeError::Marshaling(fault.describe_or("failed to decode request")))
}

pub fn marshal_out<'s, S: RuntimeSession>(
    session: &'s S,
    result: &S::Object<'s>,
) -> Result<Value, BridgeError> {
    let text = session
        .dumps(result)
        .map_err(|fault| BridgeError::Marshaling(fault.describe_or("failed to encode result")))?;
    serde_json::from_str(&text)
        .map_err(|e| BridgeError::Marshaling(format!("runtime produced malformed JSON: {e}")))
}
