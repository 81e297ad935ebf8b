//! Conversions between JavaScript values and engine types.

use idbscope_engine::{EngineError, EngineResult, StoreRequest};
use js_sys::Array;
use serde::Serialize;
use serde_json::Value;
use wasm_bindgen::{JsCast, JsValue};
use web_sys::DomException;

/// Maps a thrown value or a request's `error` to an engine error.
pub(crate) fn engine_error(value: &JsValue) -> EngineError {
    match value.dyn_ref::<DomException>() {
        Some(exception) => dom_error(&exception.name(), &exception.message()),
        None => EngineError::Unknown(value.as_string().unwrap_or_else(|| format!("{value:?}"))),
    }
}

/// Maps a DOMException by name.
pub(crate) fn dom_error(name: &str, message: &str) -> EngineError {
    let message = message.to_string();
    match name {
        "VersionError" => version_error(&message),
        "InvalidStateError" => EngineError::InvalidState(message),
        "NotFoundError" => EngineError::NotFound(message),
        "ConstraintError" => EngineError::Constraint(message),
        "TransactionInactiveError" => EngineError::TransactionInactive(message),
        "DataError" | "DataCloneError" => EngineError::Data(message),
        "AbortError" => EngineError::Abort(message),
        _ => EngineError::Unknown(format!("{name}: {message}")),
    }
}

/// Browsers word this differently; only the first two numbers are trusted.
fn version_error(message: &str) -> EngineError {
    let mut numbers = message
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|part| part.parse::<u64>().ok());
    match (numbers.next(), numbers.next()) {
        (Some(requested), Some(existing)) if existing > requested => EngineError::Version {
            requested,
            existing,
        },
        _ => EngineError::Unknown(format!("VersionError: {message}")),
    }
}

/// Reason carried by a failed request or transaction.
pub(crate) fn reason(error: Option<DomException>) -> String {
    error.map_or_else(
        || "AbortError".to_string(),
        |exception| format!("{}: {}", exception.name(), exception.message()),
    )
}

/// Which result shape a store request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Put,
    Get,
    GetAllKeys,
    Delete,
    Clear,
}

impl RequestKind {
    pub(crate) fn of(request: &StoreRequest) -> Self {
        match request {
            StoreRequest::Put(_) => Self::Put,
            StoreRequest::Get(_) => Self::Get,
            StoreRequest::GetAllKeys => Self::GetAllKeys,
            StoreRequest::Delete(_) => Self::Delete,
            StoreRequest::Clear => Self::Clear,
        }
    }
}

/// Converts a JSON value into a plain JavaScript object.
pub(crate) fn to_js(value: &Value) -> EngineResult<JsValue> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(|e| EngineError::data(e.to_string()))
}

/// Converts a stored value back to JSON; `undefined` means absent.
pub(crate) fn from_js(value: JsValue) -> EngineResult<Option<Value>> {
    if value.is_undefined() {
        return Ok(None);
    }
    serde_wasm_bindgen::from_value(value)
        .map(Some)
        .map_err(|e| EngineError::data(e.to_string()))
}

/// Converts a `getAllKeys` result.
pub(crate) fn keys_from_js(value: &JsValue) -> EngineResult<Vec<String>> {
    if !Array::is_array(value) {
        return Err(EngineError::data("getAllKeys did not return an array"));
    }
    Array::from(value)
        .iter()
        .map(|key| {
            key.as_string()
                .ok_or_else(|| EngineError::data(format!("non-string key {key:?}")))
        })
        .collect()
}
