//! Unwrapping of the backend's `{code, msg, obj}` response envelope.

use serde_json::Value;

use super::error::ApiError;

/// Extract the real payload from a backend response.
///
/// - `{"obj": x}` yields `x`; a null `obj` is only accepted with `allow_null`
/// - `{"code": ..}` without `obj` is an error envelope, even when the
///   payload might legitimately carry a top-level `code`
/// - anything else is the payload itself
///
/// `Ok(None)` is only returned when `allow_null` is set.
pub fn extract_payload(response: Value, allow_null: bool) -> Result<Option<Value>, ApiError> {
    match response {
        Value::Null if allow_null => Ok(None),
        Value::Null => Err(ApiError::invalid_response("empty response body")),
        Value::Object(mut map) => {
            if let Some(obj) = map.remove("obj") {
                return match obj {
                    Value::Null if allow_null => Ok(None),
                    Value::Null => Err(ApiError::invalid_response("envelope has a null obj")),
                    payload => Ok(Some(payload)),
                };
            }

            if let Some(code) = map.get("code") {
                let message = map
                    .get("msg")
                    .or_else(|| map.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_string();
                return Err(ApiError::envelope(scalar_to_string(code), message));
            }

            Ok(Some(Value::Object(map)))
        }
        other => Ok(Some(other)),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
