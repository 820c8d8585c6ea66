//! Wire dialects spoken by the adapters.
//!
//! Each submodule owns one vendor format: the request envelope it expects and
//! the translation of its responses and stream events into the canonical shape.
//! Everything here is pure (no I/O); the adapters do the transport.

pub mod claude;
pub mod openai;
pub mod qwen;
pub mod streaming;

use serde_json::{Map, Value};

use crate::canonical::Params;
use crate::normalize::EXTRA_PARAMS_FIELD;

/// Flatten normalized params into a wire body fragment.
///
/// Entries of the nested extra field are merged in last and never replace a key
/// that is already present.
pub fn flatten_params(params: &Params) -> Map<String, Value> {
    let mut out: Map<String, Value> = params
        .iter()
        .filter(|(key, _)| key.as_str() != EXTRA_PARAMS_FIELD)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    match params.get(EXTRA_PARAMS_FIELD) {
        Some(Value::Object(extra)) => {
            for (key, value) in extra {
                out.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Some(other) => {
            tracing::debug!(value = %other, "ignoring non-object extra params");
        }
        None => {}
    }

    out
}

/// Fallback response id for vendors that do not return one.
pub(crate) fn generated_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}
