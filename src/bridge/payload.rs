// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payload decoding and flattening.

use serde_json::{Number, Value};

/// Decodes a bus payload.
///
/// Payloads starting with `[` or `{` are read as JSON, with single quotes
/// accepted in place of double quotes. `true`, `false` and numbers become
/// the matching JSON value. Anything else, including JSON that fails to
/// parse, stays text. An empty payload decodes to `null`.
#[must_use]
pub fn decode_payload(payload: &str) -> Value {
    let text = payload.trim();
    if text.is_empty() {
        return Value::Null;
    }

    if text.starts_with('[') || text.starts_with('{') {
        return serde_json::from_str(&text.replace('\'', "\""))
            .unwrap_or_else(|_| Value::String(text.to_string()));
    }

    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }

    if let Ok(integer) = text.parse::<i64>() {
        return Value::from(integer);
    }
    if let Some(number) = text.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    Value::String(text.to_string())
}

/// Flattens a value into `(leaf, text)` pairs.
///
/// Nested object keys are joined to `name` with `_`. Arrays and scalars are
/// leaves; strings are published without quotes, everything else as JSON.
pub(crate) fn flatten(name: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(object) => {
            for (key, nested) in object {
                flatten(&format!("{name}_{key}"), nested, out);
            }
        }
        Value::String(text) => out.push((name.to_string(), text.clone())),
        other => out.push((name.to_string(), other.to_string())),
    }
}
