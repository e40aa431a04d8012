// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device parameter names.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Number, Value};

use crate::error::ValidationError;

/// Which parameters a device has and how they are named on the bus.
///
/// `settings` are writable and map a device key to its external alias;
/// `other_params` are read only. Keys in the numeric set are coerced to
/// numbers before they are sent.
///
/// Each device actor owns its own descriptor, so keys registered from one
/// device's notifications never show up on another device.
///
/// # Examples
///
/// ```
/// use ewegate::device::ParameterDescriptor;
///
/// let descriptor = ParameterDescriptor::new()
///     .with_setting("channel2", "red")
///     .with_setting("zyx_mode", "mode")
///     .with_numeric("zyx_mode");
///
/// assert_eq!(descriptor.resolve("red"), Some("channel2"));
/// assert_eq!(descriptor.resolve("channel2"), Some("channel2"));
/// assert_eq!(descriptor.alias_for("zyx_mode"), "mode");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterDescriptor {
    settings: BTreeMap<String, String>,
    other_params: BTreeMap<String, String>,
    numeric: BTreeSet<String>,
}

impl ParameterDescriptor {
    /// Creates an empty descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a writable parameter.
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, alias: impl Into<String>) -> Self {
        self.settings.insert(key.into(), alias.into());
        self
    }

    /// Adds writable parameters whose alias is their key.
    #[must_use]
    pub fn with_settings(mut self, keys: &[&str]) -> Self {
        for key in keys {
            self.settings.insert((*key).to_string(), (*key).to_string());
        }
        self
    }

    /// Adds read-only parameters whose alias is their key.
    #[must_use]
    pub fn with_read_only(mut self, keys: &[&str]) -> Self {
        for key in keys {
            self.other_params
                .insert((*key).to_string(), (*key).to_string());
        }
        self
    }

    /// Marks a parameter as numeric.
    #[must_use]
    pub fn with_numeric(mut self, key: impl Into<String>) -> Self {
        self.numeric.insert(key.into());
        self
    }

    /// Resolves a name, given as device key or alias, to a writable key.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&str> {
        if let Some((key, _)) = self.settings.get_key_value(name) {
            return Some(key);
        }
        self.settings
            .iter()
            .find(|(_, alias)| alias.as_str() == name)
            .map(|(key, _)| key.as_str())
    }

    /// Returns the external name of a device key.
    #[must_use]
    pub fn alias_for<'a>(&'a self, key: &'a str) -> &'a str {
        self.settings
            .get(key)
            .or_else(|| self.other_params.get(key))
            .map_or(key, String::as_str)
    }

    /// Returns whether a device key is known.
    #[must_use]
    pub fn knows(&self, key: &str) -> bool {
        self.settings.contains_key(key) || self.other_params.contains_key(key)
    }

    /// Returns the writable keys and their aliases.
    pub fn settings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.settings
            .iter()
            .map(|(key, alias)| (key.as_str(), alias.as_str()))
    }

    /// Registers every unknown key in `params` as a writable setting.
    ///
    /// Returns the keys that were added.
    pub fn register_unseen(&mut self, params: &Map<String, Value>) -> Vec<String> {
        let unseen: Vec<String> = params
            .keys()
            .filter(|key| !self.knows(key))
            .cloned()
            .collect();
        for key in &unseen {
            tracing::debug!(param = %key, "Adding parameter to settings");
            self.settings.insert(key.clone(), key.clone());
        }
        unseen
    }

    /// Converts a value for a numeric key to a number.
    ///
    /// Values of other keys pass through unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NotNumeric`] if the key is numeric and the
    /// value is not a number or numeric text.
    pub fn coerce(&self, key: &str, value: Value) -> Result<Value, ValidationError> {
        if !self.numeric.contains(key) {
            return Ok(value);
        }
        let not_numeric = |value: &Value| ValidationError::NotNumeric {
            param: key.to_string(),
            value: value.to_string(),
        };
        match value {
            Value::Number(_) => Ok(value),
            Value::String(ref text) => {
                let text = text.trim();
                if let Ok(integer) = text.parse::<i64>() {
                    return Ok(Value::from(integer));
                }
                text.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| not_numeric(&value))
            }
            other => Err(not_numeric(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bulb() -> ParameterDescriptor {
        ParameterDescriptor::new()
            .with_setting("channel0", "white_cold")
            .with_setting("zyx_mode", "mode")
            .with_setting("state", "switch")
            .with_numeric("zyx_mode")
            .with_read_only(&["rssi"])
    }

    #[test]
    fn resolves_key_and_alias() {
        let descriptor = bulb();
        assert_eq!(descriptor.resolve("white_cold"), Some("channel0"));
        assert_eq!(descriptor.resolve("switch"), Some("state"));
        assert_eq!(descriptor.resolve("state"), Some("state"));
        assert_eq!(descriptor.resolve("rssi"), None);
        assert_eq!(descriptor.resolve("nope"), None);
    }

    #[test]
    fn alias_falls_back_to_key() {
        let descriptor = bulb();
        assert_eq!(descriptor.alias_for("channel0"), "white_cold");
        assert_eq!(descriptor.alias_for("rssi"), "rssi");
        assert_eq!(descriptor.alias_for("unknown"), "unknown");
    }

    #[test]
    fn registers_only_unknown_keys() {
        let mut descriptor = bulb();
        let params = json!({"rssi": -50, "state": "on", "sledOnline": "on"});
        let added = descriptor.register_unseen(params.as_object().unwrap());
        assert_eq!(added, vec!["sledOnline".to_string()]);
        assert_eq!(descriptor.resolve("sledOnline"), Some("sledOnline"));

        // A second sighting registers nothing
        assert!(descriptor.register_unseen(params.as_object().unwrap()).is_empty());
    }

    #[test]
    fn registries_are_independent() {
        let mut first = bulb();
        let second = bulb();
        first.register_unseen(json!({"extra": 1}).as_object().unwrap());
        assert!(first.knows("extra"));
        assert!(!second.knows("extra"));
    }

    #[test]
    fn coerces_numeric_keys() {
        let descriptor = bulb();
        assert_eq!(descriptor.coerce("zyx_mode", json!("2")).unwrap(), json!(2));
        assert_eq!(descriptor.coerce("zyx_mode", json!(1)).unwrap(), json!(1));
        assert_eq!(descriptor.coerce("zyx_mode", json!("1.5")).unwrap(), json!(1.5));
        assert_eq!(descriptor.coerce("state", json!("on")).unwrap(), json!("on"));
    }

    #[test]
    fn rejects_non_numeric_values() {
        let descriptor = bulb();
        assert!(matches!(
            descriptor.coerce("zyx_mode", json!("bright")),
            Err(ValidationError::NotNumeric { ref param, .. }) if param == "zyx_mode"
        ));
        assert!(descriptor.coerce("zyx_mode", json!(true)).is_err());
    }
}
