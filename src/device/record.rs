// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Last known state of a device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A device as reported by the cloud, with its last known parameters.
///
/// Parameters only change by merging notification payloads into them.
///
/// # Examples
///
/// ```
/// use ewegate::device::DeviceRecord;
/// use serde_json::json;
///
/// let mut record = DeviceRecord::new("1000abcdef", "Lamp", "Basic");
/// let update = json!({"switch": "on"});
///
/// assert!(record.merge(update.as_object().unwrap()));
/// // Merging the same payload again changes nothing
/// assert!(!record.merge(update.as_object().unwrap()));
/// assert_eq!(record.param("switch"), Some(&json!("on")));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Stable device identity.
    pub deviceid: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Product model, which selects the device variant.
    #[serde(rename = "productModel", default)]
    pub product_model: String,
    /// Last known parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Whether the device is reachable through the cloud.
    #[serde(default)]
    pub online: bool,
    /// When a notification last changed a parameter.
    #[serde(skip)]
    pub last_update: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    /// Creates a record with no parameters.
    #[must_use]
    pub fn new(
        deviceid: impl Into<String>,
        name: impl Into<String>,
        product_model: impl Into<String>,
    ) -> Self {
        Self {
            deviceid: deviceid.into(),
            name: name.into(),
            product_model: product_model.into(),
            params: Map::new(),
            online: false,
            last_update: None,
        }
    }

    /// Sets the initial parameters.
    #[must_use]
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Returns a parameter by device key.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Returns the timers stored on the device.
    #[must_use]
    pub fn timers(&self) -> Vec<Value> {
        self.params
            .get("timers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    /// Merges a payload into the parameters and returns whether anything
    /// changed.
    pub fn merge(&mut self, update: &Map<String, Value>) -> bool {
        deep_merge(&mut self.params, update)
    }

    /// Returns the summary published by `list_devices`.
    #[must_use]
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "deviceid": self.deviceid,
            "name": self.name,
            "productModel": self.product_model,
            "online": self.online,
        })
    }
}

/// Merges `source` into `target`.
///
/// Nested objects merge key by key; every other value replaces what was
/// there. Returns whether `target` changed.
pub fn deep_merge(target: &mut Map<String, Value>, source: &Map<String, Value>) -> bool {
    let mut changed = false;
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                changed |= deep_merge(existing, incoming);
            }
            (Some(existing), _) if existing == value => {}
            _ => {
                target.insert(key.clone(), value.clone());
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn scalars_overwrite() {
        let mut target = object(json!({"switch": "off", "rssi": -60}));
        assert!(deep_merge(&mut target, &object(json!({"switch": "on"}))));
        assert_eq!(target, object(json!({"switch": "on", "rssi": -60})));
    }

    #[test]
    fn nested_objects_merge_keywise() {
        let mut target = object(json!({"config": {"a": 1, "b": 2}}));
        assert!(deep_merge(&mut target, &object(json!({"config": {"b": 3, "c": 4}}))));
        assert_eq!(target, object(json!({"config": {"a": 1, "b": 3, "c": 4}})));
    }

    #[test]
    fn arrays_replace() {
        let mut target = object(json!({"timers": [1, 2, 3]}));
        assert!(deep_merge(&mut target, &object(json!({"timers": []}))));
        assert_eq!(target["timers"], json!([]));
    }

    #[test]
    fn object_replaces_scalar() {
        let mut target = object(json!({"config": "none"}));
        assert!(deep_merge(&mut target, &object(json!({"config": {"a": 1}}))));
        assert_eq!(target["config"], json!({"a": 1}));
    }

    #[test]
    fn identical_merge_reports_no_change() {
        let update = object(json!({"switch": "on", "config": {"a": 1}}));
        let mut target = Map::new();
        assert!(deep_merge(&mut target, &update));
        assert!(!deep_merge(&mut target, &update));
    }

    #[test]
    fn deserializes_cloud_entry() {
        let record: DeviceRecord = serde_json::from_value(json!({
            "deviceid": "1000ab",
            "name": "Heater",
            "productModel": "TH16",
            "online": true,
            "params": {"switch": "off", "timers": [{"at": "x"}]},
            "extra": {"uiid": 15}
        }))
        .unwrap();
        assert_eq!(record.product_model, "TH16");
        assert!(record.online);
        assert_eq!(record.timers().len(), 1);
        assert!(record.last_update.is_none());
    }

    #[test]
    fn summary_fields() {
        let record = DeviceRecord::new("1000ab", "Lamp", "B1");
        assert_eq!(
            record.summary(),
            json!({"deviceid": "1000ab", "name": "Lamp", "productModel": "B1", "online": false})
        );
    }
}
