// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device variants selected by product model.
//!
//! A [`DeviceModel`] describes what a family of devices supports: its
//! parameters, the timer kinds it accepts, its channel count, and any
//! commands beyond the common ones. The [`ModelRegistry`] maps product model
//! strings to variants and falls back to [`DefaultModel`] for anything it
//! does not know.
//!
//! # Examples
//!
//! ```
//! use ewegate::device::ModelRegistry;
//!
//! let registry = ModelRegistry::with_builtin();
//!
//! assert_eq!(registry.lookup("TH16").name(), "thermostat switch");
//! assert_eq!(registry.lookup("4ch pro").channels(), Some(4));
//! assert_eq!(registry.lookup("Unknown Gadget").name(), "default");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use super::ParameterDescriptor;
use crate::error::ValidationError;
use crate::timer::{SwitchState, TimerKind};

const COMMON_READ_ONLY: [&str; 4] = ["init", "fwVersion", "rssi", "staMac"];

/// A family of devices sharing parameters and commands.
pub trait DeviceModel: fmt::Debug + Send + Sync {
    /// Human readable variant name.
    fn name(&self) -> &'static str;

    /// Product model strings this variant handles.
    fn product_models(&self) -> &'static [&'static str];

    /// Returns a fresh descriptor for one device.
    fn descriptor(&self) -> ParameterDescriptor;

    /// Timer kinds the device accepts.
    fn supported_timers(&self) -> &'static [TimerKind] {
        &TimerKind::ALL
    }

    /// Number of output channels, for multi-channel devices.
    fn channels(&self) -> Option<u8> {
        None
    }

    /// Whether the device has an automatic-mode main switch.
    fn has_main_switch(&self) -> bool {
        false
    }

    /// Rewrites a value before it is sent for `key`.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the value is not acceptable.
    fn transform_parameter(&self, key: &str, value: Value) -> Result<Value, ValidationError> {
        let _ = key;
        Ok(value)
    }

    /// Handles a command the common command set does not know.
    ///
    /// Returns `None` when the variant does not know it either, otherwise
    /// the parameters to send.
    fn handle_command(
        &self,
        command: &str,
        args: &str,
    ) -> Option<Result<Map<String, Value>, ValidationError>> {
        let _ = (command, args);
        None
    }
}

/// Variant used for unknown product models.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultModel;

impl DeviceModel for DefaultModel {
    fn name(&self) -> &'static str {
        "default"
    }

    fn product_models(&self) -> &'static [&'static str] {
        &["Default"]
    }

    fn descriptor(&self) -> ParameterDescriptor {
        ParameterDescriptor::new().with_read_only(&["fwVersion", "rssi", "staMac"])
    }
}

/// Single relay switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicSwitch;

impl DeviceModel for BasicSwitch {
    fn name(&self) -> &'static str {
        "basic switch"
    }

    fn product_models(&self) -> &'static [&'static str] {
        &["Basic", "Basic2", "BASICR2"]
    }

    fn descriptor(&self) -> ParameterDescriptor {
        ParameterDescriptor::new()
            .with_settings(&["pulse", "pulseWidth", "sledOnline", "startup", "switch"])
            .with_numeric("pulseWidth")
            .with_read_only(&COMMON_READ_ONLY)
    }

    fn supported_timers(&self) -> &'static [TimerKind] {
        &[TimerKind::Delay, TimerKind::Repeat, TimerKind::Duration]
    }
}

/// Switches with power metering.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowSwitch;

impl DeviceModel for PowSwitch {
    fn name(&self) -> &'static str {
        "power metering switch"
    }

    fn product_models(&self) -> &'static [&'static str] {
        &["Pow", "Pow2", "S31"]
    }

    fn descriptor(&self) -> ParameterDescriptor {
        ParameterDescriptor::new()
            .with_settings(&[
                "sledOnline",
                "startup",
                "switch",
                "alarmPValue",
                "alarmVValue",
                "alarmCValue",
                "alarmType",
                "startTime",
                "endTime",
                "hundredDaysKwh",
                "oneKwh",
                "timeZone",
            ])
            .with_read_only(&COMMON_READ_ONLY)
            .with_read_only(&["power", "voltage", "current"])
    }

    fn supported_timers(&self) -> &'static [TimerKind] {
        &[TimerKind::Delay, TimerKind::Repeat, TimerKind::Duration]
    }
}

/// Switches driven by a temperature and humidity sensor.
///
/// Besides the common commands they accept:
///
/// ```text
/// set_temperature <low> <on|off> [<high>]
/// set_humidity <low> <on|off> [<high>]
/// set_manual
/// ```
///
/// The action applies when the reading falls to `low`; the opposite action
/// applies when it rises to `high`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThermostatSwitch;

impl ThermostatSwitch {
    fn thresholds(device_type: &str, args: &str) -> Result<Map<String, Value>, ValidationError> {
        let tokens: Vec<&str> = args.split_whitespace().collect();
        let (low, action, high) = match tokens.as_slice() {
            [value, action] => (*value, *action, *value),
            [low, action, high] => (*low, *action, *high),
            [] | [_] => return Err(ValidationError::MissingArgument("<low> <on|off> [<high>]")),
            [_, _, _, rest @ ..] => {
                return Err(ValidationError::UnexpectedArguments(rest.join(" ")));
            }
        };

        let low_action: SwitchState = action.parse()?;
        let number = |text: &str| {
            text.parse::<u32>().map_err(|_| ValidationError::NotNumeric {
                param: device_type.to_string(),
                value: text.to_string(),
            })
        };
        if number(low)? > number(high)? {
            return Err(ValidationError::InvalidRange(format!(
                "low {low} is above high {high}"
            )));
        }

        let mut params = Map::new();
        params.insert("mainSwitch".to_string(), json!("on"));
        params.insert("deviceType".to_string(), json!(device_type));
        // The device expects the high target first
        params.insert(
            "targets".to_string(),
            json!([
                {"targetHigh": high, "reaction": {"switch": low_action.toggled().as_str()}},
                {"targetLow": low, "reaction": {"switch": low_action.as_str()}},
            ]),
        );
        Ok(params)
    }
}

impl DeviceModel for ThermostatSwitch {
    fn name(&self) -> &'static str {
        "thermostat switch"
    }

    fn product_models(&self) -> &'static [&'static str] {
        &["TH16", "TH10"]
    }

    fn descriptor(&self) -> ParameterDescriptor {
        ParameterDescriptor::new()
            .with_settings(&["sledOnline", "startup", "switch", "mainSwitch", "deviceType"])
            .with_read_only(&COMMON_READ_ONLY)
            .with_read_only(&["currentTemperature", "currentHumidity", "sensorType"])
    }

    fn supported_timers(&self) -> &'static [TimerKind] {
        &[TimerKind::Delay, TimerKind::Repeat, TimerKind::Duration]
    }

    fn has_main_switch(&self) -> bool {
        true
    }

    fn handle_command(
        &self,
        command: &str,
        args: &str,
    ) -> Option<Result<Map<String, Value>, ValidationError>> {
        match command {
            "set_temperature" => Some(Self::thresholds("temperature", args)),
            "set_humidity" => Some(Self::thresholds("humidity", args)),
            "set_manual" => {
                let mut params = Map::new();
                params.insert("deviceType".to_string(), json!("normal"));
                params.insert("mainSwitch".to_string(), json!("off"));
                Some(Ok(params))
            }
            _ => None,
        }
    }
}

/// Colour LED bulbs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedBulb;

impl DeviceModel for LedBulb {
    fn name(&self) -> &'static str {
        "LED bulb"
    }

    fn product_models(&self) -> &'static [&'static str] {
        &["B1"]
    }

    fn descriptor(&self) -> ParameterDescriptor {
        ParameterDescriptor::new()
            .with_setting("channel0", "white_cold")
            .with_setting("channel1", "white_warm")
            .with_setting("channel2", "red")
            .with_setting("channel3", "green")
            .with_setting("channel4", "blue")
            .with_setting("state", "switch")
            .with_setting("type", "type")
            .with_setting("zyx_mode", "mode")
            .with_numeric("zyx_mode")
            .with_read_only(&["fwVersion", "rssi", "staMac"])
    }

    fn supported_timers(&self) -> &'static [TimerKind] {
        &[TimerKind::Delay, TimerKind::Repeat, TimerKind::Once]
    }
}

/// Four channel switches.
///
/// `switches` and `configure` take `<outlet> <on|off>` pairs, for example
/// `0 on 3 off`, and are sent as `[{"outlet": 0, "switch": "on"}, ...]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FourChannelSwitch;

impl FourChannelSwitch {
    const OUTLETS: u8 = 4;

    fn outlet_pairs(param: &str, field: &str, value: Value) -> Result<Value, ValidationError> {
        let text = match value {
            Value::String(text) => text,
            Value::Array(entries) if !entries.is_empty() => {
                return entries
                    .iter()
                    .map(|entry| Self::outlet_entry(field, entry))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array);
            }
            other => {
                return Err(ValidationError::InvalidComposite(format!(
                    "{param} expects <outlet> <on|off> pairs, got {other}"
                )));
            }
        };

        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() || tokens.len() % 2 != 0 {
            return Err(ValidationError::InvalidComposite(format!(
                "{param} expects <outlet> <on|off> pairs, got {text:?}"
            )));
        }

        tokens
            .chunks_exact(2)
            .map(|pair| {
                let outlet = pair[0]
                    .parse::<u8>()
                    .ok()
                    .filter(|outlet| *outlet < Self::OUTLETS)
                    .ok_or_else(|| {
                        ValidationError::InvalidComposite(format!("invalid outlet {:?}", pair[0]))
                    })?;
                let state: SwitchState = pair[1].parse().map_err(|_| {
                    ValidationError::InvalidComposite(format!("invalid state {:?}", pair[1]))
                })?;
                Ok(json!({"outlet": outlet, field: state.as_str()}))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    }

    /// Checks one `{"outlet": n, <field>: "on"|"off"}` entry of a list payload.
    fn outlet_entry(field: &str, entry: &Value) -> Result<Value, ValidationError> {
        let outlet = entry
            .get("outlet")
            .and_then(Value::as_u64)
            .filter(|outlet| *outlet < u64::from(Self::OUTLETS))
            .ok_or_else(|| ValidationError::InvalidComposite(format!("invalid outlet in {entry}")))?;
        let state: SwitchState = entry
            .get(field)
            .and_then(Value::as_str)
            .and_then(|state| state.parse().ok())
            .ok_or_else(|| {
                ValidationError::InvalidComposite(format!("invalid {field} state in {entry}"))
            })?;
        Ok(json!({"outlet": outlet, field: state.as_str()}))
    }
}

impl DeviceModel for FourChannelSwitch {
    fn name(&self) -> &'static str {
        "four channel switch"
    }

    fn product_models(&self) -> &'static [&'static str] {
        &["4CH", "4CH Pro"]
    }

    fn descriptor(&self) -> ParameterDescriptor {
        ParameterDescriptor::new()
            .with_settings(&["pulse", "pulseWidth", "sledOnline", "configure", "switches"])
            .with_numeric("pulseWidth")
            .with_read_only(&COMMON_READ_ONLY)
    }

    fn supported_timers(&self) -> &'static [TimerKind] {
        &[TimerKind::Delay, TimerKind::Repeat, TimerKind::Once]
    }

    fn channels(&self) -> Option<u8> {
        Some(Self::OUTLETS)
    }

    fn transform_parameter(&self, key: &str, value: Value) -> Result<Value, ValidationError> {
        match key {
            "switches" => Self::outlet_pairs(key, "switch", value),
            "configure" => Self::outlet_pairs(key, "startup", value),
            _ => Ok(value),
        }
    }
}

/// Maps product model strings to device variants.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn DeviceModel>>,
    fallback: Arc<dyn DeviceModel>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ModelRegistry {
    /// Creates a registry that only knows the fallback variant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
            fallback: Arc::new(DefaultModel),
        }
    }

    /// Creates a registry with every built-in variant.
    #[must_use]
    pub fn with_builtin() -> Self {
        Self::new()
            .with_model(BasicSwitch)
            .with_model(PowSwitch)
            .with_model(ThermostatSwitch)
            .with_model(LedBulb)
            .with_model(FourChannelSwitch)
    }

    /// Registers a variant under each of its product models.
    #[must_use]
    pub fn with_model(mut self, model: impl DeviceModel + 'static) -> Self {
        self.register(Arc::new(model));
        self
    }

    /// Registers a variant, replacing earlier ones for the same models.
    pub fn register(&mut self, model: Arc<dyn DeviceModel>) {
        for product_model in model.product_models() {
            self.models
                .insert((*product_model).to_string(), Arc::clone(&model));
        }
    }

    /// Returns the variant for a product model.
    ///
    /// Matches exactly first, then ignoring case, then falls back to the
    /// default variant.
    #[must_use]
    pub fn lookup(&self, product_model: &str) -> Arc<dyn DeviceModel> {
        if let Some(model) = self.models.get(product_model) {
            return Arc::clone(model);
        }
        self.models
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(product_model))
            .map_or_else(
                || {
                    tracing::debug!(product_model, "Unknown product model, using default");
                    Arc::clone(&self.fallback)
                },
                |(_, model)| Arc::clone(model),
            )
    }
}
