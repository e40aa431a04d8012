// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Commands accepted by device actors.

use serde_json::{Map, Value};

use super::ParameterDescriptor;
use crate::error::ValidationError;
use crate::timer::SwitchState;

/// A command addressed to one device.
///
/// Created by the bus bridge (or any other caller) and consumed exactly once
/// by the device's actor.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    /// Command name, such as `set_switch` or `add_timer`.
    pub command: String,
    /// Decoded payload.
    pub args: Value,
    /// Topic the command arrived on, if it came from the bus.
    pub source: Option<String>,
}

impl CommandEnvelope {
    /// Creates an envelope.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Value) -> Self {
        Self {
            command: command.into(),
            args,
            source: None,
        }
    }

    /// Records the topic the command arrived on.
    #[must_use]
    pub fn with_source(mut self, topic: impl Into<String>) -> Self {
        self.source = Some(topic.into());
        self
    }

    /// Returns the payload as text.
    ///
    /// Text payloads are returned as is, anything else as JSON.
    #[must_use]
    pub fn args_text(&self) -> String {
        match &self.args {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// A command resolved against a device's parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DeviceCommand {
    /// Set one parameter, named by key or alias.
    SetParameter {
        name: String,
        value: Value,
        wait: bool,
    },
    /// Send raw parameters.
    SendJson(Map<String, Value>),
    /// Read parameters; empty means all of them.
    Query(Vec<String>),
    AddTimer(String),
    ListTimers,
    DeleteTimers(String),
    ClearTimers,
    /// Anything else, left to the device variant.
    Other { command: String, args: String },
}

/// Resolves an envelope to a command.
///
/// Parameter names win over built-in commands, so a device may shadow
/// `set_switch` by declaring a `switch` setting.
pub(crate) fn parse_command(
    envelope: &CommandEnvelope,
    descriptor: &ParameterDescriptor,
) -> Result<DeviceCommand, ValidationError> {
    let command = envelope.command.as_str();

    let setting = descriptor
        .resolve(command)
        .or_else(|| command.strip_prefix("set_").and_then(|name| descriptor.resolve(name)));
    if let Some(key) = setting {
        return Ok(DeviceCommand::SetParameter {
            name: key.to_string(),
            value: normalize_value(envelope.args.clone()),
            wait: false,
        });
    }

    let parsed = match command {
        "set_switch" => DeviceCommand::SetParameter {
            name: "switch".to_string(),
            value: normalize_value(envelope.args.clone()),
            wait: false,
        },
        "set_led" => DeviceCommand::SetParameter {
            name: "sledOnline".to_string(),
            value: normalize_value(envelope.args.clone()),
            wait: false,
        },
        "send_json" | "set_json" => DeviceCommand::SendJson(json_object(&envelope.args)?),
        "get_config" => DeviceCommand::Query(parameter_names(&envelope.args_text())),
        "add_timer" => DeviceCommand::AddTimer(envelope.args_text()),
        "list_timers" => DeviceCommand::ListTimers,
        "del_timer" | "del_timers" => DeviceCommand::DeleteTimers(envelope.args_text()),
        "clear_timers" => DeviceCommand::ClearTimers,
        _ => DeviceCommand::Other {
            command: command.to_string(),
            args: envelope.args_text(),
        },
    };
    Ok(parsed)
}

/// Lowercases switch positions, which the cloud only accepts in lowercase.
fn normalize_value(value: Value) -> Value {
    match value {
        Value::String(text) => match text.trim().parse::<SwitchState>() {
            Ok(state) => Value::String(state.as_str().to_string()),
            Err(_) => Value::String(text),
        },
        other => other,
    }
}

/// Reads a JSON object from a decoded payload, accepting single quotes.
fn json_object(args: &Value) -> Result<Map<String, Value>, ValidationError> {
    let value = match args {
        Value::String(text) => serde_json::from_str(&text.replace('\'', "\""))
            .map_err(|e| ValidationError::InvalidJson(format!("{text}: {e}")))?,
        other => other.clone(),
    };
    match value {
        Value::Object(object) => Ok(object),
        other => Err(ValidationError::InvalidJson(format!(
            "expected an object, got {other}"
        ))),
    }
}

fn parameter_names(args: &str) -> Vec<String> {
    args.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
