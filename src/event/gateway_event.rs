// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gateway event types.

use std::fmt;

use serde_json::Value;

/// Lifecycle of the gateway's cloud connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// The gateway is starting and has not connected yet.
    Starting,
    /// The relay connection is open.
    Connected,
    /// The relay connection was lost.
    Disconnected,
    /// A new connection attempt is about to start.
    Reconnecting,
}

impl ClientStatus {
    /// Returns the text published for this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Reconnecting => "Reconnecting",
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by device actors and the gateway.
///
/// # Examples
///
/// ```
/// use ewegate::event::GatewayEvent;
/// use serde_json::json;
///
/// let event = GatewayEvent::parameter("1000abcdef", "switch", json!("on"));
/// assert_eq!(event.deviceid(), Some("1000abcdef"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A device parameter changed value.
    ParameterChanged {
        /// Device the parameter belongs to.
        deviceid: String,
        /// External name of the parameter (alias or raw key).
        param: String,
        /// The new value.
        value: Value,
    },

    /// A status message for a device (`OK` or `Error: ...`).
    DeviceStatus {
        /// Device the status belongs to.
        deviceid: String,
        /// Status text.
        status: String,
    },

    /// A raw frame received from the relay for a device.
    RawFrame {
        /// Device the frame is addressed to.
        deviceid: String,
        /// The frame text as received.
        frame: String,
    },

    /// The gateway connection status changed.
    Client(ClientStatus),

    /// A summary of every known device, as a JSON array.
    DeviceList(Value),
}

impl GatewayEvent {
    /// Creates a [`GatewayEvent::ParameterChanged`] event.
    #[must_use]
    pub fn parameter(deviceid: impl Into<String>, param: impl Into<String>, value: Value) -> Self {
        Self::ParameterChanged {
            deviceid: deviceid.into(),
            param: param.into(),
            value,
        }
    }

    /// Creates a [`GatewayEvent::DeviceStatus`] event.
    #[must_use]
    pub fn status(deviceid: impl Into<String>, status: impl Into<String>) -> Self {
        Self::DeviceStatus {
            deviceid: deviceid.into(),
            status: status.into(),
        }
    }

    /// Returns the device this event concerns, if any.
    #[must_use]
    pub fn deviceid(&self) -> Option<&str> {
        match self {
            Self::ParameterChanged { deviceid, .. }
            | Self::DeviceStatus { deviceid, .. }
            | Self::RawFrame { deviceid, .. } => Some(deviceid),
            Self::Client(_) | Self::DeviceList(_) => None,
        }
    }
}
