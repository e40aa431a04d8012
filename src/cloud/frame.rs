// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Relay connection frames.
//!
//! Outbound frames are JSON objects built from [`RequestParams`]; inbound
//! text is classified by [`parse_inbound`] into heartbeat replies, control
//! frames, device frames and anything else.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ParseError;

/// Heartbeat request text.
pub const HEARTBEAT_PING: &str = "ping";

/// Heartbeat reply text.
pub const HEARTBEAT_PONG: &str = "pong";

/// Protocol version announced to the relay.
pub const PROTOCOL_VERSION: u8 = 8;

const USER_AGENT: &str = "app";

/// Parameters of a request to a device.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestParams {
    /// Set the given parameters.
    Update(Map<String, Value>),
    /// Read the named parameters; an empty list reads all of them.
    Query(Vec<String>),
}

impl RequestParams {
    /// Creates an update of a single parameter.
    #[must_use]
    pub fn single(key: impl Into<String>, value: Value) -> Self {
        let mut params = Map::new();
        params.insert(key.into(), value);
        Self::Update(params)
    }

    /// Creates a query for every parameter.
    #[must_use]
    pub fn query_all() -> Self {
        Self::Query(Vec::new())
    }

    /// Returns the frame action.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::Update(_) => "update",
            Self::Query(_) => "query",
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Update(params) => Value::Object(params.clone()),
            Self::Query(names) => Value::Array(names.iter().cloned().map(Value::String).collect()),
        }
    }
}

/// The frame identifying the gateway right after the connection opens.
#[derive(Debug, Serialize)]
pub(crate) struct IdentifyFrame<'a> {
    action: &'static str,
    at: &'a str,
    apikey: &'a str,
    appid: &'a str,
    nonce: &'a str,
    ts: i64,
    #[serde(rename = "userAgent")]
    user_agent: &'static str,
    sequence: String,
    version: u8,
}

impl<'a> IdentifyFrame<'a> {
    pub(crate) fn new(
        token: &'a str,
        apikey: &'a str,
        appid: &'a str,
        nonce: &'a str,
        ts: i64,
        sequence: u64,
    ) -> Self {
        Self {
            action: "userOnline",
            at: token,
            apikey,
            appid,
            nonce,
            ts,
            user_agent: USER_AGENT,
            sequence: sequence.to_string(),
            version: PROTOCOL_VERSION,
        }
    }
}

/// A request to a device.
#[derive(Debug, Serialize)]
pub(crate) struct RequestFrame<'a> {
    action: &'static str,
    deviceid: &'a str,
    apikey: &'a str,
    #[serde(rename = "selfApikey")]
    self_apikey: &'a str,
    params: Value,
    #[serde(rename = "userAgent")]
    user_agent: &'static str,
    sequence: String,
    ts: i64,
}

impl<'a> RequestFrame<'a> {
    pub(crate) fn new(
        deviceid: &'a str,
        apikey: &'a str,
        params: &RequestParams,
        sequence: u64,
        ts: i64,
    ) -> Self {
        Self {
            action: params.action(),
            deviceid,
            apikey,
            self_apikey: apikey,
            params: params.to_value(),
            user_agent: USER_AGENT,
            sequence: sequence.to_string(),
            ts,
        }
    }
}

/// What a device frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A parameter update pushed by the device.
    Update,
    /// A system message (online/offline and diagnostics).
    Sysmsg,
    /// A reply to one of our requests.
    Reply,
    /// Any other action.
    Other,
}

/// A frame addressed to or about one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFrame {
    /// The device id.
    pub deviceid: String,
    /// The frame action, absent on replies.
    pub action: Option<String>,
    /// The error code, present on replies.
    pub error: Option<i64>,
    /// The error reason, if any.
    pub reason: Option<String>,
    /// The sequence number, present on replies.
    pub sequence: Option<u64>,
    /// Parameters carried by the frame.
    pub params: Option<Map<String, Value>>,
    /// The frame text as received.
    pub raw: String,
}

impl DeviceFrame {
    /// Returns what the frame carries.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self.action.as_deref() {
            Some("update") => FrameKind::Update,
            Some("sysmsg") => FrameKind::Sysmsg,
            Some(_) => FrameKind::Other,
            None => FrameKind::Reply,
        }
    }

    /// Returns whether the frame reports a device error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some_and(|code| code != 0)
    }

    /// Returns the status text published for a reply.
    ///
    /// `None` when the frame carries no error code.
    #[must_use]
    pub fn status(&self) -> Option<String> {
        match self.error? {
            0 => Some("OK".to_string()),
            _ => Some(format!(
                "Error: {}",
                self.reason.as_deref().unwrap_or("unknown")
            )),
        }
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A heartbeat reply.
    Pong,
    /// A control frame, such as the reply to the identification frame.
    Control {
        /// Error code, 0 on success.
        error: i64,
        /// Heartbeat interval advertised by the relay.
        heartbeat: Option<Duration>,
    },
    /// A frame for a device.
    Device(DeviceFrame),
    /// A frame that fits none of the above.
    Other(Value),
}

/// Parses a sequence number sent either as a string or a number.
fn sequence_of(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::String(text) => text.parse().ok(),
        Value::Number(number) => number.as_u64(),
        _ => None,
    }
}

/// Classifies an inbound text frame.
///
/// # Errors
///
/// Returns [`ParseError`] if the text is neither a heartbeat reply nor a
/// JSON object.
///
/// # Examples
///
/// ```
/// use ewegate::cloud::{InboundFrame, parse_inbound};
///
/// assert_eq!(parse_inbound("pong").unwrap(), InboundFrame::Pong);
///
/// let frame = parse_inbound(r#"{"error":0,"deviceid":"1000ab","sequence":"17"}"#).unwrap();
/// let InboundFrame::Device(frame) = frame else { panic!() };
/// assert_eq!(frame.sequence, Some(17));
/// assert_eq!(frame.status().as_deref(), Some("OK"));
/// ```
pub fn parse_inbound(text: &str) -> Result<InboundFrame, ParseError> {
    if text.trim() == HEARTBEAT_PONG {
        return Ok(InboundFrame::Pong);
    }

    let value: Value = serde_json::from_str(text)?;
    let Value::Object(object) = value else {
        return Err(ParseError::NotAnObject);
    };

    let error = object.get("error").and_then(Value::as_i64);

    if let Some(deviceid) = object.get("deviceid").and_then(Value::as_str) {
        return Ok(InboundFrame::Device(DeviceFrame {
            deviceid: deviceid.to_string(),
            action: object
                .get("action")
                .and_then(Value::as_str)
                .map(str::to_string),
            error,
            reason: object
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            sequence: sequence_of(object.get("sequence")),
            params: object
                .get("params")
                .and_then(Value::as_object)
                .cloned(),
            raw: text.to_string(),
        }));
    }

    if let Some(config) = object.get("config").and_then(Value::as_object) {
        let enabled = config.get("hb").and_then(Value::as_i64) == Some(1);
        let interval = config.get("hbInterval").and_then(Value::as_u64);
        let heartbeat = match interval {
            Some(seconds) if enabled && seconds > 0 => Some(Duration::from_secs(seconds)),
            _ => None,
        };
        return Ok(InboundFrame::Control {
            error: error.unwrap_or(0),
            heartbeat,
        });
    }

    if let (Some(error), None) = (error, object.get("action")) {
        return Ok(InboundFrame::Control {
            error,
            heartbeat: None,
        });
    }

    Ok(InboundFrame::Other(Value::Object(object)))
}
