// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the gateway.
//!
//! Errors are layered the same way the gateway is: cloud authentication,
//! relay connection, request sending, command validation, frame parsing and
//! the command bus each have their own enum, all of which convert into
//! [`Error`].

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Logging into the cloud failed.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Opening or keeping the relay connection failed.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// A request could not be sent to the relay.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// A command or its arguments were rejected before reaching the cloud.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A cloud frame or reply could not be decoded.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The command bus failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// No device matches the given selector.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The device actor has shut down and no longer accepts commands.
    #[error("device actor stopped: {0}")]
    ActorStopped(String),
}

/// Errors raised while logging into the cloud.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// No app credential is configured.
    #[error("no app credential configured")]
    MissingAppCredential,

    /// The app secret cannot be used as a signing key.
    #[error("invalid app secret")]
    InvalidSecret,

    /// The cloud rejected the login.
    #[error("login rejected with code {code}: {reason}")]
    Rejected {
        /// Error code reported by the cloud.
        code: i64,
        /// Reason reported by the cloud, if any.
        reason: String,
    },

    /// The account still lives in another region after the retry.
    #[error("account belongs to region {0} after redirect")]
    RegionMismatch(String),

    /// The reply is missing a required field.
    #[error("login reply is missing {0}")]
    MissingField(&'static str),

    /// The login body could not be encoded.
    #[error("failed to encode login: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors raised while opening or running the relay connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The dispatch request failed.
    #[error("dispatch request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The bearer token was refused; a fresh login is required.
    #[error("bearer token refused")]
    Unauthorized,

    /// The dispatch reply carried no relay host.
    #[error("dispatch reply has no relay host")]
    NoRelayHost,

    /// The cloud reported an error for the request.
    #[error("cloud error {code}: {reason}")]
    Cloud {
        /// Error code reported by the cloud.
        code: i64,
        /// Reason reported by the cloud, if any.
        reason: String,
    },

    /// The WebSocket handshake or transport failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A reply could not be decoded.
    #[error("invalid reply: {0}")]
    Parse(#[from] ParseError),

    /// No login has been performed yet.
    #[error("not authenticated")]
    NotAuthenticated,
}

/// Errors raised while sending a request over the relay.
#[derive(Debug, Error)]
pub enum SendError {
    /// No relay connection is open.
    #[error("not connected to the relay")]
    NotConnected,

    /// The relay connection closed before a response arrived.
    #[error("relay connection closed")]
    ConnectionClosed,

    /// The request frame could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors raised when a command or its arguments are invalid.
///
/// These never reach the cloud and never change device state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A switch action other than `on` or `off`.
    #[error("invalid action {0:?}, expected on or off")]
    InvalidAction(String),

    /// The device already holds the maximum number of timers.
    #[error("device already has {max} timers")]
    TooManyTimers {
        /// Maximum number of timers a device accepts.
        max: usize,
    },

    /// The device already holds an active duration timer.
    #[error("device already has an active duration timer")]
    DurationTimerExists,

    /// The timer kind is unknown or not supported by this device.
    #[error("unsupported timer kind: {0}")]
    UnsupportedTimerKind(String),

    /// A schedule expression failed validation.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A duration or delay is not a positive whole number of minutes.
    #[error("invalid minutes value: {0}")]
    InvalidMinutes(String),

    /// A channel index is missing or out of range.
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    /// A required argument is missing.
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    /// Extra arguments were given.
    #[error("unexpected arguments: {0}")]
    UnexpectedArguments(String),

    /// A JSON payload could not be parsed.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// A parameter value cannot be coerced to a number.
    #[error("parameter {param} expects a number, got {value}")]
    NotNumeric {
        /// Device parameter key.
        param: String,
        /// The rejected value.
        value: String,
    },

    /// A composite parameter was given malformed tokens.
    #[error("invalid composite value: {0}")]
    InvalidComposite(String),

    /// A timer index is not a number or out of range.
    #[error("invalid timer index: {0}")]
    InvalidIndex(String),

    /// A threshold pair is out of order.
    #[error("invalid range: {0}")]
    InvalidRange(String),
}

/// Errors raised while decoding cloud frames and replies.
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is valid JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// Unexpected reply format.
    #[error("unexpected reply format: {0}")]
    UnexpectedFormat(String),
}

/// Errors raised by the command bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The MQTT client rejected a request.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// The bus is not connected to its broker.
    #[error("bus not connected")]
    NotConnected,

    /// The broker host is missing.
    #[error("MQTT broker host is required")]
    MissingHost,

    /// The broker did not accept the connection in time.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
