// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridge between a publish/subscribe bus and the gateway.
//!
//! Commands arrive on `<command_root>/<selector>/<command>`. The selector is
//! a device id, a display name or a list index. Device state is published
//! on `<status_root>/<deviceid>/<param>`, with nested values flattened into
//! one topic per leaf.
//!
//! | Topic | Payload |
//! |-------|---------|
//! | `<status_root>/<deviceid>/<param>` | parameter value |
//! | `<status_root>/<deviceid>/status` | `OK` or `Error: <reason>` |
//! | `<status_root>/<deviceid>/json` | every frame received for the device |
//! | `<status_root>/client/status` | connection status |
//! | `<status_root>/client/devices` | device summary, after `list_devices` |
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ewegate::bridge::{Bridge, MqttBus};
//! use ewegate::config::{BridgeConfig, CloudConfig, GatewayConfig};
//! use ewegate::Gateway;
//!
//! # async fn example() -> ewegate::Result<()> {
//! let cloud = CloudConfig::new("me@example.com", "password")
//!     .with_app_credential("appid", "secret");
//! let gateway = Gateway::new(GatewayConfig::new(cloud))?;
//! let config = BridgeConfig::default();
//!
//! let (bus, inbound) = MqttBus::builder()
//!     .host("127.0.0.1")
//!     .subscribe(config.command_filter())
//!     .build()
//!     .await?;
//!
//! let bridge = Arc::new(Bridge::new(gateway.clone(), bus, config));
//! gateway.start();
//! bridge.run(inbound).await;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "mqtt")]
mod mqtt;
mod payload;
mod topic;

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;

use crate::config::BridgeConfig;
use crate::device::CommandEnvelope;
use crate::error::BusError;
use crate::event::GatewayEvent;
use crate::gateway::Gateway;

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttBus, MqttBusBuilder};
pub use payload::decode_payload;
pub use topic::CommandTopic;

/// Lifecycle verbs that cannot be triggered from the bus.
const RESERVED_VERBS: &[&str] = &[
    "start",
    "stop",
    "shutdown",
    "login",
    "connect",
    "disconnect",
    "run",
];

/// Sends messages to the bus.
pub trait Publisher: Send + Sync {
    /// Publishes `payload` on `topic`.
    ///
    /// Resolves once the message has been handed to the bus, waiting for
    /// room when the bus is busy.
    fn publish(
        &self,
        topic: &str,
        payload: String,
    ) -> impl Future<Output = Result<(), BusError>> + Send;
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// Message payload as text.
    pub payload: String,
}

impl BusMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Commands handled by the gateway rather than a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerCommand {
    /// Reconnect to the relay without waiting.
    Reconnect,
    /// Query every device.
    Refresh,
    /// Publish the device summary.
    ListDevices,
}

impl ManagerCommand {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "reconnect" => Some(Self::Reconnect),
            "refresh" => Some(Self::Refresh),
            "list_devices" => Some(Self::ListDevices),
            _ => None,
        }
    }
}

/// Why a bus message was not acted on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The topic is not below the command root.
    #[error("not a command topic: {0}")]
    NotACommand(String),

    /// The command is a lifecycle verb.
    #[error("{0} cannot be run from the bus")]
    Reserved(String),

    /// A device command arrived without a selector.
    #[error("no device selected for {0}")]
    MissingSelector(String),

    /// No device matches the selector.
    #[error("no device matches {0:?}")]
    UnknownDevice(String),

    /// The device's actor no longer accepts commands.
    #[error("device {0} is stopped")]
    Stopped(String),
}

/// Result of dispatching one bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The command was queued on a device.
    Enqueued {
        /// Device the command was queued on.
        deviceid: String,
        /// The command name.
        command: String,
    },
    /// The command ran on the gateway.
    Manager(ManagerCommand),
    /// The message was dropped.
    Rejected(Rejection),
}

/// Connects a bus to a gateway.
///
/// Inbound messages become device commands and gateway events become bus
/// messages. Parameter values are only republished when they change.
pub struct Bridge<P> {
    gateway: Gateway,
    publisher: P,
    config: BridgeConfig,
    events: Mutex<Option<broadcast::Receiver<GatewayEvent>>>,
    /// Last payload published per leaf topic.
    published: Mutex<HashMap<String, String>>,
}

impl<P: Publisher> Bridge<P> {
    /// Creates a bridge.
    ///
    /// The bridge subscribes to gateway events right away, so events
    /// published before [`Bridge::run`] is called are not lost.
    #[must_use]
    pub fn new(gateway: Gateway, publisher: P, config: BridgeConfig) -> Self {
        let events = gateway.subscribe();
        Self {
            gateway,
            publisher,
            config,
            events: Mutex::new(Some(events)),
            published: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the topic configuration.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Returns the publisher.
    #[must_use]
    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Runs until the bus or the gateway's event bus closes.
    pub async fn run(&self, mut inbound: mpsc::Receiver<BusMessage>) {
        let taken = self.events.lock().take();
        let mut events = taken.unwrap_or_else(|| self.gateway.subscribe());

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    let Some(message) = message else {
                        tracing::info!("Bus closed, stopping bridge");
                        break;
                    };
                    self.dispatch(&message.topic, &message.payload).await;
                }
                event = events.recv() => match event {
                    Ok(event) => self.publish_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Bridge fell behind gateway events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    /// Acts on one bus message.
    ///
    /// Rejected messages are logged and reported in the outcome; they never
    /// fail the caller.
    pub async fn dispatch(&self, topic: &str, payload: &str) -> DispatchOutcome {
        let outcome = self.route(topic, payload).await;
        match &outcome {
            DispatchOutcome::Rejected(reason) => {
                tracing::warn!(topic, reason = %reason, "Command rejected");
            }
            DispatchOutcome::Enqueued { deviceid, command } => {
                tracing::debug!(deviceid = %deviceid, command = %command, "Command queued");
            }
            DispatchOutcome::Manager(command) => {
                tracing::debug!(?command, "Gateway command handled");
            }
        }
        outcome
    }

    async fn route(&self, topic: &str, payload: &str) -> DispatchOutcome {
        let Some(CommandTopic { selector, command }) =
            CommandTopic::parse(topic, &self.config.command_root)
        else {
            return DispatchOutcome::Rejected(Rejection::NotACommand(topic.to_string()));
        };

        if RESERVED_VERBS.contains(&command.as_str()) {
            return DispatchOutcome::Rejected(Rejection::Reserved(command));
        }

        if let Some(manager) = ManagerCommand::from_name(&command) {
            match manager {
                ManagerCommand::Reconnect => self.gateway.reconnect(),
                ManagerCommand::Refresh => self.gateway.refresh_all().await,
                ManagerCommand::ListDevices => self.gateway.publish_device_list().await,
            }
            return DispatchOutcome::Manager(manager);
        }

        let Some(selector) = selector else {
            return DispatchOutcome::Rejected(Rejection::MissingSelector(command));
        };
        let Some(device) = self.gateway.resolve(&selector).await else {
            return DispatchOutcome::Rejected(Rejection::UnknownDevice(selector));
        };

        let envelope = CommandEnvelope::new(command.clone(), decode_payload(payload))
            .with_source(topic);
        match device.enqueue(envelope) {
            Ok(()) => DispatchOutcome::Enqueued {
                deviceid: device.deviceid().to_string(),
                command,
            },
            Err(_) => DispatchOutcome::Rejected(Rejection::Stopped(device.deviceid().to_string())),
        }
    }

    /// Publishes one gateway event.
    ///
    /// Publish failures are logged and not retried.
    pub async fn publish_event(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::ParameterChanged {
                deviceid,
                param,
                value,
            } => {
                self.publish_change(deviceid, param, value).await;
            }
            GatewayEvent::DeviceStatus { deviceid, status } => {
                self.publish_direct(deviceid, "status", status.clone()).await;
            }
            GatewayEvent::RawFrame { deviceid, frame } => {
                self.publish_direct(deviceid, "json", frame.clone()).await;
            }
            GatewayEvent::Client(status) => {
                self.publish_direct("client", "status", status.as_str().to_string())
                    .await;
            }
            GatewayEvent::DeviceList(list) => {
                self.publish_direct("client", "devices", list.to_string()).await;
            }
        }
    }

    /// Publishes a parameter value, one topic per leaf.
    ///
    /// A leaf is skipped when its topic last carried the same payload. Only
    /// delivered leaves are remembered, so a leaf that failed to publish
    /// goes out again with the next change of its parameter.
    ///
    /// Returns the number of leaves published.
    pub async fn publish_change(&self, deviceid: &str, param: &str, value: &Value) -> usize {
        let mut leaves = Vec::new();
        payload::flatten(param, value, &mut leaves);

        let changed: Vec<(String, String)> = {
            let published = self.published.lock();
            leaves
                .into_iter()
                .map(|(leaf, text)| (self.config.status_topic(deviceid, &leaf), text))
                .filter(|(topic, text)| published.get(topic) != Some(text))
                .collect()
        };

        let mut delivered = 0;
        for (topic, text) in changed {
            tracing::trace!(topic = %topic, payload = %text, "Publishing");
            match self.publisher.publish(&topic, text.clone()).await {
                Ok(()) => {
                    self.published.lock().insert(topic, text);
                    delivered += 1;
                }
                Err(e) => tracing::warn!(topic = %topic, error = %e, "Failed to publish"),
            }
        }
        delivered
    }

    async fn publish_direct(&self, deviceid: &str, leaf: &str, payload: String) {
        let topic = self.config.status_topic(deviceid, leaf);
        if let Err(e) = self.publisher.publish(&topic, payload).await {
            tracing::warn!(topic = %topic, error = %e, "Failed to publish");
        }
    }
}

impl<P> std::fmt::Debug for Bridge<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
