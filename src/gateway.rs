// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The gateway: one cloud session and an actor per device.
//!
//! The [`Gateway`] owns the device table. It routes every session event:
//! after a login it fetches the device list and starts an actor for each new
//! device, after every connection it refreshes all devices, and every device
//! frame is reported on the event bus and handed to the device's actor.
//!
//! # Examples
//!
//! ```no_run
//! use ewegate::config::{CloudConfig, GatewayConfig};
//! use ewegate::device::CommandEnvelope;
//! use ewegate::Gateway;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> ewegate::Result<()> {
//!     let cloud = CloudConfig::new("me@example.com", "password")
//!         .with_app_credential("appid", "secret");
//!     let gateway = Gateway::new(GatewayConfig::new(cloud))?;
//!
//!     let mut events = gateway.subscribe();
//!     gateway.start();
//!
//!     gateway
//!         .enqueue("Kitchen Lamp", CommandEnvelope::new("set_switch", json!("on")))
//!         .await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::cloud::{CloudSession, DeviceFrame, SessionEvent};
use crate::config::GatewayConfig;
use crate::device::{CommandEnvelope, DeviceHandle, DeviceRecord, ModelRegistry};
use crate::error::{ConnectionError, Error, Result};
use crate::event::{ClientStatus, EventBus, GatewayEvent};

/// Coordinates the cloud session and the device actors.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    session: CloudSession,
    /// Devices in the order the cloud listed them.
    devices: RwLock<Vec<DeviceHandle>>,
    registry: ModelRegistry,
    events: EventBus,
    config: GatewayConfig,
    session_events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Creates a gateway with the built-in device variants.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Self::with_registry(config, ModelRegistry::with_builtin())
    }

    /// Creates a gateway with a custom variant registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_registry(config: GatewayConfig, registry: ModelRegistry) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session =
            CloudSession::new(config.cloud.clone(), tx).map_err(ConnectionError::Http)?;
        Ok(Self {
            inner: Arc::new(GatewayInner {
                session,
                devices: RwLock::new(Vec::new()),
                registry,
                events: EventBus::with_capacity(config.event_capacity),
                config,
                session_events: Mutex::new(Some(rx)),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Returns the cloud session.
    #[must_use]
    pub fn session(&self) -> &CloudSession {
        &self.inner.session
    }

    /// Returns the event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Subscribes to gateway events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    /// Starts the session, the event router and, if configured, polling.
    ///
    /// Calling it again has no effect.
    pub fn start(&self) {
        if !self.spawn_router() {
            return;
        }
        self.inner
            .events
            .publish(GatewayEvent::Client(ClientStatus::Starting));

        let session = self.inner.session.clone();
        let run = tokio::spawn(async move { session.run().await });
        self.inner.tasks.lock().push(run);

        if let Some(period) = self.inner.config.poll_interval {
            let gateway = self.clone();
            let poller = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if gateway.inner.session.is_connected() {
                        tracing::debug!("Polling devices");
                        gateway.refresh_all().await;
                    }
                }
            });
            self.inner.tasks.lock().push(poller);
        }
    }

    /// Starts routing session events; returns false if already started.
    fn spawn_router(&self) -> bool {
        let Some(mut rx) = self.inner.session_events.lock().take() else {
            return false;
        };
        let gateway = self.clone();
        let router = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                gateway.route(event).await;
            }
        });
        self.inner.tasks.lock().push(router);
        true
    }

    /// Returns every device, in list order.
    pub async fn devices(&self) -> Vec<DeviceHandle> {
        self.inner.devices.read().await.clone()
    }

    /// Returns a device by id.
    pub async fn device(&self, deviceid: &str) -> Option<DeviceHandle> {
        self.inner
            .devices
            .read()
            .await
            .iter()
            .find(|device| device.deviceid() == deviceid)
            .cloned()
    }

    /// Resolves a device selector.
    ///
    /// A selector is tried as device id, then as display name, then, if it
    /// is a one or two digit number, as an index into the device list.
    pub async fn resolve(&self, selector: &str) -> Option<DeviceHandle> {
        let devices = self.inner.devices.read().await;
        if let Some(device) = devices.iter().find(|device| device.deviceid() == selector) {
            return Some(device.clone());
        }
        if let Some(device) = devices.iter().find(|device| device.name() == selector) {
            return Some(device.clone());
        }
        if (1..=2).contains(&selector.len()) && selector.bytes().all(|b| b.is_ascii_digit()) {
            return selector
                .parse::<usize>()
                .ok()
                .and_then(|index| devices.get(index))
                .cloned();
        }
        None
    }

    /// Queues a command on the device `selector` resolves to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if no device matches and
    /// [`Error::ActorStopped`] if the device's actor has shut down.
    pub async fn enqueue(&self, selector: &str, envelope: CommandEnvelope) -> Result<()> {
        let device = self
            .resolve(selector)
            .await
            .ok_or_else(|| Error::DeviceNotFound(selector.to_string()))?;
        device.enqueue(envelope)
    }

    /// Drops the relay connection and connects again right away.
    pub fn reconnect(&self) {
        self.inner.session.request_reconnect();
    }

    /// Queues a full parameter read on every device.
    pub async fn refresh_all(&self) {
        for device in self.devices().await {
            if let Err(e) = device.refresh() {
                tracing::warn!(deviceid = %device.deviceid(), error = %e, "Refresh failed");
            }
        }
    }

    /// Publishes a summary of every device as [`GatewayEvent::DeviceList`].
    pub async fn publish_device_list(&self) {
        let summary: Vec<Value> = self
            .devices()
            .await
            .iter()
            .map(|device| device.record().summary())
            .collect();
        self.inner
            .events
            .publish(GatewayEvent::DeviceList(Value::Array(summary)));
    }

    /// Stops the session and every device actor.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down gateway");
        self.inner.session.shutdown();

        for device in self.devices().await {
            // Already stopped actors need no drain
            let _ = device.shutdown().await;
        }

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    /// Starts an actor for every record not known yet.
    ///
    /// Devices already known keep their actor and state.
    pub(crate) async fn load_devices(&self, records: Vec<DeviceRecord>) {
        let mut devices = self.inner.devices.write().await;
        for record in records {
            if devices
                .iter()
                .any(|device| device.deviceid() == record.deviceid)
            {
                continue;
            }
            tracing::info!(
                deviceid = %record.deviceid,
                name = %record.name,
                product_model = %record.product_model,
                "Found device"
            );
            let model = self.inner.registry.lookup(&record.product_model);
            devices.push(DeviceHandle::spawn(
                record,
                model,
                self.inner.session.clone(),
                self.inner.events.clone(),
            ));
        }
    }

    async fn route(&self, event: SessionEvent) {
        match event {
            SessionEvent::Authenticated(context) => {
                match self.inner.session.api().devices(&context).await {
                    Ok(records) => self.load_devices(records).await,
                    Err(e) => tracing::warn!(error = %e, "Failed to fetch device list"),
                }
            }
            SessionEvent::Connected => {
                self.publish_client(ClientStatus::Connected);
                self.refresh_all().await;
            }
            SessionEvent::Disconnected => self.publish_client(ClientStatus::Disconnected),
            SessionEvent::Reconnecting => self.publish_client(ClientStatus::Reconnecting),
            SessionEvent::Frame(frame) => self.route_frame(frame).await,
        }
    }

    async fn route_frame(&self, frame: DeviceFrame) {
        let Some(device) = self.device(&frame.deviceid).await else {
            tracing::warn!(deviceid = %frame.deviceid, "Frame for unknown device");
            return;
        };

        self.inner.events.publish(GatewayEvent::RawFrame {
            deviceid: frame.deviceid.clone(),
            frame: frame.raw.clone(),
        });

        if let Some(status) = frame.status() {
            self.inner
                .events
                .publish(GatewayEvent::status(&frame.deviceid, status));
            if frame.is_error() {
                tracing::warn!(
                    deviceid = %frame.deviceid,
                    reason = frame.reason.as_deref().unwrap_or("unknown"),
                    "Device reported an error"
                );
                return;
            }
        }

        if let Err(e) = device.notify(frame) {
            tracing::warn!(error = %e, "Dropping frame");
        }
    }

    fn publish_client(&self, status: ClientStatus) {
        tracing::info!(status = %status, "Client status");
        self.inner.events.publish(GatewayEvent::Client(status));
    }

    #[cfg(test)]
    pub(crate) fn start_router(&self) {
        self.spawn_router();
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cloud::test_context;
    use crate::config::CloudConfig;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio_tungstenite::tungstenite::Message;

    pub(crate) async fn test_gateway() -> (Gateway, mpsc::UnboundedReceiver<Message>) {
        let cloud = CloudConfig::new("me@example.com", "pw").with_app_credential("appid", "secret");
        let gateway = Gateway::new(GatewayConfig::new(cloud)).unwrap();
        let link = gateway.session().attach_test_link(test_context());
        gateway
            .load_devices(vec![
                DeviceRecord::new("1000aa", "Kitchen", "Basic"),
                DeviceRecord::new("1000bb", "Hall", "B1"),
            ])
            .await;
        gateway.start_router();
        (gateway, link)
    }

    pub(crate) async fn next_request(link: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        match link.recv().await {
            Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolves_id_name_and_index() {
        let (gateway, _link) = test_gateway().await;

        assert_eq!(gateway.resolve("1000bb").await.unwrap().deviceid(), "1000bb");
        assert_eq!(gateway.resolve("Kitchen").await.unwrap().deviceid(), "1000aa");
        assert_eq!(gateway.resolve("0").await.unwrap().deviceid(), "1000aa");
        assert_eq!(gateway.resolve("01").await.unwrap().deviceid(), "1000bb");
        assert!(gateway.resolve("2").await.is_none());
        assert!(gateway.resolve("100").await.is_none());
        assert!(gateway.resolve("Garage").await.is_none());
    }

    #[tokio::test]
    async fn enqueue_to_unknown_selector_fails() {
        let (gateway, _link) = test_gateway().await;
        let result = gateway
            .enqueue("Garage", CommandEnvelope::new("set_switch", json!("on")))
            .await;
        assert!(matches!(result, Err(Error::DeviceNotFound(ref s)) if s == "Garage"));
    }

    #[tokio::test]
    async fn reloading_keeps_existing_actors() {
        let (gateway, _link) = test_gateway().await;
        gateway
            .load_devices(vec![
                DeviceRecord::new("1000aa", "Renamed", "Basic"),
                DeviceRecord::new("1000cc", "Porch", "Pow"),
            ])
            .await;

        let devices = gateway.devices().await;
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].name(), "Kitchen");
        assert_eq!(devices[2].deviceid(), "1000cc");
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_command_publishes_ok() {
        let (gateway, mut link) = test_gateway().await;
        let mut events = gateway.subscribe();

        gateway
            .enqueue("Kitchen", CommandEnvelope::new("set_switch", json!("off")))
            .await
            .unwrap();

        let request = next_request(&mut link).await;
        assert_eq!(request["deviceid"], "1000aa");
        assert_eq!(request["params"], json!({"switch": "off"}));

        let sequence = request["sequence"].as_str().unwrap();
        gateway.session().handle_text(&format!(
            r#"{{"error":0,"deviceid":"1000aa","apikey":"apikey","sequence":"{sequence}"}}"#
        ));

        loop {
            match events.recv().await.unwrap() {
                GatewayEvent::DeviceStatus { deviceid, status } => {
                    assert_eq!(deviceid, "1000aa");
                    assert_eq!(status, "OK");
                    break;
                }
                GatewayEvent::RawFrame { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn error_frames_publish_status_only() {
        let (gateway, _link) = test_gateway().await;
        let mut events = gateway.subscribe();

        gateway.session().handle_text(
            r#"{"error":503,"reason":"Device Offline","deviceid":"1000bb","params":{"state":"on"}}"#,
        );

        let GatewayEvent::RawFrame { deviceid, .. } = events.recv().await.unwrap() else {
            panic!("expected the raw frame first");
        };
        assert_eq!(deviceid, "1000bb");
        assert_eq!(
            events.recv().await.unwrap(),
            GatewayEvent::status("1000bb", "Error: Device Offline")
        );

        let device = gateway.device("1000bb").await.unwrap();
        device.shutdown().await.unwrap();
        assert!(device.record().params.is_empty());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn frames_for_unknown_devices_are_dropped() {
        let (gateway, _link) = test_gateway().await;
        let mut events = gateway.subscribe();

        gateway
            .session()
            .handle_text(r#"{"action":"update","deviceid":"ffffff","params":{"switch":"on"}}"#);
        gateway
            .session()
            .handle_text(r#"{"action":"update","deviceid":"1000aa","params":{"switch":"on"}}"#);

        // The first event belongs to the known device
        assert_eq!(events.recv().await.unwrap().deviceid(), Some("1000aa"));
    }

    #[tokio::test]
    async fn device_list_summary() {
        let (gateway, _link) = test_gateway().await;
        let mut events = gateway.subscribe();
        gateway.publish_device_list().await;

        let GatewayEvent::DeviceList(Value::Array(list)) = events.recv().await.unwrap() else {
            panic!("expected a device list");
        };
        assert_eq!(list.len(), 2);
        assert_eq!(list[1]["name"], "Hall");
    }

    #[tokio::test]
    async fn shutdown_stops_every_actor() {
        let (gateway, _link) = test_gateway().await;
        gateway.shutdown().await;
        for device in gateway.devices().await {
            assert!(!device.is_running());
        }
    }
}
