// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT bus connection.
//!
//! [`MqttBus`] keeps one connection to an MQTT broker. Messages received on
//! the subscribed filters are forwarded to a channel, and the bus
//! implements [`Publisher`] so a [`super::Bridge`] can publish through it.
//! Subscriptions are renewed after every reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{BusMessage, Publisher};
use crate::error::BusError;

/// Global counter for generating unique client IDs.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Delay before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the inbound message channel.
const INBOUND_CAPACITY: usize = 100;

/// Capacity of the client's request queue; publishers wait when it is full.
const REQUEST_CAPACITY: usize = 64;

/// Configuration for an MQTT bus connection.
#[derive(Debug, Clone)]
struct MqttBusConfig {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    connection_timeout: Duration,
    client_id_prefix: String,
    filters: Vec<String>,
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            credentials: None,
            keep_alive: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            client_id_prefix: "ewegate".to_string(),
            filters: Vec::new(),
        }
    }
}

/// A connection to an MQTT broker.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct MqttBus {
    inner: Arc<MqttBusInner>,
}

struct MqttBusInner {
    client: AsyncClient,
    config: MqttBusConfig,
    connected: AtomicBool,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Creates a builder for an MQTT bus connection.
    #[must_use]
    pub fn builder() -> MqttBusBuilder {
        MqttBusBuilder::default()
    }

    /// Returns whether the broker connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Returns the broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.config.host
    }

    /// Returns the broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    /// Returns the subscribed topic filters.
    #[must_use]
    pub fn filters(&self) -> &[String] {
        &self.inner.config.filters
    }

    /// Disconnects from the broker and stops the event loop.
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect request cannot be queued.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        tracing::info!(
            host = %self.inner.config.host,
            port = %self.inner.config.port,
            "Disconnecting from MQTT broker"
        );
        self.inner.client.disconnect().await?;
        self.inner.connected.store(false, Ordering::Release);
        if let Some(task) = self.inner.event_loop.lock().take() {
            task.abort();
        }
        Ok(())
    }

    fn subscribe_all(&self) {
        for filter in &self.inner.config.filters {
            match self.inner.client.try_subscribe(filter, QoS::AtLeastOnce) {
                Ok(()) => tracing::debug!(filter = %filter, "Subscribing"),
                Err(e) => tracing::warn!(filter = %filter, error = %e, "Failed to subscribe"),
            }
        }
    }
}

impl Publisher for MqttBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        tracing::debug!(topic, payload = %payload, "Publishing");
        self.inner
            .client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(BusError::Mqtt)
    }
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Builder for an MQTT bus connection.
///
/// # Examples
///
/// ```no_run
/// use ewegate::bridge::MqttBus;
/// use std::time::Duration;
///
/// # async fn example() -> ewegate::Result<()> {
/// let (bus, mut inbound) = MqttBus::builder()
///     .host("192.168.1.50")
///     .credentials("user", "password")
///     .subscribe("/ewelink_command/#")
///     .keep_alive(Duration::from_secs(60))
///     .build()
///     .await?;
///
/// while let Some(message) = inbound.recv().await {
///     println!("{}: {}", message.topic, message.payload);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MqttBusBuilder {
    config: MqttBusConfig,
}

impl MqttBusBuilder {
    /// Sets the broker host address.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the broker port (default: 1883).
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the keep-alive interval (default: 30 seconds).
    #[must_use]
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.config.keep_alive = duration;
        self
    }

    /// Sets the connection timeout (default: 10 seconds).
    #[must_use]
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connection_timeout = duration;
        self
    }

    /// Sets the client id prefix (default: `ewegate`).
    #[must_use]
    pub fn client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.client_id_prefix = prefix.into();
        self
    }

    /// Adds a topic filter to subscribe to.
    #[must_use]
    pub fn subscribe(mut self, filter: impl Into<String>) -> Self {
        self.config.filters.push(filter.into());
        self
    }

    /// Connects to the broker.
    ///
    /// Returns the bus and a receiver for messages on the subscribed
    /// filters.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Host is not set
    /// - Connection fails
    /// - Connection times out
    pub async fn build(self) -> Result<(MqttBus, mpsc::Receiver<BusMessage>), BusError> {
        if self.config.host.is_empty() {
            return Err(BusError::MissingHost);
        }

        let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let client_id = format!(
            "{}_{}_{}",
            self.config.client_id_prefix,
            std::process::id(),
            counter
        );

        let mut options = MqttOptions::new(&client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        if let Some((ref username, ref password)) = self.config.credentials {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let bus = MqttBus {
            inner: Arc::new(MqttBusInner {
                client,
                config: self.config.clone(),
                connected: AtomicBool::new(false),
                event_loop: Mutex::new(None),
            }),
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (connack_tx, connack_rx) = oneshot::channel();
        let task = tokio::spawn(handle_bus_events(
            event_loop,
            bus.clone(),
            inbound_tx,
            connack_tx,
        ));
        *bus.inner.event_loop.lock() = Some(task);

        let timeout = self.config.connection_timeout;
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(())) => {
                tracing::info!(
                    host = %self.config.host,
                    port = %self.config.port,
                    client_id = %client_id,
                    "Connected to MQTT broker"
                );
                Ok((bus, inbound_rx))
            }
            Ok(Err(_)) => {
                bus.abort();
                Err(BusError::ConnectionFailed(
                    "MQTT event loop terminated unexpectedly".to_string(),
                ))
            }
            Err(_) => {
                bus.abort();
                Err(BusError::ConnectionFailed(format!(
                    "MQTT connection timeout after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }
}

impl MqttBus {
    fn abort(&self) {
        if let Some(task) = self.inner.event_loop.lock().take() {
            task.abort();
        }
    }
}

/// Drives the MQTT event loop.
///
/// Connection errors are retried after [`RECONNECT_DELAY`] until the first
/// connection has been acknowledged; before that the caller is waiting and
/// any error ends the loop.
async fn handle_bus_events(
    mut event_loop: EventLoop,
    bus: MqttBus,
    inbound: mpsc::Sender<BusMessage>,
    connack_tx: oneshot::Sender<()>,
) {
    let mut connack_tx = Some(connack_tx);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "MQTT broker connected");
                bus.inner.connected.store(true, Ordering::Release);
                bus.subscribe_all();
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(());
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::debug!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Ok(payload) = String::from_utf8(publish.payload.to_vec()) else {
                    tracing::warn!(topic = %publish.topic, "Ignoring non UTF-8 payload");
                    continue;
                };
                tracing::debug!(topic = %publish.topic, payload = %payload, "MQTT message received");
                if inbound
                    .send(BusMessage::new(publish.topic, payload))
                    .await
                    .is_err()
                {
                    tracing::debug!("Inbound receiver dropped, stopping MQTT event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT broker disconnected");
                bus.inner.connected.store(false, Ordering::Release);
            }
            Ok(_) => {}
            Err(e) => {
                bus.inner.connected.store(false, Ordering::Release);
                if connack_tx.is_some() {
                    tracing::error!(error = %e, "MQTT connection failed");
                    break;
                }
                tracing::warn!(error = %e, "MQTT connection lost, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_default_values() {
        let builder = MqttBusBuilder::default();
        assert_eq!(builder.config.port, 1883);
        assert!(builder.config.host.is_empty());
        assert!(builder.config.credentials.is_none());
        assert!(builder.config.filters.is_empty());
        assert_eq!(builder.config.client_id_prefix, "ewegate");
        assert_eq!(builder.config.keep_alive, Duration::from_secs(30));
        assert_eq!(builder.config.connection_timeout, Duration::from_secs(10));
    }

    #[test]
    fn builder_chain() {
        let builder = MqttBusBuilder::default()
            .host("192.168.1.50")
            .port(8883)
            .credentials("admin", "secret")
            .keep_alive(Duration::from_secs(45))
            .connection_timeout(Duration::from_secs(15))
            .client_id_prefix("bridge")
            .subscribe("/ewelink_command/#")
            .subscribe("other/#");

        assert_eq!(builder.config.host, "192.168.1.50");
        assert_eq!(builder.config.port, 8883);
        assert_eq!(
            builder.config.credentials,
            Some(("admin".to_string(), "secret".to_string()))
        );
        assert_eq!(builder.config.keep_alive, Duration::from_secs(45));
        assert_eq!(builder.config.connection_timeout, Duration::from_secs(15));
        assert_eq!(builder.config.client_id_prefix, "bridge");
        assert_eq!(builder.config.filters, vec!["/ewelink_command/#", "other/#"]);
    }

    #[tokio::test]
    async fn builder_missing_host_fails() {
        let result = MqttBusBuilder::default().build().await;
        assert!(matches!(result, Err(BusError::MissingHost)));
    }

    #[tokio::test]
    async fn unreachable_broker_fails() {
        let result = MqttBusBuilder::default()
            .host("127.0.0.1")
            .port(1)
            .connection_timeout(Duration::from_secs(2))
            .build()
            .await;
        assert!(matches!(result, Err(BusError::ConnectionFailed(_))));
    }
}
