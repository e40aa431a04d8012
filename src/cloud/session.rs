// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cloud session: login, relay connection and request sending.
//!
//! A [`CloudSession`] owns one relay connection at a time. [`CloudSession::run`]
//! keeps it alive: it logs in when no credentials are cached, asks the cloud
//! for a relay host, connects, and after the connection is lost waits for the
//! reconnect cooldown before trying again. Everything the session learns is
//! reported as [`SessionEvent`]s on the channel given at construction.
//!
//! Requests are paced so that two of them are never sent closer together than
//! the configured send interval. A caller that waits for a response gets
//! [`SendOutcome::Timeout`] when none arrives in time; a timeout is not an
//! error.
//!
//! # Examples
//!
//! ```no_run
//! use ewegate::cloud::{CloudSession, RequestParams, SendOutcome};
//! use ewegate::config::CloudConfig;
//! use serde_json::json;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> ewegate::Result<()> {
//! let config = CloudConfig::new("me@example.com", "password")
//!     .with_app_credential("appid", "secret");
//! let (events_tx, mut events) = mpsc::unbounded_channel();
//! let session = CloudSession::new(config, events_tx).expect("http client");
//!
//! let runner = session.clone();
//! tokio::spawn(async move { runner.run().await });
//!
//! // Wait for the connection before sending
//! while let Some(event) = events.recv().await {
//!     if matches!(event, ewegate::cloud::SessionEvent::Connected) {
//!         break;
//!     }
//! }
//!
//! let outcome = session
//!     .send("1000abcdef", RequestParams::single("switch", json!("on")), true)
//!     .await?;
//! if let SendOutcome::Response(frame) = outcome {
//!     println!("{:?}", frame.status());
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use super::api::{AuthContext, CloudApi, nonce, timestamp};
use super::correlation::{PendingRequests, SequenceGenerator};
use super::frame::{
    DeviceFrame, HEARTBEAT_PING, IdentifyFrame, InboundFrame, RequestFrame, RequestParams,
    parse_inbound,
};
use crate::config::CloudConfig;
use crate::error::{ConnectionError, Error, ParseError, SendError};

/// What the session reports to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A login succeeded.
    Authenticated(AuthContext),
    /// The relay connection is open and identified.
    Connected,
    /// The relay connection was lost.
    Disconnected,
    /// The session is about to try connecting again.
    Reconnecting,
    /// A frame for a device arrived.
    Frame(DeviceFrame),
}

/// The result of sending a request.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The request was sent and no response was awaited.
    Sent,
    /// The response to the request.
    Response(DeviceFrame),
    /// No response arrived within the response timeout.
    Timeout,
}

/// Tasks serving one relay connection.
struct Link {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// A session with the cloud.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct CloudSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    api: CloudApi,
    auth: RwLock<Option<AuthContext>>,
    /// Outbound queue of the open connection.
    link: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    sequence: SequenceGenerator,
    pending: Mutex<PendingRequests>,
    last_send: AsyncMutex<Option<Instant>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
    reconnect: Notify,
}

impl CloudSession {
    /// Creates a session that reports to `events`.
    ///
    /// The session is idle until [`run`](Self::run) is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        config: CloudConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, reqwest::Error> {
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(SessionInner {
                api: CloudApi::new(config)?,
                auth: RwLock::new(None),
                link: RwLock::new(None),
                sequence: SequenceGenerator::new(),
                pending: Mutex::new(PendingRequests::new()),
                last_send: AsyncMutex::new(None),
                heartbeat: Mutex::new(None),
                events,
                connected: AtomicBool::new(false),
                shutdown,
                reconnect: Notify::new(),
            }),
        })
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &CloudConfig {
        self.inner.api.config()
    }

    /// Returns the HTTP client of the session.
    #[must_use]
    pub fn api(&self) -> &CloudApi {
        &self.inner.api
    }

    /// Returns the cached login, if any.
    #[must_use]
    pub fn auth(&self) -> Option<AuthContext> {
        self.inner.auth.read().clone()
    }

    /// Returns whether the relay connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Drops the current connection and connects again without waiting for
    /// the cooldown.
    pub fn request_reconnect(&self) {
        tracing::info!("Reconnect requested");
        self.inner.reconnect.notify_one();
    }

    /// Stops [`run`](Self::run) and closes the connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Keeps the relay connection alive until [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let cooldown = self.config().reconnect_cooldown;

        while !*shutdown.borrow() {
            match self.establish().await {
                Ok(link) => {
                    let Link { mut reader, writer } = link;
                    tokio::select! {
                        _ = &mut reader => {
                            tracing::warn!("Relay connection lost");
                            writer.abort();
                        }
                        () = self.inner.reconnect.notified() => {
                            reader.abort();
                            writer.abort();
                            self.on_link_closed();
                            self.emit(SessionEvent::Reconnecting);
                            continue;
                        }
                        _ = shutdown.changed() => {
                            reader.abort();
                            writer.abort();
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to connect to the cloud");
                }
            }

            tracing::info!(cooldown_secs = cooldown.as_secs(), "Waiting before reconnecting");
            tokio::select! {
                () = sleep(cooldown) => {}
                () = self.inner.reconnect.notified() => {}
                _ = shutdown.changed() => break,
            }
            self.emit(SessionEvent::Reconnecting);
        }

        self.on_link_closed();
        tracing::info!("Cloud session stopped");
    }

    /// Sends a request to a device.
    ///
    /// With `wait` set, resolves to the response or to
    /// [`SendOutcome::Timeout`] after the configured response timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] when no connection is open and
    /// [`SendError::ConnectionClosed`] when it closes before a response.
    pub async fn send(
        &self,
        deviceid: &str,
        params: RequestParams,
        wait: bool,
    ) -> Result<SendOutcome, SendError> {
        let response_timeout = self.config().response_timeout;
        self.send_with_timeout(deviceid, params, wait, response_timeout)
            .await
    }

    /// Like [`send`](Self::send) with an explicit response timeout.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_with_timeout(
        &self,
        deviceid: &str,
        params: RequestParams,
        wait: bool,
        response_timeout: Duration,
    ) -> Result<SendOutcome, SendError> {
        let apikey = self
            .inner
            .auth
            .read()
            .as_ref()
            .map(|context| context.apikey.clone())
            .ok_or(SendError::NotConnected)?;

        self.pace().await;

        let link = self
            .inner
            .link
            .read()
            .clone()
            .ok_or(SendError::NotConnected)?;

        let sequence = self.inner.sequence.next();
        let text = serde_json::to_string(&RequestFrame::new(
            deviceid,
            &apikey,
            &params,
            sequence,
            timestamp(),
        ))?;
        let waiter = wait.then(|| self.inner.pending.lock().register(sequence));

        tracing::debug!(
            deviceid,
            sequence,
            action = params.action(),
            "Sending request"
        );
        if link.send(Message::Text(text)).is_err() {
            self.inner.pending.lock().cancel(sequence);
            return Err(SendError::ConnectionClosed);
        }

        let Some(waiter) = waiter else {
            return Ok(SendOutcome::Sent);
        };

        match tokio::time::timeout(response_timeout, waiter).await {
            Ok(Ok(frame)) => Ok(SendOutcome::Response(frame)),
            Ok(Err(_)) => Err(SendError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.lock().cancel(sequence);
                tracing::warn!(deviceid, sequence, "No response, device is not updating");
                Ok(SendOutcome::Timeout)
            }
        }
    }

    /// Waits until the send interval since the previous request has passed.
    async fn pace(&self) {
        let interval = self.config().send_interval;
        let mut last = self.inner.last_send.lock().await;
        if let Some(previous) = *last {
            sleep_until(previous + interval).await;
        }
        *last = Some(Instant::now());
    }

    /// Logs in if needed and opens a relay connection.
    async fn establish(&self) -> Result<Link, Error> {
        let context = match self.auth() {
            Some(context) => context,
            None => {
                let config = self.config();
                let context = self
                    .inner
                    .api
                    .authenticate(&config.identity, &config.password, config.credential_index)
                    .await?;
                *self.inner.auth.write() = Some(context.clone());
                self.emit(SessionEvent::Authenticated(context.clone()));
                context
            }
        };

        match self.connect(&context).await {
            Err(ConnectionError::Unauthorized) => {
                tracing::warn!("Token refused, logging in again on the next attempt");
                self.inner.auth.write().take();
                Err(ConnectionError::Unauthorized.into())
            }
            other => other.map_err(Error::from),
        }
    }

    async fn connect(&self, context: &AuthContext) -> Result<Link, ConnectionError> {
        let relay = self.inner.api.dispatch(context).await?;
        let url = relay.url(&self.config().relay_scheme);
        tracing::info!(url = %url, "Connecting to relay");

        let (stream, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut source) = stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::warn!(error = %e, "Failed to write to relay");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let nonce = nonce();
        let identify = IdentifyFrame::new(
            &context.token,
            &context.apikey,
            &context.appid,
            &nonce,
            timestamp(),
            self.inner.sequence.next(),
        );
        let text = serde_json::to_string(&identify).map_err(ParseError::from)?;
        if tx.send(Message::Text(text)).is_err() {
            writer.abort();
            return Err(tungstenite::Error::ConnectionClosed.into());
        }

        *self.inner.link.write() = Some(tx);
        self.inner.connected.store(true, Ordering::Release);
        tracing::info!(domain = %relay.domain, "Connected to relay");
        self.emit(SessionEvent::Connected);

        let session = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => session.handle_text(&text),
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "Relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Relay connection failed");
                        break;
                    }
                }
            }
            session.on_link_closed();
        });

        Ok(Link { reader, writer })
    }

    /// Handles one inbound text frame.
    pub(crate) fn handle_text(&self, text: &str) {
        match parse_inbound(text) {
            Ok(InboundFrame::Pong) => tracing::trace!("Heartbeat acknowledged"),
            Ok(InboundFrame::Control { error, heartbeat }) => {
                if error != 0 {
                    tracing::warn!(error, "Relay reported an error");
                }
                if let Some(interval) = heartbeat {
                    self.start_heartbeat(interval);
                }
            }
            Ok(InboundFrame::Device(frame)) => {
                if frame.error.is_some() {
                    let completed = self.inner.pending.lock().resolve(&frame);
                    tracing::trace!(deviceid = %frame.deviceid, completed, "Reply received");
                }
                self.emit(SessionEvent::Frame(frame));
            }
            Ok(InboundFrame::Other(value)) => {
                tracing::debug!(frame = %value, "Ignoring unrecognised frame");
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed frame"),
        }
    }

    /// Starts sending heartbeats, unless they already run.
    fn start_heartbeat(&self, interval: Duration) {
        let mut heartbeat = self.inner.heartbeat.lock();
        if heartbeat.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Some(link) = self.inner.link.read().clone() else {
            return;
        };

        tracing::debug!(interval_secs = interval.as_secs(), "Starting heartbeat");
        *heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if link.send(Message::Text(HEARTBEAT_PING.to_string())).is_err() {
                    break;
                }
            }
        }));
    }

    /// Forgets the current connection.
    ///
    /// Waiting callers see the connection as closed.
    fn on_link_closed(&self) {
        self.inner.link.write().take();
        if let Some(task) = self.inner.heartbeat.lock().take() {
            task.abort();
        }
        self.inner.pending.lock().clear();
        if self.inner.connected.swap(false, Ordering::AcqRel) {
            tracing::info!("Disconnected from relay");
            self.emit(SessionEvent::Disconnected);
        }
    }

    fn emit(&self, event: SessionEvent) {
        // The owner may already be gone during shutdown
        let _ = self.inner.events.send(event);
    }

    /// Installs a fake connection and returns what would be written to it.
    #[cfg(test)]
    pub(crate) fn attach_test_link(
        &self,
        context: AuthContext,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.auth.write() = Some(context);
        *self.inner.link.write() = Some(tx);
        self.inner.connected.store(true, Ordering::Release);
        rx
    }

    #[cfg(test)]
    pub(crate) fn close_test_link(&self) {
        self.on_link_closed();
    }
}

impl std::fmt::Debug for CloudSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSession")
            .field("region", &self.config().region)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
