// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-device actor.
//!
//! Each device runs one task that drains its own queue, so commands for a
//! device execute one at a time and in the order they were enqueued.
//! Notifications from the cloud travel through the same queue and are
//! merged into the device record, which is published through a
//! [`watch`] channel.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};

use super::command::{CommandEnvelope, DeviceCommand, parse_command};
use super::{DeviceModel, DeviceRecord, ParameterDescriptor};
use crate::cloud::{CloudSession, DeviceFrame, FrameKind, RequestParams, SendOutcome};
use crate::error::{Error, SendError};
use crate::event::{EventBus, GatewayEvent};
use crate::timer::{TimerContext, build_timer, delete_timers, describe_timer, parse_add_timer};

/// Sends requests to devices on behalf of their actors.
pub trait Transport: Send + Sync + 'static {
    /// Sends `params` to a device, optionally waiting for the response.
    fn send(
        &self,
        deviceid: &str,
        params: RequestParams,
        wait: bool,
    ) -> impl Future<Output = Result<SendOutcome, SendError>> + Send;
}

impl Transport for CloudSession {
    fn send(
        &self,
        deviceid: &str,
        params: RequestParams,
        wait: bool,
    ) -> impl Future<Output = Result<SendOutcome, SendError>> + Send {
        CloudSession::send(self, deviceid, params, wait)
    }
}

enum ActorMessage {
    Command(CommandEnvelope),
    Request(DeviceCommand),
    Notification(DeviceFrame),
    Shutdown(oneshot::Sender<()>),
}

/// A handle to a running device actor.
///
/// Cheap to clone; every clone feeds the same queue.
///
/// # Examples
///
/// ```no_run
/// use ewegate::device::{CommandEnvelope, DeviceHandle};
/// use serde_json::json;
///
/// # async fn example(device: DeviceHandle) -> ewegate::Result<()> {
/// device.enqueue(CommandEnvelope::new("set_switch", json!("on")))?;
/// device.enqueue(CommandEnvelope::new("add_timer", json!("delay 30 off")))?;
///
/// // Waits until both commands ran
/// device.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    deviceid: String,
    tx: mpsc::UnboundedSender<ActorMessage>,
    state: watch::Receiver<DeviceRecord>,
}

impl std::fmt::Debug for ActorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(envelope) => f.debug_tuple("Command").field(envelope).finish(),
            Self::Request(command) => f.debug_tuple("Request").field(command).finish(),
            Self::Notification(frame) => f.debug_tuple("Notification").field(frame).finish(),
            Self::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

impl DeviceHandle {
    /// Starts an actor for `record` and returns its handle.
    pub fn spawn<T: Transport>(
        record: DeviceRecord,
        model: Arc<dyn DeviceModel>,
        transport: T,
        events: EventBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(record.clone());

        let mut descriptor = model.descriptor();
        descriptor.register_unseen(&record.params);

        tracing::debug!(
            deviceid = %record.deviceid,
            model = model.name(),
            product_model = %record.product_model,
            "Starting device actor"
        );

        let deviceid = record.deviceid.clone();
        let actor = DeviceActor {
            record,
            model,
            descriptor,
            transport,
            events,
            state: state_tx,
            published: HashMap::new(),
        };
        tokio::spawn(actor.run(rx));

        Self {
            deviceid,
            tx,
            state,
        }
    }

    /// Returns the device id.
    #[must_use]
    pub fn deviceid(&self) -> &str {
        &self.deviceid
    }

    /// Returns a snapshot of the device record.
    #[must_use]
    pub fn record(&self) -> DeviceRecord {
        self.state.borrow().clone()
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    /// Returns a receiver that observes every record update.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<DeviceRecord> {
        self.state.clone()
    }

    /// Returns whether the actor still accepts messages.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queues a command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActorStopped`] if the actor has shut down.
    pub fn enqueue(&self, envelope: CommandEnvelope) -> Result<(), Error> {
        self.post(ActorMessage::Command(envelope))
    }

    /// Queues a parameter change. `name` may be a device key or an alias;
    /// unknown names are sent anyway.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActorStopped`] if the actor has shut down.
    pub fn set_parameter(&self, name: impl Into<String>, value: Value, wait: bool) -> Result<(), Error> {
        self.post(ActorMessage::Request(DeviceCommand::SetParameter {
            name: name.into(),
            value,
            wait,
        }))
    }

    /// Queues a read of the named parameters; an empty list reads all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActorStopped`] if the actor has shut down.
    pub fn get_parameter(&self, names: Vec<String>) -> Result<(), Error> {
        self.post(ActorMessage::Request(DeviceCommand::Query(names)))
    }

    /// Queues a read of every parameter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActorStopped`] if the actor has shut down.
    pub fn refresh(&self) -> Result<(), Error> {
        self.get_parameter(Vec::new())
    }

    /// Queues a frame received for this device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActorStopped`] if the actor has shut down.
    pub fn notify(&self, frame: DeviceFrame) -> Result<(), Error> {
        self.post(ActorMessage::Notification(frame))
    }

    /// Stops the actor after everything queued before this call ran.
    ///
    /// Messages queued after the call are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActorStopped`] if the actor had already stopped.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let (ack, done) = oneshot::channel();
        self.post(ActorMessage::Shutdown(ack))?;
        done.await
            .map_err(|_| Error::ActorStopped(self.deviceid.clone()))
    }

    fn post(&self, message: ActorMessage) -> Result<(), Error> {
        self.tx
            .send(message)
            .map_err(|_| Error::ActorStopped(self.deviceid.clone()))
    }
}

struct DeviceActor<T> {
    record: DeviceRecord,
    model: Arc<dyn DeviceModel>,
    descriptor: ParameterDescriptor,
    transport: T,
    events: EventBus,
    state: watch::Sender<DeviceRecord>,
    /// Last value published per external parameter name.
    published: HashMap<String, Value>,
}

impl<T: Transport> DeviceActor<T> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ActorMessage>) {
        while let Some(message) = rx.recv().await {
            let (label, result) = match message {
                ActorMessage::Command(envelope) => {
                    let label = envelope.command.clone();
                    let result = AssertUnwindSafe(self.execute_envelope(envelope))
                        .catch_unwind()
                        .await;
                    (label, result)
                }
                ActorMessage::Request(command) => {
                    let result = AssertUnwindSafe(self.execute(command))
                        .catch_unwind()
                        .await;
                    ("request".to_string(), result)
                }
                ActorMessage::Notification(frame) => {
                    let result = AssertUnwindSafe(self.handle_notification(frame))
                        .catch_unwind()
                        .await
                        .map(|()| Ok(()));
                    ("notification".to_string(), result)
                }
                ActorMessage::Shutdown(ack) => {
                    rx.close();
                    let mut discarded = 0_usize;
                    while rx.try_recv().is_ok() {
                        discarded += 1;
                    }
                    tracing::debug!(
                        deviceid = %self.record.deviceid,
                        discarded,
                        "Device actor stopped"
                    );
                    let _ = ack.send(());
                    return;
                }
            };

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.report_error(&label, &e),
                Err(_) => {
                    tracing::error!(
                        deviceid = %self.record.deviceid,
                        command = %label,
                        "Device handler panicked"
                    );
                }
            }
        }
    }

    fn report_error(&self, command: &str, error: &Error) {
        tracing::warn!(
            deviceid = %self.record.deviceid,
            command,
            error = %error,
            "Command failed"
        );
        let reason = match error {
            Error::Validation(e) => e.to_string(),
            other => other.to_string(),
        };
        self.events.publish(GatewayEvent::status(
            &self.record.deviceid,
            format!("Error: {reason}"),
        ));
    }

    async fn execute_envelope(&mut self, envelope: CommandEnvelope) -> Result<(), Error> {
        tracing::info!(
            deviceid = %self.record.deviceid,
            command = %envelope.command,
            args = %envelope.args,
            "Received command"
        );
        let command = parse_command(&envelope, &self.descriptor)?;
        self.execute(command).await
    }

    async fn execute(&mut self, command: DeviceCommand) -> Result<(), Error> {
        match command {
            DeviceCommand::SetParameter { name, value, wait } => {
                self.set_parameter(&name, value, wait).await
            }
            DeviceCommand::SendJson(params) => {
                self.send(RequestParams::Update(params), false).await?;
                Ok(())
            }
            DeviceCommand::Query(names) => {
                self.send(RequestParams::Query(names), false).await?;
                Ok(())
            }
            DeviceCommand::AddTimer(args) => self.add_timer(&args).await,
            DeviceCommand::ListTimers => self.list_timers().await,
            DeviceCommand::DeleteTimers(indices) => self.delete_timers(&indices).await,
            DeviceCommand::ClearTimers => {
                self.send(RequestParams::single("timers", Value::Array(Vec::new())), false)
                    .await?;
                Ok(())
            }
            DeviceCommand::Other { command, args } => {
                match self.model.handle_command(&command, &args) {
                    Some(params) => {
                        self.send(RequestParams::Update(params?), false).await?;
                    }
                    None => {
                        tracing::warn!(
                            deviceid = %self.record.deviceid,
                            command = %command,
                            "Command not found"
                        );
                    }
                }
                Ok(())
            }
        }
    }

    async fn set_parameter(&mut self, name: &str, value: Value, wait: bool) -> Result<(), Error> {
        let key = if let Some(key) = self.descriptor.resolve(name) {
            key.to_string()
        } else {
            tracing::warn!(
                deviceid = %self.record.deviceid,
                param = name,
                "Parameter not in device settings, sending anyway"
            );
            name.to_string()
        };

        let value = self.descriptor.coerce(&key, value)?;
        let value = self.model.transform_parameter(&key, value)?;
        tracing::debug!(deviceid = %self.record.deviceid, param = %key, value = %value, "Setting parameter");
        self.send(RequestParams::single(key, value), wait).await?;
        Ok(())
    }

    async fn send(&mut self, params: RequestParams, wait: bool) -> Result<SendOutcome, Error> {
        let outcome = self
            .transport
            .send(&self.record.deviceid, params, wait)
            .await?;
        if let SendOutcome::Response(frame) = &outcome {
            if let (false, Some(params)) = (frame.is_error(), &frame.params) {
                self.apply(params, FrameKind::Reply);
            }
        }
        Ok(outcome)
    }

    /// Reads every parameter so that timer edits start from the device's
    /// current list.
    async fn refresh_timers(&mut self) -> Result<Vec<Value>, Error> {
        if let SendOutcome::Timeout = self.send(RequestParams::query_all(), true).await? {
            tracing::warn!(
                deviceid = %self.record.deviceid,
                "Using last known timers"
            );
        }
        Ok(self.record.timers())
    }

    async fn add_timer(&mut self, args: &str) -> Result<(), Error> {
        let channels = self.model.channels();
        let request = parse_add_timer(args, channels)?;
        let existing = self.refresh_timers().await?;

        let context = TimerContext {
            existing: &existing,
            channels,
            main_switch: self.model.has_main_switch(),
            supported: self.model.supported_timers(),
        };
        let entry = build_timer(&request, &context, Utc::now())?;
        tracing::info!(
            deviceid = %self.record.deviceid,
            kind = %entry.kind,
            at = %entry.at,
            "Adding timer"
        );

        let mut timers = existing;
        timers.push(entry.to_value());
        self.send(RequestParams::single("timers", Value::Array(timers)), false)
            .await?;
        Ok(())
    }

    async fn list_timers(&mut self) -> Result<(), Error> {
        let timers = self.refresh_timers().await?;
        if timers.is_empty() {
            tracing::info!(deviceid = %self.record.deviceid, "No timers set");
        }
        for (index, timer) in timers.iter().enumerate() {
            tracing::info!(
                deviceid = %self.record.deviceid,
                index,
                timer = %describe_timer(timer),
                "Timer"
            );
        }
        Ok(())
    }

    async fn delete_timers(&mut self, indices: &str) -> Result<(), Error> {
        let existing = self.refresh_timers().await?;
        let remaining = delete_timers(&existing, indices)?;
        tracing::info!(
            deviceid = %self.record.deviceid,
            removed = existing.len() - remaining.len(),
            "Deleting timers"
        );
        self.send(
            RequestParams::single("timers", Value::Array(remaining)),
            false,
        )
        .await?;
        Ok(())
    }

    async fn handle_notification(&mut self, frame: DeviceFrame) {
        if frame.is_error() {
            tracing::debug!(deviceid = %self.record.deviceid, "Not merging error frame");
            return;
        }
        let Some(params) = frame.params.as_ref() else {
            return;
        };

        let kind = frame.kind();
        self.apply(params, kind);

        if kind == FrameKind::Sysmsg && params.get("online") == Some(&Value::Bool(true)) {
            tracing::info!(deviceid = %self.record.deviceid, "Device came online, refreshing");
            if let Err(e) = self.send(RequestParams::query_all(), false).await {
                tracing::warn!(deviceid = %self.record.deviceid, error = %e, "Refresh failed");
            }
        }
    }

    /// Merges parameters and publishes every value that changed.
    fn apply(&mut self, params: &Map<String, Value>, kind: FrameKind) {
        self.record.merge(params);
        if let Some(online) = params.get("online").and_then(Value::as_bool) {
            self.record.online = online;
        }
        if kind != FrameKind::Sysmsg {
            self.descriptor.register_unseen(params);
        }

        let mut changed = false;
        for key in params.keys() {
            let Some(value) = self.record.params.get(key) else {
                continue;
            };
            let alias = self.descriptor.alias_for(key);
            if self.published.get(alias) == Some(value) {
                continue;
            }
            self.published.insert(alias.to_string(), value.clone());
            self.events.publish(GatewayEvent::parameter(
                &self.record.deviceid,
                alias,
                value.clone(),
            ));
            changed = true;
        }

        if changed {
            let now = Utc::now();
            self.record.last_update = Some(now);
            self.events.publish(GatewayEvent::parameter(
                &self.record.deviceid,
                "last_update",
                Value::String(now.to_rfc3339()),
            ));
        }
        self.state.send_replace(self.record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FourChannelSwitch, ModelRegistry};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast;

    #[derive(Clone, Default)]
    struct MockTransport {
        sent: Arc<Mutex<Vec<(RequestParams, bool)>>>,
        responses: Arc<Mutex<VecDeque<SendOutcome>>>,
        panic_next: Arc<AtomicBool>,
    }

    impl MockTransport {
        fn panic_on_next_send(&self) {
            self.panic_next.store(true, Ordering::SeqCst);
        }

        fn respond_with(&self, outcome: SendOutcome) {
            self.responses.lock().push_back(outcome);
        }

        fn sent(&self) -> Vec<(RequestParams, bool)> {
            self.sent.lock().clone()
        }
    }

    impl Transport for MockTransport {
        async fn send(
            &self,
            _deviceid: &str,
            params: RequestParams,
            wait: bool,
        ) -> Result<SendOutcome, SendError> {
            if self.panic_next.swap(false, Ordering::SeqCst) {
                panic!("transport failure");
            }
            self.sent.lock().push((params, wait));
            if wait {
                Ok(self
                    .responses
                    .lock()
                    .pop_front()
                    .unwrap_or(SendOutcome::Timeout))
            } else {
                Ok(SendOutcome::Sent)
            }
        }
    }

    fn frame(action: Option<&str>, params: Value) -> DeviceFrame {
        DeviceFrame {
            deviceid: "1000ab".to_string(),
            action: action.map(str::to_string),
            error: None,
            reason: None,
            sequence: None,
            params: params.as_object().cloned(),
            raw: params.to_string(),
        }
    }

    fn spawn(product_model: &str, params: Value) -> (DeviceHandle, MockTransport, broadcast::Receiver<GatewayEvent>) {
        let transport = MockTransport::default();
        let events = EventBus::new();
        let rx = events.subscribe();
        let record = DeviceRecord::new("1000ab", "Lamp", product_model)
            .with_params(params.as_object().cloned().unwrap_or_default());
        let model = ModelRegistry::with_builtin().lookup(product_model);
        let handle = DeviceHandle::spawn(record, model, transport.clone(), events);
        (handle, transport, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<GatewayEvent>) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn changed_params(events: &[GatewayEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                GatewayEvent::ParameterChanged { param, .. } => Some(param.clone()),
                _ => None,
            })
            .collect()
    }

    // ========================================================================
    // Command ordering and parameters
    // ========================================================================

    #[tokio::test]
    async fn commands_run_in_order() {
        let (device, transport, _events) = spawn("Basic", json!({}));
        for value in ["on", "off", "on", "off"] {
            device
                .enqueue(CommandEnvelope::new("set_switch", json!(value)))
                .unwrap();
        }
        device.shutdown().await.unwrap();

        let sent: Vec<Value> = transport
            .sent()
            .into_iter()
            .map(|(params, _)| match params {
                RequestParams::Update(p) => p["switch"].clone(),
                RequestParams::Query(_) => panic!("unexpected query"),
            })
            .collect();
        assert_eq!(sent, vec![json!("on"), json!("off"), json!("on"), json!("off")]);
    }

    #[tokio::test]
    async fn alias_resolves_and_numeric_keys_are_coerced() {
        let (device, transport, _events) = spawn("B1", json!({}));
        device.enqueue(CommandEnvelope::new("mode", json!("2"))).unwrap();
        device.enqueue(CommandEnvelope::new("set_red", json!(200))).unwrap();
        device.shutdown().await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0].0, RequestParams::single("zyx_mode", json!(2)));
        assert_eq!(sent[1].0, RequestParams::single("channel2", json!(200)));
    }

    #[tokio::test]
    async fn unknown_parameter_is_sent_anyway() {
        let (device, transport, _events) = spawn("Basic", json!({}));
        device.set_parameter("mystery", json!("x"), false).unwrap();
        device.shutdown().await.unwrap();
        assert_eq!(transport.sent()[0].0, RequestParams::single("mystery", json!("x")));
    }

    #[tokio::test]
    async fn validation_errors_are_published_and_nothing_is_sent() {
        let (device, transport, mut events) = spawn("B1", json!({}));
        device.enqueue(CommandEnvelope::new("mode", json!("bright"))).unwrap();
        device.enqueue(CommandEnvelope::new("send_json", json!("{broken"))).unwrap();
        device.shutdown().await.unwrap();

        assert!(transport.sent().is_empty());
        let statuses: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                GatewayEvent::DeviceStatus { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|status| status.starts_with("Error: ")));
    }

    #[tokio::test]
    async fn composite_parameter_rejects_partial_input() {
        let (device, transport, _events) = spawn("4CH Pro", json!({}));
        device.enqueue(CommandEnvelope::new("switches", json!("0 on 1"))).unwrap();
        device.enqueue(CommandEnvelope::new("switches", json!("0 on 1 off"))).unwrap();
        device.shutdown().await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].0,
            RequestParams::single(
                "switches",
                json!([{"outlet": 0, "switch": "on"}, {"outlet": 1, "switch": "off"}])
            )
        );
        assert_eq!(FourChannelSwitch.channels(), Some(4));
    }

    #[tokio::test]
    async fn composite_list_payload_is_checked_before_sending() {
        let (device, transport, mut events) = spawn("4CH Pro", json!({}));
        device
            .enqueue(CommandEnvelope::new(
                "switches",
                json!([{"outlet": 9, "switch": "maybe"}, 7]),
            ))
            .unwrap();
        device.shutdown().await.unwrap();

        assert!(transport.sent().is_empty());
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            GatewayEvent::DeviceStatus { status, .. } if status.starts_with("Error: ")
        )));
    }

    #[tokio::test]
    async fn panicking_handler_keeps_actor_running() {
        let (device, transport, _events) = spawn("Basic", json!({}));
        transport.panic_on_next_send();
        device
            .enqueue(CommandEnvelope::new("set_switch", json!("on")))
            .unwrap();
        device
            .enqueue(CommandEnvelope::new("set_switch", json!("off")))
            .unwrap();
        device.shutdown().await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, RequestParams::single("switch", json!("off")));
    }

    #[tokio::test]
    async fn variant_commands_and_unknown_commands() {
        let (device, transport, _events) = spawn("TH16", json!({}));
        device.enqueue(CommandEnvelope::new("set_manual", Value::Null)).unwrap();
        device.enqueue(CommandEnvelope::new("do_a_barrel_roll", Value::Null)).unwrap();
        device.shutdown().await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let RequestParams::Update(params) = &sent[0].0 else {
            panic!("expected an update");
        };
        assert_eq!(params["deviceType"], "normal");
    }

    #[tokio::test]
    async fn shutdown_discards_later_messages() {
        let (device, _transport, _events) = spawn("Basic", json!({}));
        device.shutdown().await.unwrap();
        assert!(!device.is_running());
        assert!(matches!(
            device.enqueue(CommandEnvelope::new("set_switch", json!("on"))),
            Err(Error::ActorStopped(_))
        ));
    }

    // ========================================================================
    // Timers
    // ========================================================================

    #[tokio::test]
    async fn add_timer_appends_to_refreshed_list() {
        let (device, transport, _events) = spawn("Default", json!({}));
        let mut reply = frame(None, json!({"timers": [{"at": "2023-05-01T00:00:00Z", "type": "once"}]}));
        reply.error = Some(0);
        transport.respond_with(SendOutcome::Response(reply));

        device
            .enqueue(CommandEnvelope::new("add_timer", json!("once 2024-01-01T00:00:00Z on")))
            .unwrap();
        device.shutdown().await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0], (RequestParams::query_all(), true));
        let RequestParams::Update(params) = &sent[1].0 else {
            panic!("expected an update");
        };
        let timers = params["timers"].as_array().unwrap();
        assert_eq!(timers.len(), 2);
        assert_eq!(timers[1]["at"], "2024-01-01T00:00:00Z");
        assert_eq!(timers[1]["do"], json!({"switch": "on"}));
    }

    #[tokio::test]
    async fn add_timer_rejects_unsupported_kind_without_update() {
        // Basic switches do not accept once timers
        let (device, transport, _events) = spawn("Basic", json!({}));
        device
            .enqueue(CommandEnvelope::new("add_timer", json!("once 2024-01-01T00:00:00Z on")))
            .unwrap();
        device.shutdown().await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, RequestParams::query_all());
    }

    #[tokio::test]
    async fn del_timer_resubmits_remaining_list() {
        let timers = json!([{"at": "a", "type": "once"}, {"at": "b", "type": "once"}, {"at": "c", "type": "once"}]);
        let (device, transport, _events) = spawn("Default", json!({"timers": timers}));

        device.enqueue(CommandEnvelope::new("del_timer", json!("0,2"))).unwrap();
        device.enqueue(CommandEnvelope::new("del_timer", json!("9"))).unwrap();
        device.shutdown().await.unwrap();

        let sent = transport.sent();
        // Each deletion refreshes first; the invalid one stops there
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[1].0,
            RequestParams::single("timers", json!([{"at": "b", "type": "once"}]))
        );
        assert_eq!(sent[2].0, RequestParams::query_all());
    }

    #[tokio::test]
    async fn clear_timers_sends_empty_list() {
        let (device, transport, _events) = spawn("Default", json!({}));
        device.enqueue(CommandEnvelope::new("clear_timers", Value::Null)).unwrap();
        device.shutdown().await.unwrap();
        assert_eq!(transport.sent()[0].0, RequestParams::single("timers", json!([])));
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    #[tokio::test]
    async fn notification_is_idempotent() {
        let (device, _transport, mut events) = spawn("B1", json!({}));
        let update = frame(Some("update"), json!({"channel2": "120", "state": "on"}));

        device.notify(update.clone()).unwrap();
        device.notify(update).unwrap();
        device.shutdown().await.unwrap();

        let events = drain(&mut events);
        assert_eq!(changed_params(&events), vec!["red", "switch", "last_update"]);

        let record = device.record();
        assert_eq!(record.params["channel2"], "120");
        assert!(record.last_update.is_some());
    }

    #[tokio::test]
    async fn update_registers_unseen_keys() {
        let (device, transport, _events) = spawn("Default", json!({}));
        device.notify(frame(Some("update"), json!({"brightness": 40}))).unwrap();
        device.enqueue(CommandEnvelope::new("set_brightness", json!(80))).unwrap();
        device.shutdown().await.unwrap();
        assert_eq!(transport.sent()[0].0, RequestParams::single("brightness", json!(80)));
    }

    #[tokio::test]
    async fn sysmsg_does_not_register_keys_and_online_refreshes() {
        let (device, transport, _events) = spawn("Default", json!({}));
        device
            .notify(frame(Some("sysmsg"), json!({"online": true, "newkey": 1})))
            .unwrap();
        device.enqueue(CommandEnvelope::new("newkey", json!(2))).unwrap();
        device.shutdown().await.unwrap();

        assert!(device.record().online);
        // The refresh goes out; "newkey" is not a known command
        assert_eq!(transport.sent(), vec![(RequestParams::query_all(), false)]);
    }

    #[tokio::test]
    async fn error_frames_are_not_merged() {
        let (device, _transport, mut events) = spawn("Default", json!({}));
        let mut error = frame(None, json!({"switch": "on"}));
        error.error = Some(504);
        device.notify(error).unwrap();
        device.shutdown().await.unwrap();

        assert!(device.record().params.is_empty());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn watch_observes_updates() {
        let (device, _transport, _events) = spawn("Basic", json!({"switch": "off"}));
        let mut watch = device.watch();
        device.notify(frame(Some("update"), json!({"switch": "on"}))).unwrap();
        watch.changed().await.unwrap();
        assert_eq!(watch.borrow().params["switch"], "on");
        device.shutdown().await.unwrap();
    }
}
