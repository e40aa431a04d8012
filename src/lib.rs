// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `ewegate` - A gateway between the eWeLink cloud and an MQTT bus.
//!
//! The library logs into the eWeLink cloud, keeps a WebSocket session to the
//! account's relay open, and runs one actor per device. Device state changes
//! are published on a bus, and commands received on the bus are executed
//! against the devices.
//!
//! # Supported Features
//!
//! - **Cloud session**: signed login with region redirect, relay dispatch,
//!   heartbeats, request pacing and reconnection with cooldown
//! - **Devices**: parameter aliases, numeric coercion, automatic registration
//!   of unseen parameters, per-device command ordering
//! - **Timers**: `delay`, `repeat`, `once` and `duration` timers, listed and
//!   deleted by index
//! - **Bus bridge**: MQTT topics for commands and flattened state
//!
//! # Supported Devices
//!
//! - Basic switches (`Basic`, `Basic2`, `BASICR2`)
//! - Power monitoring switches (`Pow`, `Pow2`, `S31`)
//! - Thermostat switches (`TH16`, `TH10`)
//! - LED bulbs (`B1`)
//! - Four channel switches (`4CH`, `4CH Pro`)
//!
//! Anything else is handled with generic parameter access.
//!
//! # Quick Start
//!
//! ## Gateway with MQTT Bridge
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ewegate::bridge::{Bridge, MqttBus};
//! use ewegate::{BridgeConfig, CloudConfig, Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> ewegate::Result<()> {
//!     let cloud = CloudConfig::new("me@example.com", "password")
//!         .with_app_credential("appid", "secret")
//!         .with_region("eu");
//!     let gateway = Gateway::new(GatewayConfig::new(cloud))?;
//!
//!     let topics = BridgeConfig::default();
//!     let (bus, inbound) = MqttBus::builder()
//!         .host("192.168.1.50")
//!         .subscribe(topics.command_filter())
//!         .build()
//!         .await?;
//!
//!     let bridge = Arc::new(Bridge::new(gateway.clone(), bus, topics));
//!     gateway.start();
//!     bridge.run(inbound).await;
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Gateway Events Without a Bus
//!
//! ```no_run
//! use ewegate::event::GatewayEvent;
//! use ewegate::{CloudConfig, Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> ewegate::Result<()> {
//!     let cloud = CloudConfig::new("+15551234567", "password")
//!         .with_app_credential("appid", "secret");
//!     let gateway = Gateway::new(GatewayConfig::new(cloud))?;
//!     let mut events = gateway.subscribe();
//!     gateway.start();
//!
//!     while let Ok(event) = events.recv().await {
//!         if let GatewayEvent::ParameterChanged { deviceid, param, value } = event {
//!             println!("{deviceid}: {param} = {value}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod cloud;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
mod gateway;
pub mod timer;

pub use config::{AppCredential, BridgeConfig, CloudConfig, GatewayConfig, Identity};
pub use device::{CommandEnvelope, DeviceHandle, DeviceModel, DeviceRecord, ModelRegistry};
pub use error::{
    AuthError, BusError, ConnectionError, Error, ParseError, Result, SendError, ValidationError,
};
pub use gateway::Gateway;
