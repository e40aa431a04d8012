// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event system for gateway state changes.
//!
//! Device actors and the gateway publish [`GatewayEvent`]s on an
//! [`EventBus`]. The bus bridge is one subscriber; applications may add
//! their own.
//!
//! # Examples
//!
//! ```
//! use ewegate::event::{EventBus, GatewayEvent};
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.publish(GatewayEvent::status("1000abcdef", "OK"));
//! ```

mod event_bus;
mod gateway_event;

pub use event_bus::EventBus;
pub use gateway_event::{ClientStatus, GatewayEvent};
