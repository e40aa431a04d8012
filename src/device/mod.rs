// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Devices and their command handling.
//!
//! Every device known to the account gets a [`DeviceHandle`], backed by a
//! task that owns the device's [`DeviceRecord`] and [`ParameterDescriptor`]
//! and executes its commands one at a time. The product model picks a
//! [`DeviceModel`] variant from the [`ModelRegistry`].
//!
//! # Commands
//!
//! Every device understands:
//!
//! | Command | Payload |
//! |---------|---------|
//! | `<param>` or `set_<param>` | new value; `param` is a settings key or alias |
//! | `set_switch` | `on` or `off` |
//! | `set_led` | `on` or `off` |
//! | `send_json` | a JSON object, single quotes allowed |
//! | `get_config` | optional parameter names; empty reads all |
//! | `add_timer` | see [`crate::timer::parse_add_timer`] |
//! | `list_timers` | none |
//! | `del_timer` | 0-based indices as shown by `list_timers` |
//! | `clear_timers` | none |
//!
//! Variants may add their own, such as `set_temperature` on
//! [`ThermostatSwitch`].

mod actor;
mod command;
mod descriptor;
mod model;
mod record;

pub use actor::{DeviceHandle, Transport};
pub use command::CommandEnvelope;
pub use descriptor::ParameterDescriptor;
pub use model::{
    BasicSwitch, DefaultModel, DeviceModel, FourChannelSwitch, LedBulb, ModelRegistry, PowSwitch,
    ThermostatSwitch,
};
pub use record::{DeviceRecord, deep_merge};
