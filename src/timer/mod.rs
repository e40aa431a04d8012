// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device timers.
//!
//! Devices store up to [`MAX_TIMERS`] timers in their `timers` parameter.
//! This module turns the compact `add_timer` command into validated
//! [`TimerEntry`] values, encodes them in the cloud's format, and removes
//! stored timers by index.
//!
//! # Examples
//!
//! ```
//! use ewegate::timer::{TimerContext, build_timer, parse_add_timer};
//!
//! let request = parse_add_timer("once 2024-01-01T00:00:00Z on", None).unwrap();
//! let entry = build_timer(&request, &TimerContext::default(), chrono::Utc::now()).unwrap();
//!
//! assert_eq!(entry.to_value()["at"], "2024-01-01T00:00:00Z");
//! ```

mod codec;
mod schedule;

pub use codec::{
    MAX_TIMERS, SwitchState, TimerAction, TimerContext, TimerEntry, TimerKind, TimerRequest,
    build_timer, delete_timers, describe_timer, parse_add_timer,
};
pub use schedule::{validate_cron, validate_iso8601};
