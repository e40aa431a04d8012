// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cloud access.
//!
//! - [`CloudApi`]: HTTP login, relay dispatch and the device list
//! - [`CloudSession`]: the long-lived relay connection and request sending
//! - [`parse_inbound`]: classification of relay frames

mod api;
mod correlation;
mod frame;
mod session;

pub use api::{AuthContext, CloudApi, RelayHost, sign};
pub use frame::{
    DeviceFrame, FrameKind, HEARTBEAT_PING, HEARTBEAT_PONG, InboundFrame, PROTOCOL_VERSION,
    RequestParams, parse_inbound,
};
pub use session::{CloudSession, SendOutcome, SessionEvent};

#[cfg(test)]
pub(crate) use session::tests::test_context;
