// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequence numbers and request/response correlation.
//!
//! Every request carries a sequence number derived from the current time in
//! milliseconds, bumped when needed so that numbers strictly increase within
//! a session.
//!
//! Waiting callers register in [`PendingRequests`] under their sequence. A
//! reply completes the waiter with the same sequence and, for compatibility
//! with relays that acknowledge out of band, every older waiter too. Two
//! callers waiting at the same time may therefore receive a reply meant for
//! the other one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::DeviceFrame;

/// Generates strictly increasing, time-derived sequence numbers.
#[derive(Debug, Default)]
pub(crate) struct SequenceGenerator {
    last: AtomicU64,
}

impl SequenceGenerator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence number.
    pub(crate) fn next(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let next = |last: u64| now.max(last.saturating_add(1));
        // The closure always returns Some, so this never fails
        match self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(next(last)))
        {
            Ok(previous) | Err(previous) => next(previous),
        }
    }
}

/// A request waiting for its reply.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) sent_at: Instant,
    reply: oneshot::Sender<DeviceFrame>,
}

/// Outstanding requests keyed by sequence number.
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    waiters: BTreeMap<u64, PendingRequest>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `sequence`.
    pub(crate) fn register(&mut self, sequence: u64) -> oneshot::Receiver<DeviceFrame> {
        let (reply, rx) = oneshot::channel();
        self.waiters.insert(
            sequence,
            PendingRequest {
                sent_at: Instant::now(),
                reply,
            },
        );
        rx
    }

    /// Removes the waiter for `sequence`, returning it if it was pending.
    pub(crate) fn cancel(&mut self, sequence: u64) -> Option<PendingRequest> {
        self.waiters.remove(&sequence)
    }

    /// Completes the waiters a reply answers and returns how many there were.
    ///
    /// Replies without a sequence number complete nothing.
    pub(crate) fn resolve(&mut self, frame: &DeviceFrame) -> usize {
        let Some(sequence) = frame.sequence else {
            return 0;
        };

        let newer = self.waiters.split_off(&sequence.saturating_add(1));
        let answered = std::mem::replace(&mut self.waiters, newer);

        let mut completed = 0;
        for (waiting, request) in answered {
            if waiting != sequence {
                tracing::debug!(
                    waiting,
                    replied = sequence,
                    "Completing older request with a newer reply"
                );
            }
            tracing::trace!(
                sequence = waiting,
                elapsed_ms = request.sent_at.elapsed().as_millis(),
                "Reply received"
            );
            // The caller may have timed out in the meantime
            if request.reply.send(frame.clone()).is_ok() {
                completed += 1;
            }
        }
        completed
    }

    /// Drops every waiter; their callers see the connection as closed.
    pub(crate) fn clear(&mut self) {
        self.waiters.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}
