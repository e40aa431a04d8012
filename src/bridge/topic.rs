// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command topic parsing.

/// A command topic split into its parts.
///
/// Command topics look like `<root>/<selector>/<command>`. The last segment
/// is always the command; the one before it, if any, selects the device.
///
/// # Examples
///
/// ```
/// use ewegate::bridge::CommandTopic;
///
/// let topic = CommandTopic::parse("/ewelink_command/Kitchen/set_switch", "/ewelink_command")
///     .unwrap();
/// assert_eq!(topic.selector.as_deref(), Some("Kitchen"));
/// assert_eq!(topic.command, "set_switch");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    /// Device selector: an id, a display name or a list index.
    pub selector: Option<String>,
    /// Command name.
    pub command: String,
}

impl CommandTopic {
    /// Parses a topic received under `root`.
    ///
    /// Returns `None` if the topic is outside `root` or names no command.
    #[must_use]
    pub fn parse(topic: &str, root: &str) -> Option<Self> {
        let rest = topic.strip_prefix(root.trim_end_matches('/'))?;
        let rest = rest.strip_prefix('/')?;

        let mut segments = rest.rsplit('/');
        let command = segments.next().filter(|c| !c.is_empty())?;
        let selector = segments.next().filter(|s| !s.is_empty());

        Some(Self {
            selector: selector.map(str::to_string),
            command: command.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/ewelink_command";

    #[test]
    fn selector_and_command() {
        let topic = CommandTopic::parse("/ewelink_command/1000abcdef/get_config", ROOT).unwrap();
        assert_eq!(topic.selector.as_deref(), Some("1000abcdef"));
        assert_eq!(topic.command, "get_config");
    }

    #[test]
    fn command_without_selector() {
        let topic = CommandTopic::parse("/ewelink_command/refresh", ROOT).unwrap();
        assert_eq!(topic.selector, None);
        assert_eq!(topic.command, "refresh");
    }

    #[test]
    fn extra_segments_use_the_last_two() {
        let topic = CommandTopic::parse("/ewelink_command/house/0/set_led", ROOT).unwrap();
        assert_eq!(topic.selector.as_deref(), Some("0"));
        assert_eq!(topic.command, "set_led");
    }

    #[test]
    fn root_with_trailing_slash() {
        let topic = CommandTopic::parse("cmd/0/set_switch", "cmd/").unwrap();
        assert_eq!(topic.command, "set_switch");
    }

    #[test]
    fn rejects_foreign_and_empty_topics() {
        assert!(CommandTopic::parse("/other/0/set_switch", ROOT).is_none());
        assert!(CommandTopic::parse("/ewelink_commandx/0/set_switch", ROOT).is_none());
        assert!(CommandTopic::parse("/ewelink_command/0/", ROOT).is_none());
        assert!(CommandTopic::parse("/ewelink_command", ROOT).is_none());
    }
}
