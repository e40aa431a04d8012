// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Timer entries and the compact `add_timer` command grammar.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::schedule::{validate_cron, validate_iso8601};
use crate::error::ValidationError;

/// Maximum number of timers a device stores.
pub const MAX_TIMERS: usize = 8;

/// The kind of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Fires once, a number of minutes from now.
    Delay,
    /// Fires on a cron-like schedule.
    Repeat,
    /// Fires once at a given timestamp.
    Once,
    /// Alternates on and off periods from a start time.
    Duration,
}

impl TimerKind {
    /// All timer kinds.
    pub const ALL: [Self; 4] = [Self::Delay, Self::Repeat, Self::Once, Self::Duration];

    /// Returns the command and `coolkit_timer_type` name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delay => "delay",
            Self::Repeat => "repeat",
            Self::Once => "once",
            Self::Duration => "duration",
        }
    }

    /// Returns the `type` the cloud stores; delays are stored as `once`.
    #[must_use]
    pub fn wire_type(self) -> &'static str {
        match self {
            Self::Repeat => "repeat",
            Self::Duration => "duration",
            Self::Delay | Self::Once => "once",
        }
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimerKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ValidationError::UnsupportedTimerKind(s.to_string()))
    }
}

/// A switch position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    /// `on`
    On,
    /// `off`
    Off,
}

impl SwitchState {
    /// Returns `on` or `off`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    /// Returns the opposite position.
    #[must_use]
    pub fn toggled(self) -> Self {
        match self {
            Self::On => Self::Off,
            Self::Off => Self::On,
        }
    }

    fn is_token(text: &str) -> bool {
        text.parse::<Self>().is_ok()
    }
}

impl FromStr for SwitchState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("on") {
            Ok(Self::On)
        } else if s.eq_ignore_ascii_case("off") {
            Ok(Self::Off)
        } else {
            Err(ValidationError::InvalidAction(s.to_string()))
        }
    }
}

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// One switch action.
    Single(SwitchState),
    /// Separate actions at the start and end of each duration period.
    StartEnd {
        /// Action at the start of the on period.
        start: SwitchState,
        /// Action at the start of the off period.
        end: SwitchState,
    },
}

/// A validated timer, ready to be stored on a device.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerEntry {
    /// Kind of timer.
    pub kind: TimerKind,
    /// Schedule expression as stored by the cloud.
    pub at: String,
    /// Delay in minutes, for delay timers.
    pub period: Option<u32>,
    /// Action to perform.
    pub action: TimerAction,
    /// Output channel on multi-channel devices.
    pub channel: Option<u8>,
    /// Whether the action also drives the automatic-mode main switch.
    pub main_switch: bool,
    /// Whether the timer is active.
    pub enabled: bool,
    /// Correlation id.
    pub correlation_id: Uuid,
}

impl TimerEntry {
    /// Encodes the entry in the cloud's timer format.
    ///
    /// # Examples
    ///
    /// ```
    /// use ewegate::timer::{TimerContext, TimerKind, TimerRequest, build_timer};
    ///
    /// let request = TimerRequest::new(TimerKind::Once, "on", "2024-01-01T00:00:00Z");
    /// let entry = build_timer(&request, &TimerContext::default(), chrono::Utc::now()).unwrap();
    /// let value = entry.to_value();
    ///
    /// assert_eq!(value["at"], "2024-01-01T00:00:00Z");
    /// assert_eq!(value["do"], serde_json::json!({"switch": "on"}));
    /// assert_eq!(value["type"], "once");
    /// ```
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut timer = Map::new();
        timer.insert("at".to_string(), Value::String(self.at.clone()));
        if let Some(period) = self.period {
            timer.insert("period".to_string(), Value::String(period.to_string()));
        }
        timer.insert(
            "coolkit_timer_type".to_string(),
            Value::String(self.kind.as_str().to_string()),
        );
        match self.action {
            TimerAction::Single(state) => {
                timer.insert("do".to_string(), self.render(state));
            }
            TimerAction::StartEnd { start, end } => {
                timer.insert("startDo".to_string(), self.render(start));
                timer.insert("endDo".to_string(), self.render(end));
            }
        }
        timer.insert("enabled".to_string(), json!(u8::from(self.enabled)));
        timer.insert(
            "mId".to_string(),
            Value::String(self.correlation_id.to_string()),
        );
        timer.insert(
            "type".to_string(),
            Value::String(self.kind.wire_type().to_string()),
        );
        Value::Object(timer)
    }

    fn render(&self, state: SwitchState) -> Value {
        let state = state.as_str();
        if self.main_switch {
            json!({"switch": state, "mainSwitch": state})
        } else if let Some(channel) = self.channel {
            json!({"outlet": channel, "switch": state})
        } else {
            json!({"switch": state})
        }
    }
}

/// The arguments of a timer to build.
///
/// `action`, `schedule` and `secondary` are kept as text so that
/// [`build_timer`] validates every token in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest {
    /// Kind of timer.
    pub kind: TimerKind,
    /// Switch action (`on` or `off`).
    pub action: String,
    /// Minutes for delay, cron pattern for repeat, timestamp otherwise.
    pub schedule: String,
    /// On and off minutes, for duration timers.
    pub durations: Option<(u32, u32)>,
    /// End-of-period action, for duration timers.
    pub secondary: Option<String>,
    /// Output channel on multi-channel devices.
    pub channel: Option<u8>,
    /// Whether the timer keeps the device in automatic mode.
    pub auto: bool,
}

impl TimerRequest {
    /// Creates a request with no channel, durations or secondary action.
    #[must_use]
    pub fn new(kind: TimerKind, action: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            kind,
            action: action.into(),
            schedule: schedule.into(),
            durations: None,
            secondary: None,
            channel: None,
            auto: true,
        }
    }

    /// Sets the on and off durations in minutes.
    #[must_use]
    pub fn with_durations(mut self, on: u32, off: u32) -> Self {
        self.durations = Some((on, off));
        self
    }

    /// Sets the end-of-period action.
    #[must_use]
    pub fn with_secondary(mut self, action: impl Into<String>) -> Self {
        self.secondary = Some(action.into());
        self
    }

    /// Sets the output channel.
    #[must_use]
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Marks the timer as manual, leaving automatic mode alone.
    #[must_use]
    pub fn manual(mut self) -> Self {
        self.auto = false;
        self
    }
}

/// What a device allows, used to validate a new timer.
#[derive(Debug, Clone, Copy)]
pub struct TimerContext<'a> {
    /// Timers currently stored on the device.
    pub existing: &'a [Value],
    /// Number of output channels, for multi-channel devices.
    pub channels: Option<u8>,
    /// Whether the device has an automatic-mode main switch.
    pub main_switch: bool,
    /// Timer kinds the device accepts.
    pub supported: &'a [TimerKind],
}

impl Default for TimerContext<'_> {
    fn default() -> Self {
        Self {
            existing: &[],
            channels: None,
            main_switch: false,
            supported: &TimerKind::ALL,
        }
    }
}

/// Returns whether a stored timer is an enabled duration timer.
fn is_active_duration(timer: &Value) -> bool {
    let kind = timer
        .get("coolkit_timer_type")
        .or_else(|| timer.get("type"))
        .and_then(Value::as_str);
    let enabled = timer.get("enabled").is_none_or(|enabled| match enabled {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() != Some(0),
        _ => true,
    });
    kind == Some("duration") && enabled
}

/// Builds and validates a timer.
///
/// `now` anchors delay timers.
///
/// # Errors
///
/// Returns a [`ValidationError`] if the kind is not supported, the device is
/// full, a second duration timer is requested, the channel is missing or out
/// of range, an action is not `on`/`off`, or the schedule is malformed.
pub fn build_timer(
    request: &TimerRequest,
    context: &TimerContext<'_>,
    now: DateTime<Utc>,
) -> Result<TimerEntry, ValidationError> {
    if !context.supported.contains(&request.kind) {
        return Err(ValidationError::UnsupportedTimerKind(
            request.kind.to_string(),
        ));
    }
    if context.existing.len() >= MAX_TIMERS {
        return Err(ValidationError::TooManyTimers { max: MAX_TIMERS });
    }
    if request.kind == TimerKind::Duration && context.existing.iter().any(is_active_duration) {
        return Err(ValidationError::DurationTimerExists);
    }

    match (context.channels, request.channel) {
        (Some(count), Some(channel)) if channel >= count => {
            return Err(ValidationError::InvalidChannel(format!(
                "channel {channel} out of range 0-{}",
                count.saturating_sub(1)
            )));
        }
        (Some(_), None) => {
            return Err(ValidationError::InvalidChannel(
                "multi-channel device requires a channel".to_string(),
            ));
        }
        (None, Some(channel)) => {
            return Err(ValidationError::InvalidChannel(format!(
                "single-channel device has no channel {channel}"
            )));
        }
        _ => {}
    }

    let action: SwitchState = request.action.parse()?;
    let secondary = request
        .secondary
        .as_deref()
        .map(str::parse::<SwitchState>)
        .transpose()?;
    if secondary.is_some() && request.kind != TimerKind::Duration {
        return Err(ValidationError::UnexpectedArguments(
            "an end action only applies to duration timers".to_string(),
        ));
    }

    let mut period = None;
    let at = match request.kind {
        TimerKind::Delay => {
            let minutes = positive_minutes(&request.schedule)?;
            period = Some(minutes);
            (now + TimeDelta::minutes(i64::from(minutes)))
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string()
        }
        TimerKind::Repeat => {
            validate_cron(&request.schedule)?;
            request
                .schedule
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        }
        TimerKind::Once => {
            validate_iso8601(&request.schedule)?;
            request.schedule.clone()
        }
        TimerKind::Duration => {
            validate_iso8601(&request.schedule)?;
            let (on, off) = request
                .durations
                .ok_or(ValidationError::MissingArgument("on and off durations"))?;
            if on == 0 || off == 0 {
                return Err(ValidationError::InvalidMinutes(format!("{on} {off}")));
            }
            format!("{} {on} {off}", request.schedule)
        }
    };

    let action = match secondary {
        Some(end) => TimerAction::StartEnd { start: action, end },
        None => TimerAction::Single(action),
    };

    Ok(TimerEntry {
        kind: request.kind,
        at,
        period,
        action,
        channel: request.channel,
        main_switch: context.main_switch && request.auto,
        enabled: true,
        correlation_id: Uuid::new_v4(),
    })
}

fn positive_minutes(text: &str) -> Result<u32, ValidationError> {
    text.parse::<u32>()
        .ok()
        .filter(|minutes| *minutes > 0)
        .ok_or_else(|| ValidationError::InvalidMinutes(text.to_string()))
}

fn parse_channel(token: Option<&str>) -> Result<u8, ValidationError> {
    let token = token.ok_or(ValidationError::MissingArgument("channel"))?;
    token
        .parse()
        .map_err(|_| ValidationError::InvalidChannel(token.to_string()))
}

/// Parses the arguments of an `add_timer` command.
///
/// Grammar, where a trailing `manual` leaves automatic mode alone:
///
/// ```text
/// delay <minutes> [channel] <on|off> [manual]
/// repeat <minute> <hour> <day> <month> <weekday> [channel] <on|off> [manual]
/// once <iso8601> [channel] <on|off> [manual]
/// duration <iso8601> <on_minutes> <off_minutes> <on|off> [<on|off>] [manual]
/// ```
///
/// The channel is read only when `channels` is set.
///
/// # Errors
///
/// Returns a [`ValidationError`] for an unknown kind, missing arguments or
/// non-numeric minutes and channels. Actions and schedules are validated by
/// [`build_timer`].
///
/// # Examples
///
/// ```
/// use ewegate::timer::{TimerKind, parse_add_timer};
///
/// let request = parse_add_timer("repeat 0 22 * * 1 off", None).unwrap();
/// assert_eq!(request.kind, TimerKind::Repeat);
/// assert_eq!(request.schedule, "0 22 * * 1");
/// assert_eq!(request.action, "off");
/// ```
pub fn parse_add_timer(args: &str, channels: Option<u8>) -> Result<TimerRequest, ValidationError> {
    let mut tokens: Vec<&str> = args.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(ValidationError::MissingArgument("timer kind"));
    }
    let kind: TimerKind = tokens.remove(0).parse()?;
    let multi_channel = channels.is_some();

    let mut request = match kind {
        TimerKind::Delay => {
            let mut rest = tokens.into_iter();
            let period = rest
                .next()
                .ok_or(ValidationError::MissingArgument("delay minutes"))?;
            let channel = if multi_channel {
                Some(parse_channel(rest.next())?)
            } else {
                None
            };
            let action = rest.next().ok_or(ValidationError::MissingArgument("action"))?;
            let mut request = TimerRequest::new(kind, action, period);
            request.channel = channel;
            request.auto = !manual_flag(&rest.collect::<Vec<_>>())?;
            request
        }
        TimerKind::Repeat | TimerKind::Once => {
            let (action, auto) = pop_action(&mut tokens)?;
            let channel = if multi_channel {
                Some(parse_channel(tokens.pop())?)
            } else {
                None
            };
            let schedule = if kind == TimerKind::Once {
                let iso = tokens.first().ok_or(ValidationError::MissingArgument("timestamp"))?;
                if tokens.len() > 1 {
                    return Err(ValidationError::UnexpectedArguments(tokens[1..].join(" ")));
                }
                iso.to_ascii_uppercase()
            } else {
                tokens.join(" ")
            };
            let mut request = TimerRequest::new(kind, action, schedule);
            request.channel = channel;
            request.auto = auto;
            request
        }
        TimerKind::Duration => {
            let mut rest = tokens.into_iter();
            let start = rest
                .next()
                .ok_or(ValidationError::MissingArgument("start timestamp"))?
                .to_ascii_uppercase();
            let on = rest
                .next()
                .ok_or(ValidationError::MissingArgument("on minutes"))
                .and_then(positive_minutes)?;
            let off = rest
                .next()
                .ok_or(ValidationError::MissingArgument("off minutes"))
                .and_then(positive_minutes)?;
            let action = rest.next().ok_or(ValidationError::MissingArgument("action"))?;
            let mut request = TimerRequest::new(kind, action, start).with_durations(on, off);
            let mut remaining: Vec<&str> = rest.collect();
            if remaining.first().is_some_and(|t| SwitchState::is_token(t)) {
                request.secondary = Some(remaining.remove(0).to_string());
            }
            request.auto = !manual_flag(&remaining)?;
            request
        }
    };
    request.action = request.action.to_ascii_lowercase();
    Ok(request)
}

const MANUAL: &str = "manual";

/// Takes the action from the end of `tokens`, allowing one trailing
/// `manual` token after it.
fn pop_action<'a>(tokens: &mut Vec<&'a str>) -> Result<(&'a str, bool), ValidationError> {
    let last = tokens.pop().ok_or(ValidationError::MissingArgument("action"))?;
    if !last.eq_ignore_ascii_case(MANUAL) {
        return Ok((last, true));
    }
    let action = tokens.pop().ok_or(ValidationError::MissingArgument("action"))?;
    Ok((action, false))
}

/// Reads what follows the action: nothing, or the `manual` token.
fn manual_flag(rest: &[&str]) -> Result<bool, ValidationError> {
    match rest {
        [] => Ok(false),
        [token] if token.eq_ignore_ascii_case(MANUAL) => Ok(true),
        extra => Err(ValidationError::UnexpectedArguments(extra.join(" "))),
    }
}

/// Removes timers by index and returns the remaining list.
///
/// Indices are 0-based positions in `existing`, the list as shown by
/// `list_timers`, separated by commas and/or spaces. Duplicates are ignored
/// and entries are removed from the highest index down.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidIndex`] if no index is given, a token is
/// not a number, or an index is out of range. Nothing is removed then.
///
/// # Examples
///
/// ```
/// use ewegate::timer::delete_timers;
/// use serde_json::json;
///
/// let timers = vec![json!({"at": "a"}), json!({"at": "b"}), json!({"at": "c"})];
/// let remaining = delete_timers(&timers, "0, 2").unwrap();
/// assert_eq!(remaining, vec![json!({"at": "b"})]);
/// ```
pub fn delete_timers(existing: &[Value], indices: &str) -> Result<Vec<Value>, ValidationError> {
    let mut parsed = indices
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<usize>()
                .map_err(|_| ValidationError::InvalidIndex(token.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if parsed.is_empty() {
        return Err(ValidationError::InvalidIndex(
            "no timer index given".to_string(),
        ));
    }
    if let Some(bad) = parsed.iter().find(|index| **index >= existing.len()) {
        return Err(ValidationError::InvalidIndex(format!(
            "{bad} (device has {} timers)",
            existing.len()
        )));
    }

    parsed.sort_unstable_by(|a, b| b.cmp(a));
    parsed.dedup();

    let mut remaining = existing.to_vec();
    for index in parsed {
        remaining.remove(index);
    }
    Ok(remaining)
}

/// Returns a one-line description of a stored timer for listings.
#[must_use]
pub fn describe_timer(timer: &Value) -> String {
    let kind = timer
        .get("coolkit_timer_type")
        .or_else(|| timer.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let at = timer.get("at").and_then(Value::as_str).unwrap_or("?");
    format!("type:{kind} at:{at}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn build(request: &TimerRequest) -> Result<TimerEntry, ValidationError> {
        build_timer(request, &TimerContext::default(), now())
    }

    // ========================================================================
    // build_timer
    // ========================================================================

    #[test]
    fn once_timer_on_single_channel_device() {
        let request = TimerRequest::new(TimerKind::Once, "on", "2024-01-01T00:00:00Z");
        let value = build(&request).unwrap().to_value();

        assert_eq!(value["at"], "2024-01-01T00:00:00Z");
        assert_eq!(value["do"], json!({"switch": "on"}));
        assert_eq!(value["coolkit_timer_type"], "once");
        assert_eq!(value["type"], "once");
        assert_eq!(value["enabled"], 1);
        assert!(value["mId"].as_str().is_some_and(|id| id.len() == 36));
    }

    #[test]
    fn rejects_actions_other_than_on_and_off() {
        for action in ["toggle", "1", "", "onn"] {
            let request = TimerRequest::new(TimerKind::Once, action, "2024-01-01T00:00:00Z");
            assert!(matches!(
                build(&request),
                Err(ValidationError::InvalidAction(_))
            ));
        }

        let request = TimerRequest::new(TimerKind::Duration, "on", "2024-01-01T00:00:00Z")
            .with_durations(5, 5)
            .with_secondary("maybe");
        assert_eq!(
            build(&request),
            Err(ValidationError::InvalidAction("maybe".to_string()))
        );
    }

    #[test]
    fn rejects_ninth_timer() {
        let existing = vec![json!({"type": "once", "at": "x"}); MAX_TIMERS];
        let context = TimerContext {
            existing: &existing,
            ..TimerContext::default()
        };
        let request = TimerRequest::new(TimerKind::Delay, "on", "5");

        assert_eq!(
            build_timer(&request, &context, now()),
            Err(ValidationError::TooManyTimers { max: 8 })
        );

        let seven = &existing[..MAX_TIMERS - 1];
        let context = TimerContext {
            existing: seven,
            ..TimerContext::default()
        };
        assert!(build_timer(&request, &context, now()).is_ok());
    }

    #[test]
    fn rejects_second_duration_timer() {
        let existing = vec![json!({
            "coolkit_timer_type": "duration",
            "type": "duration",
            "at": "2024-01-01T00:00:00Z 5 5",
            "enabled": 1
        })];
        let context = TimerContext {
            existing: &existing,
            ..TimerContext::default()
        };
        let request = TimerRequest::new(TimerKind::Duration, "on", "2024-02-01T00:00:00Z")
            .with_durations(10, 20);

        assert_eq!(
            build_timer(&request, &context, now()),
            Err(ValidationError::DurationTimerExists)
        );
    }

    #[test]
    fn disabled_duration_timer_does_not_block() {
        let existing = vec![json!({"type": "duration", "at": "x", "enabled": 0})];
        let context = TimerContext {
            existing: &existing,
            ..TimerContext::default()
        };
        let request = TimerRequest::new(TimerKind::Duration, "on", "2024-02-01T00:00:00Z")
            .with_durations(10, 20);
        assert!(build_timer(&request, &context, now()).is_ok());
    }

    #[test]
    fn delay_timer_fires_after_period() {
        let value = build(&TimerRequest::new(TimerKind::Delay, "off", "90"))
            .unwrap()
            .to_value();

        assert_eq!(value["at"], "2024-05-01T13:30:00Z");
        assert_eq!(value["period"], "90");
        assert_eq!(value["coolkit_timer_type"], "delay");
        assert_eq!(value["type"], "once");
        assert_eq!(value["do"], json!({"switch": "off"}));
    }

    #[test]
    fn delay_requires_positive_minutes() {
        for period in ["0", "-5", "abc", "1.5"] {
            assert!(matches!(
                build(&TimerRequest::new(TimerKind::Delay, "on", period)),
                Err(ValidationError::InvalidMinutes(_))
            ));
        }
    }

    #[test]
    fn repeat_timer_validates_cron() {
        let value = build(&TimerRequest::new(TimerKind::Repeat, "on", "0  22 * *  1"))
            .unwrap()
            .to_value();
        assert_eq!(value["at"], "0 22 * * 1");
        assert_eq!(value["type"], "repeat");

        assert!(matches!(
            build(&TimerRequest::new(TimerKind::Repeat, "on", "0 25 * * 1")),
            Err(ValidationError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn once_timer_validates_timestamp() {
        assert!(matches!(
            build(&TimerRequest::new(TimerKind::Once, "on", "2024-01-01")),
            Err(ValidationError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn duration_timer_with_end_action() {
        let request = TimerRequest::new(TimerKind::Duration, "on", "2024-01-01T08:00:00Z")
            .with_durations(30, 90)
            .with_secondary("off");
        let value = build(&request).unwrap().to_value();

        assert_eq!(value["at"], "2024-01-01T08:00:00Z 30 90");
        assert_eq!(value["startDo"], json!({"switch": "on"}));
        assert_eq!(value["endDo"], json!({"switch": "off"}));
        assert!(value.get("do").is_none());
        assert_eq!(value["type"], "duration");
    }

    #[test]
    fn duration_timer_requires_durations() {
        let request = TimerRequest::new(TimerKind::Duration, "on", "2024-01-01T08:00:00Z");
        assert!(matches!(
            build(&request),
            Err(ValidationError::MissingArgument(_))
        ));

        let request = request.with_durations(0, 5);
        assert!(matches!(
            build(&request),
            Err(ValidationError::InvalidMinutes(_))
        ));
    }

    #[test]
    fn end_action_only_for_duration() {
        let request = TimerRequest::new(TimerKind::Once, "on", "2024-01-01T00:00:00Z")
            .with_secondary("off");
        assert!(matches!(
            build(&request),
            Err(ValidationError::UnexpectedArguments(_))
        ));
    }

    #[test]
    fn multi_channel_requires_valid_channel() {
        let context = TimerContext {
            channels: Some(4),
            ..TimerContext::default()
        };
        let request = TimerRequest::new(TimerKind::Once, "on", "2024-01-01T00:00:00Z");

        assert!(matches!(
            build_timer(&request, &context, now()),
            Err(ValidationError::InvalidChannel(_))
        ));
        assert!(matches!(
            build_timer(&request.clone().with_channel(4), &context, now()),
            Err(ValidationError::InvalidChannel(_))
        ));

        let value = build_timer(&request.with_channel(2), &context, now())
            .unwrap()
            .to_value();
        assert_eq!(value["do"], json!({"outlet": 2, "switch": "on"}));
    }

    #[test]
    fn main_switch_follows_auto_flag() {
        let context = TimerContext {
            main_switch: true,
            ..TimerContext::default()
        };
        let request = TimerRequest::new(TimerKind::Delay, "on", "5");

        let auto = build_timer(&request, &context, now()).unwrap().to_value();
        assert_eq!(auto["do"], json!({"switch": "on", "mainSwitch": "on"}));

        let manual = build_timer(&request.manual(), &context, now())
            .unwrap()
            .to_value();
        assert_eq!(manual["do"], json!({"switch": "on"}));
    }

    #[test]
    fn unsupported_kind_is_rejected() {
        let supported = [TimerKind::Delay, TimerKind::Repeat];
        let context = TimerContext {
            supported: &supported,
            ..TimerContext::default()
        };
        let request = TimerRequest::new(TimerKind::Once, "on", "2024-01-01T00:00:00Z");
        assert_eq!(
            build_timer(&request, &context, now()),
            Err(ValidationError::UnsupportedTimerKind("once".to_string()))
        );
    }

    // ========================================================================
    // parse_add_timer
    // ========================================================================

    #[test]
    fn parse_delay() {
        let request = parse_add_timer("delay 15 on", None).unwrap();
        assert_eq!(request, TimerRequest::new(TimerKind::Delay, "on", "15"));

        let request = parse_add_timer("delay 15 2 off manual", Some(4)).unwrap();
        assert_eq!(request.channel, Some(2));
        assert_eq!(request.action, "off");
        assert!(!request.auto);
    }

    #[test]
    fn parse_repeat_with_channel_and_manual() {
        let request = parse_add_timer("repeat 0 7 * * 1-5 3 on manual", Some(4)).unwrap();
        assert_eq!(request.schedule, "0 7 * * 1-5");
        assert_eq!(request.channel, Some(3));
        assert_eq!(request.action, "on");
        assert!(!request.auto);
    }

    #[test]
    fn parse_once_uppercases_timestamp() {
        let request = parse_add_timer("once 2024-01-01t00:00:00z ON", None).unwrap();
        assert_eq!(request.schedule, "2024-01-01T00:00:00Z");
        assert_eq!(request.action, "on");
        assert!(request.auto);
    }

    #[test]
    fn parse_once_reports_invalid_action() {
        let request = parse_add_timer("once 2024-01-01T00:00:00Z bogus", None).unwrap();
        assert_eq!(request.schedule, "2024-01-01T00:00:00Z");
        assert!(request.auto);
        assert_eq!(
            build(&request),
            Err(ValidationError::InvalidAction("bogus".to_string()))
        );
    }

    #[test]
    fn only_the_manual_token_follows_the_action() {
        assert!(matches!(
            parse_add_timer("delay 15 on later", None),
            Err(ValidationError::UnexpectedArguments(_))
        ));
        assert!(matches!(
            parse_add_timer("duration 2024-01-01T08:00:00Z 10 20 on off soon", None),
            Err(ValidationError::UnexpectedArguments(_))
        ));
        assert!(!parse_add_timer("delay 15 on MANUAL", None).unwrap().auto);
    }

    #[test]
    fn parse_once_rejects_extra_tokens() {
        assert!(matches!(
            parse_add_timer("once 2024-01-01T00:00:00Z 5 on", None),
            Err(ValidationError::UnexpectedArguments(_))
        ));
    }

    #[test]
    fn parse_duration() {
        let request = parse_add_timer("duration 2024-01-01T08:00:00Z 10 20 on off", None).unwrap();
        assert_eq!(request.durations, Some((10, 20)));
        assert_eq!(request.secondary.as_deref(), Some("off"));
        assert!(request.auto);

        let request = parse_add_timer("duration 2024-01-01T08:00:00Z 10 20 on manual", None).unwrap();
        assert_eq!(request.secondary, None);
        assert!(!request.auto);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            parse_add_timer("", None),
            Err(ValidationError::MissingArgument(_))
        ));
        assert!(matches!(
            parse_add_timer("weekly 5 on", None),
            Err(ValidationError::UnsupportedTimerKind(_))
        ));
        assert!(matches!(
            parse_add_timer("delay 15", None),
            Err(ValidationError::MissingArgument(_))
        ));
        assert!(matches!(
            parse_add_timer("delay 15 x on", Some(4)),
            Err(ValidationError::InvalidChannel(_))
        ));
        assert!(matches!(
            parse_add_timer("duration 2024-01-01T08:00:00Z ten 20 on", None),
            Err(ValidationError::InvalidMinutes(_))
        ));
    }

    #[test]
    fn parsed_invalid_action_fails_at_build() {
        let request = parse_add_timer("delay 15 maybe", None).unwrap();
        assert!(matches!(
            build(&request),
            Err(ValidationError::InvalidAction(_))
        ));
    }

    // ========================================================================
    // delete_timers
    // ========================================================================

    fn timers(count: usize) -> Vec<Value> {
        (0..count).map(|i| json!({"at": i.to_string()})).collect()
    }

    #[test]
    fn delete_uses_zero_based_indices_of_listed_order() {
        let remaining = delete_timers(&timers(4), "1,3").unwrap();
        assert_eq!(remaining, vec![json!({"at": "0"}), json!({"at": "2"})]);
    }

    #[test]
    fn delete_ignores_input_order_and_duplicates() {
        let remaining = delete_timers(&timers(4), "0 2, 0").unwrap();
        assert_eq!(remaining, vec![json!({"at": "1"}), json!({"at": "3"})]);
    }

    #[test]
    fn delete_rejects_out_of_range_without_partial_apply() {
        let err = delete_timers(&timers(2), "0,2").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidIndex(_)));
    }

    #[test]
    fn delete_rejects_bad_tokens() {
        assert!(delete_timers(&timers(2), "first").is_err());
        assert!(delete_timers(&timers(2), " , ").is_err());
    }

    #[test]
    fn describe_stored_timer() {
        let timer = json!({"coolkit_timer_type": "repeat", "type": "repeat", "at": "0 7 * * *"});
        assert_eq!(describe_timer(&timer), "type:repeat at:0 7 * * *");
    }
}
