// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration types for the gateway.
//!
//! All configuration is built in code. Reading it from files or the command
//! line is left to the embedding application.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use ewegate::config::{BridgeConfig, CloudConfig, GatewayConfig};
//!
//! let cloud = CloudConfig::new("user@example.com", "secret")
//!     .with_app_credential("my-app-id", "my-app-secret")
//!     .with_region("eu");
//!
//! let config = GatewayConfig::new(cloud)
//!     .with_poll_interval(Duration::from_secs(300));
//!
//! let bridge = BridgeConfig::default().with_status_root("/home/ewelink");
//! assert_eq!(bridge.status_root, "/home/ewelink");
//! ```

use std::fmt;
use std::time::Duration;

/// Default API host template. `{region}` is replaced by the account region.
pub const DEFAULT_API_URL: &str = "https://{region}-api.coolkit.cc:8080";

/// Default dispatch host template.
pub const DEFAULT_DISPATCH_URL: &str = "https://{region}-disp.coolkit.cc:8080";

/// An application id and secret pair used to sign login requests.
#[derive(Clone, PartialEq, Eq)]
pub struct AppCredential {
    /// Application id sent with every request.
    pub appid: String,
    /// Secret used as the HMAC key for login signatures.
    pub secret: String,
}

impl AppCredential {
    /// Creates a credential pair.
    #[must_use]
    pub fn new(appid: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            appid: appid.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for AppCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCredential")
            .field("appid", &self.appid)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The account identity used to log in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// An email address.
    Email(String),
    /// A phone number including its `+` country prefix.
    Phone(String),
}

impl Identity {
    /// Classifies a login name as an email address or a phone number.
    ///
    /// # Examples
    ///
    /// ```
    /// use ewegate::config::Identity;
    ///
    /// assert_eq!(Identity::parse("a@b.c"), Identity::Email("a@b.c".into()));
    /// assert_eq!(Identity::parse("4915112345"), Identity::Phone("+4915112345".into()));
    /// ```
    #[must_use]
    pub fn parse(login: &str) -> Self {
        let login = login.trim();
        if login.contains('@') {
            Self::Email(login.to_string())
        } else if login.starts_with('+') {
            Self::Phone(login.to_string())
        } else {
            Self::Phone(format!("+{login}"))
        }
    }
}

/// Configuration for the cloud session.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Account identity.
    pub identity: Identity,
    /// Account password.
    pub password: String,
    /// App credentials to sign logins with.
    pub app_credentials: Vec<AppCredential>,
    /// Index into `app_credentials` to use.
    pub credential_index: usize,
    /// Region tried first.
    pub region: String,
    /// Country code sent with logins.
    pub country_code: String,
    /// API URL template.
    pub api_url: String,
    /// Dispatch URL template.
    pub dispatch_url: String,
    /// Scheme of the relay connection (`wss` in production).
    pub relay_scheme: String,
    /// Pause between a lost connection and the next attempt.
    pub reconnect_cooldown: Duration,
    /// How long a caller waits for a response before giving up.
    pub response_timeout: Duration,
    /// Minimum spacing between two outgoing requests.
    pub send_interval: Duration,
    /// Timeout of the HTTP login, dispatch and device list calls.
    pub http_timeout: Duration,
}

impl CloudConfig {
    /// Creates a configuration for the given login and password.
    #[must_use]
    pub fn new(login: impl AsRef<str>, password: impl Into<String>) -> Self {
        Self {
            identity: Identity::parse(login.as_ref()),
            password: password.into(),
            app_credentials: Vec::new(),
            credential_index: 0,
            region: "us".to_string(),
            country_code: "+1".to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            dispatch_url: DEFAULT_DISPATCH_URL.to_string(),
            relay_scheme: "wss".to_string(),
            reconnect_cooldown: Duration::from_secs(60),
            response_timeout: Duration::from_secs(5),
            send_interval: Duration::from_secs(1),
            http_timeout: Duration::from_secs(10),
        }
    }

    /// Adds an app credential pair.
    #[must_use]
    pub fn with_app_credential(
        mut self,
        appid: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.app_credentials.push(AppCredential::new(appid, secret));
        self
    }

    /// Selects which app credential to use.
    #[must_use]
    pub fn with_credential_index(mut self, index: usize) -> Self {
        self.credential_index = index;
        self
    }

    /// Sets the region to try first (default `us`).
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Sets the country code sent with logins (default `+1`).
    #[must_use]
    pub fn with_country_code(mut self, code: impl Into<String>) -> Self {
        self.country_code = code.into();
        self
    }

    /// Overrides the API URL template.
    #[must_use]
    pub fn with_api_url(mut self, template: impl Into<String>) -> Self {
        self.api_url = template.into();
        self
    }

    /// Overrides the dispatch URL template.
    #[must_use]
    pub fn with_dispatch_url(mut self, template: impl Into<String>) -> Self {
        self.dispatch_url = template.into();
        self
    }

    /// Sets the relay connection scheme (default `wss`).
    #[must_use]
    pub fn with_relay_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.relay_scheme = scheme.into();
        self
    }

    /// Sets the reconnect cooldown (default 60 seconds).
    #[must_use]
    pub fn with_reconnect_cooldown(mut self, cooldown: Duration) -> Self {
        self.reconnect_cooldown = cooldown;
        self
    }

    /// Sets the response timeout (default 5 seconds).
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sets the minimum interval between requests (default 1 second).
    #[must_use]
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    /// Sets the HTTP timeout (default 10 seconds).
    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Returns the selected app credential.
    ///
    /// An out-of-range index falls back to the first credential.
    #[must_use]
    pub fn app_credential(&self) -> Option<&AppCredential> {
        self.app_credential_at(self.credential_index)
    }

    /// Returns the app credential at `index`, falling back to the first.
    #[must_use]
    pub fn app_credential_at(&self, index: usize) -> Option<&AppCredential> {
        self.app_credentials
            .get(index)
            .or_else(|| {
                tracing::warn!(
                    index,
                    available = self.app_credentials.len(),
                    "App credential index out of range, using the first one"
                );
                self.app_credentials.first()
            })
    }

    /// Returns the API base URL for a region.
    #[must_use]
    pub fn api_base(&self, region: &str) -> String {
        self.api_url.replace("{region}", region)
    }

    /// Returns the dispatch base URL for a region.
    #[must_use]
    pub fn dispatch_base(&self, region: &str) -> String {
        self.dispatch_url.replace("{region}", region)
    }
}

/// Topic roots used by the bus bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Root under which commands are received.
    pub command_root: String,
    /// Root under which status is published.
    pub status_root: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command_root: "/ewelink_command".to_string(),
            status_root: "/ewelink_status".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Sets the command root.
    #[must_use]
    pub fn with_command_root(mut self, root: impl Into<String>) -> Self {
        self.command_root = root.into();
        self
    }

    /// Sets the status root.
    #[must_use]
    pub fn with_status_root(mut self, root: impl Into<String>) -> Self {
        self.status_root = root.into();
        self
    }

    /// Returns the subscription filter covering every command topic.
    #[must_use]
    pub fn command_filter(&self) -> String {
        format!("{}/#", self.command_root.trim_end_matches('/'))
    }

    /// Builds a status topic below the status root.
    #[must_use]
    pub fn status_topic(&self, deviceid: &str, leaf: &str) -> String {
        format!("{}/{deviceid}/{leaf}", self.status_root.trim_end_matches('/'))
    }
}

/// Configuration for the gateway as a whole.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Cloud session configuration.
    pub cloud: CloudConfig,
    /// If set, every device is queried at this interval.
    pub poll_interval: Option<Duration>,
    /// Capacity of the gateway event bus.
    pub event_capacity: usize,
}

impl GatewayConfig {
    /// Creates a gateway configuration around a cloud configuration.
    #[must_use]
    pub fn new(cloud: CloudConfig) -> Self {
        Self {
            cloud,
            poll_interval: None,
            event_capacity: 256,
        }
    }

    /// Enables periodic polling of every device.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Sets the event bus capacity (default 256).
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_classification() {
        assert_eq!(
            Identity::parse(" me@example.com "),
            Identity::Email("me@example.com".to_string())
        );
        assert_eq!(
            Identity::parse("+4412345"),
            Identity::Phone("+4412345".to_string())
        );
        assert_eq!(
            Identity::parse("4412345"),
            Identity::Phone("+4412345".to_string())
        );
    }

    #[test]
    fn cloud_defaults() {
        let config = CloudConfig::new("me@example.com", "pw");
        assert_eq!(config.region, "us");
        assert_eq!(config.reconnect_cooldown, Duration::from_secs(60));
        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert_eq!(config.send_interval, Duration::from_secs(1));
        assert_eq!(config.relay_scheme, "wss");
        assert!(config.app_credential().is_none());
    }

    #[test]
    fn region_templates() {
        let config = CloudConfig::new("me@example.com", "pw");
        assert_eq!(config.api_base("eu"), "https://eu-api.coolkit.cc:8080");
        assert_eq!(config.dispatch_base("as"), "https://as-disp.coolkit.cc:8080");
    }

    #[test]
    fn credential_index_falls_back_to_first() {
        let config = CloudConfig::new("me@example.com", "pw")
            .with_app_credential("a", "1")
            .with_app_credential("b", "2")
            .with_credential_index(7);
        assert_eq!(config.app_credential().map(|c| c.appid.as_str()), Some("a"));

        let config = config.with_credential_index(1);
        assert_eq!(config.app_credential().map(|c| c.appid.as_str()), Some("b"));
    }

    #[test]
    fn secret_is_not_printed() {
        let cred = AppCredential::new("id", "topsecret");
        assert!(!format!("{cred:?}").contains("topsecret"));
    }

    #[test]
    fn bridge_topics() {
        let config = BridgeConfig::default().with_status_root("/status/");
        assert_eq!(config.command_filter(), "/ewelink_command/#");
        assert_eq!(config.status_topic("1000ab", "switch"), "/status/1000ab/switch");
    }
}
