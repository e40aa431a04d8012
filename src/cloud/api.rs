// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP calls to the cloud: login, relay dispatch and the device list.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use super::frame::PROTOCOL_VERSION;
use crate::config::{AppCredential, CloudConfig, Identity};
use crate::device::DeviceRecord;
use crate::error::{AuthError, ConnectionError, ParseError};

/// Error code meaning the account lives in another region.
const REGION_MISMATCH: i64 = 301;

/// Error codes meaning the bearer token is no longer valid.
const TOKEN_REJECTED: [i64; 2] = [401, 406];

/// Relay port used when the dispatch reply omits one.
const DEFAULT_RELAY_PORT: u16 = 8080;

type HmacSha256 = Hmac<Sha256>;

/// Signs a request body with an app secret.
///
/// Returns the base64 encoded HMAC-SHA256 of `body` keyed by `secret`.
///
/// # Errors
///
/// Returns [`AuthError::InvalidSecret`] if the secret cannot key the HMAC.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidSecret)?;
    mac.update(body);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Returns a fresh 8 character nonce.
pub(crate) fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// Returns the current Unix time in seconds.
pub(crate) fn timestamp() -> i64 {
    Utc::now().timestamp()
}

/// The result of a successful login.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Bearer token.
    pub token: String,
    /// API key of the account.
    pub apikey: String,
    /// Region the account lives in.
    pub region: String,
    /// App id the token was issued to.
    pub appid: String,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("token", &"<redacted>")
            .field("apikey", &self.apikey)
            .field("region", &self.region)
            .field("appid", &self.appid)
            .finish()
    }
}

/// The relay host handed out by the dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHost {
    /// Host name or address.
    pub domain: String,
    /// Port.
    pub port: u16,
}

impl RelayHost {
    /// Returns the relay connection URL.
    #[must_use]
    pub fn url(&self, scheme: &str) -> String {
        format!("{scheme}://{}:{}/api/ws", self.domain, self.port)
    }
}

#[derive(Serialize)]
struct LoginBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(rename = "phoneNumber", skip_serializing_if = "Option::is_none")]
    phone_number: Option<&'a str>,
    password: &'a str,
    #[serde(rename = "countryCode")]
    country_code: &'a str,
    ts: i64,
    appid: &'a str,
    nonce: String,
    version: u8,
}

#[derive(Debug, Default, Deserialize)]
struct LoginReply {
    #[serde(default)]
    error: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    at: Option<String>,
    #[serde(default)]
    user: Option<LoginUser>,
    #[serde(default)]
    data: Option<Box<LoginReply>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoginUser {
    #[serde(default)]
    apikey: Option<String>,
}

impl LoginReply {
    /// Folds a `{error, data: {...}}` envelope into a flat reply.
    fn flatten(self) -> Self {
        match self.data {
            Some(data) => Self {
                error: if self.error == 0 { data.error } else { self.error },
                msg: self.msg.or(data.msg),
                region: data.region.or(self.region),
                at: data.at,
                user: data.user,
                data: None,
            },
            None => self,
        }
    }

    fn into_context(self, region: String, appid: &str) -> Result<AuthContext, AuthError> {
        let token = self.at.ok_or(AuthError::MissingField("at"))?;
        let apikey = self
            .user
            .and_then(|user| user.apikey)
            .ok_or(AuthError::MissingField("user.apikey"))?;
        Ok(AuthContext {
            token,
            apikey,
            region: self.region.unwrap_or(region),
            appid: appid.to_string(),
        })
    }
}

#[derive(Serialize)]
struct DispatchBody<'a> {
    accept: &'static str,
    appid: &'a str,
    nonce: String,
    ts: i64,
    version: u8,
}

#[derive(Debug, Deserialize)]
struct DispatchReply {
    #[serde(default)]
    error: i64,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(rename = "IP", default)]
    ip: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

/// Client for the cloud's HTTP endpoints.
#[derive(Debug, Clone)]
pub struct CloudApi {
    client: Client,
    config: CloudConfig,
}

impl CloudApi {
    /// Creates a client for the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: CloudConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.http_timeout).build()?;
        Ok(Self { client, config })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    /// Logs in and returns the session credentials.
    ///
    /// When the cloud answers that the account lives in another region, the
    /// login is repeated once against that region's host.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if no app credential is configured, the request
    /// fails, the cloud rejects the login, or the account is redirected a
    /// second time.
    pub async fn authenticate(
        &self,
        identity: &Identity,
        secret: &str,
        credential_index: usize,
    ) -> Result<AuthContext, AuthError> {
        let app = self
            .config
            .app_credential_at(credential_index)
            .ok_or(AuthError::MissingAppCredential)?;

        let mut region = self.config.region.clone();
        let mut redirected = false;
        loop {
            let reply = self.login(&region, identity, secret, app).await?;
            match reply.error {
                0 => {
                    let context = reply.into_context(region, &app.appid)?;
                    tracing::info!(region = %context.region, "Logged into the cloud");
                    return Ok(context);
                }
                REGION_MISMATCH => {
                    let target = reply.region.ok_or(AuthError::MissingField("region"))?;
                    if redirected {
                        return Err(AuthError::RegionMismatch(target));
                    }
                    tracing::info!(from = %region, to = %target, "Account lives in another region, retrying login");
                    region = target;
                    redirected = true;
                }
                code => {
                    return Err(AuthError::Rejected {
                        code,
                        reason: reply.msg.unwrap_or_default(),
                    });
                }
            }
        }
    }

    async fn login(
        &self,
        region: &str,
        identity: &Identity,
        secret: &str,
        app: &AppCredential,
    ) -> Result<LoginReply, AuthError> {
        let (email, phone_number) = match identity {
            Identity::Email(email) => (Some(email.as_str()), None),
            Identity::Phone(phone) => (None, Some(phone.as_str())),
        };
        let body = serde_json::to_string(&LoginBody {
            email,
            phone_number,
            password: secret,
            country_code: &self.config.country_code,
            ts: timestamp(),
            appid: &app.appid,
            nonce: nonce(),
            version: PROTOCOL_VERSION,
        })?;
        let signature = sign(&app.secret, body.as_bytes())?;

        let url = format!("{}/api/user/login", self.config.api_base(region));
        tracing::debug!(url = %url, "Sending login request");

        let reply: LoginReply = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, format!("Sign {signature}"))
            .header("X-CK-Appid", &app.appid)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?
            .json()
            .await?;
        Ok(reply.flatten())
    }

    /// Asks the cloud which relay host to connect to.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Unauthorized`] if the token is refused,
    /// and other [`ConnectionError`]s if the request fails or the reply
    /// has no host.
    pub async fn dispatch(&self, context: &AuthContext) -> Result<RelayHost, ConnectionError> {
        let url = format!("{}/dispatch/app", self.config.dispatch_base(&context.region));
        tracing::debug!(url = %url, "Requesting relay host");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&context.token)
            .json(&DispatchBody {
                accept: "ws",
                appid: &context.appid,
                nonce: nonce(),
                ts: timestamp(),
                version: PROTOCOL_VERSION,
            })
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ConnectionError::Unauthorized);
        }

        let reply: DispatchReply = response.json().await?;
        match reply.error {
            0 => {}
            code if TOKEN_REJECTED.contains(&code) => return Err(ConnectionError::Unauthorized),
            code => {
                return Err(ConnectionError::Cloud {
                    code,
                    reason: reply.reason.unwrap_or_default(),
                });
            }
        }

        let domain = reply
            .domain
            .or(reply.ip)
            .filter(|domain| !domain.is_empty())
            .ok_or(ConnectionError::NoRelayHost)?;
        Ok(RelayHost {
            domain,
            port: reply.port.unwrap_or(DEFAULT_RELAY_PORT),
        })
    }

    /// Fetches the devices registered to the account.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the request fails, the token is
    /// refused, or the reply is not a device list.
    pub async fn devices(&self, context: &AuthContext) -> Result<Vec<DeviceRecord>, ConnectionError> {
        let url = format!(
            "{}/api/user/device?version={PROTOCOL_VERSION}&lang=en&appid={}",
            self.config.api_base(&context.region),
            urlencoding::encode(&context.appid)
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&context.token)
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ConnectionError::Unauthorized);
        }

        let body: Value = response.json().await?;
        if let Some(code) = body.get("error").and_then(Value::as_i64) {
            if TOKEN_REJECTED.contains(&code) {
                return Err(ConnectionError::Unauthorized);
            }
            if code != 0 {
                return Err(ConnectionError::Cloud {
                    code,
                    reason: body
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }

        let devices = parse_device_list(body)?;
        tracing::info!(count = devices.len(), "Fetched device list");
        Ok(devices)
    }
}

/// Extracts device records from any of the device list reply shapes.
fn parse_device_list(body: Value) -> Result<Vec<DeviceRecord>, ParseError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut object) => {
            if let Some(Value::Array(items)) = object.remove("devicelist") {
                items
            } else if let Some(things) = object
                .get_mut("data")
                .and_then(|data| data.get_mut("thingList"))
                .and_then(Value::as_array_mut)
            {
                things
                    .iter_mut()
                    .filter_map(|thing| thing.get_mut("itemData").map(Value::take))
                    .collect()
            } else {
                return Err(ParseError::UnexpectedFormat(
                    "no device list in reply".to_string(),
                ));
            }
        }
        _ => {
            return Err(ParseError::UnexpectedFormat(
                "device list reply is not an object".to_string(),
            ));
        }
    };

    let mut devices = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<DeviceRecord>(item) {
            Ok(record) => devices.push(record),
            Err(e) => tracing::warn!(error = %e, "Skipping malformed device entry"),
        }
    }
    Ok(devices)
}
