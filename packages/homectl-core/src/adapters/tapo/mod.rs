//! TP-Link Tapo bulbs over the local KLAP protocol.
//!
//! A KLAP session is expensive to set up (two HTTP round trips and a hash
//! check), so established sessions are cached per host and shared by every
//! [`DeviceSession`] the adapter hands out until the device-issued cookie
//! expires. When the device drops the session or stops answering, the cached
//! entry is discarded and the handshake is repeated, up to
//! [`TAPO_MAX_REAUTH`] times per operation.

mod klap;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use self::klap::{auth_hash, handshake1_hash, handshake2_hash, KlapCipher};
use super::{DeviceAdapter, DeviceSession};
use crate::config::{CredentialStore, TapoAccount};
use crate::error::{DeviceError, DeviceResult};
use crate::model::{
    Capability, DeviceCommand, DeviceDescriptor, DeviceState, Endpoint, Hsv, Protocol,
};
use crate::protocol_constants::{TAPO_DEFAULT_SESSION_SECS, TAPO_MAX_REAUTH, TAPO_SESSION_EXPIRED};
use crate::utils::now_millis;

/// Adapter for Tapo bulbs (L510/L530 family).
pub struct TapoAdapter {
    client: TapoClient,
}

impl TapoAdapter {
    pub fn new(credentials: CredentialStore, http: reqwest::Client) -> Self {
        Self {
            client: TapoClient {
                http,
                credentials,
                sessions: Arc::new(DashMap::new()),
            },
        }
    }

    /// Reads name, model and color support from a bulb.
    ///
    /// Used by discovery, since Tapo bulbs cannot be found by broadcast.
    pub async fn identify(&self, endpoint: &Endpoint) -> DeviceResult<TapoIdentity> {
        let info = self.client.device_info(endpoint).await?;
        Ok(TapoIdentity {
            nickname: info.nickname.as_deref().map(decode_nickname),
            model: info.model.clone(),
            has_color: info.hue.is_some(),
        })
    }
}

/// What a bulb reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapoIdentity {
    pub nickname: Option<String>,
    pub model: Option<String>,
    pub has_color: bool,
}

#[async_trait]
impl DeviceAdapter for TapoAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Tapo
    }

    async fn connect(&self, descriptor: &DeviceDescriptor) -> DeviceResult<Box<dyn DeviceSession>> {
        self.client.ensure_session(&descriptor.address).await?;
        Ok(Box::new(TapoSession {
            client: self.client.clone(),
            endpoint: descriptor.address.clone(),
        }))
    }
}

struct TapoSession {
    client: TapoClient,
    endpoint: Endpoint,
}

#[async_trait]
impl DeviceSession for TapoSession {
    async fn apply_command(&mut self, command: &DeviceCommand) -> DeviceResult<()> {
        let params = device_info_params(command)?;
        self.client
            .call(
                &self.endpoint,
                json!({
                    "method": "set_device_info",
                    "params": params,
                    "requestTimeMils": now_millis(),
                }),
            )
            .await
            .map(|_| ())
    }

    async fn fetch_state(&mut self) -> DeviceResult<DeviceState> {
        let info = self.client.device_info(&self.endpoint).await?;
        Ok(info.to_state(now_millis()))
    }

    async fn close(self: Box<Self>) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// KLAP client
// ─────────────────────────────────────────────────────────────────────────────

struct CachedSession {
    expires_at: Instant,
    inner: Mutex<KlapSession>,
}

struct KlapSession {
    cookie: String,
    cipher: KlapCipher,
}

/// Why a request failed.
enum CallError {
    /// The device no longer accepts the session.
    SessionRejected(String),
    Device(DeviceError),
}

impl CallError {
    /// Whether a fresh handshake may fix the failure.
    fn needs_reauth(&self) -> bool {
        matches!(
            self,
            Self::SessionRejected(_) | Self::Device(DeviceError::DeviceUnreachable(_))
        )
    }

    fn into_device_error(self) -> DeviceError {
        match self {
            Self::SessionRejected(reason) => {
                DeviceError::ProtocolError(format!("session rejected: {reason}"))
            }
            Self::Device(err) => err,
        }
    }
}

impl From<DeviceError> for CallError {
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}

#[derive(Clone)]
struct TapoClient {
    http: reqwest::Client,
    credentials: CredentialStore,
    sessions: Arc<DashMap<String, Arc<CachedSession>>>,
}

impl TapoClient {
    fn account(&self) -> DeviceResult<TapoAccount> {
        self.credentials
            .read()
            .tapo_account
            .clone()
            .ok_or_else(|| DeviceError::ConfigurationError("no Tapo account configured".into()))
    }

    /// Returns the cached session for `endpoint`, or performs the handshake.
    async fn ensure_session(&self, endpoint: &Endpoint) -> DeviceResult<Arc<CachedSession>> {
        let key = endpoint.to_string();
        let cached = self.sessions.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(session) = cached {
            if Instant::now() < session.expires_at {
                return Ok(session);
            }
            log::debug!("[Tapo] Session for {} expired", key);
            self.sessions.remove(&key);
        }

        let account = self.account()?;
        let session = Arc::new(self.handshake(endpoint, &account).await?);
        self.sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    async fn handshake(
        &self,
        endpoint: &Endpoint,
        account: &TapoAccount,
    ) -> DeviceResult<CachedSession> {
        let base = format!("http://{endpoint}");
        let local_seed: [u8; 16] = rand::random();
        let auth = auth_hash(&account.username, &account.password);

        let response = self
            .http
            .post(format!("{base}/app/handshake1"))
            .body(local_seed.to_vec())
            .send()
            .await
            .map_err(|e| DeviceError::ConnectionError(format!("{endpoint}: {e}")))?;
        if !response.status().is_success() {
            return Err(DeviceError::ProtocolError(format!(
                "handshake1 returned {}",
                response.status()
            )));
        }
        let (cookie, timeout_secs) = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(parse_session_cookie)
            .ok_or_else(|| DeviceError::ProtocolError("handshake1 set no session cookie".into()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| DeviceError::DeviceUnreachable(format!("{endpoint}: {e}")))?;
        if body.len() < 48 {
            return Err(DeviceError::ProtocolError(format!(
                "handshake1 response too short ({} bytes)",
                body.len()
            )));
        }
        let (remote_seed, server_hash) = body.split_at(16);
        if server_hash[..32] != handshake1_hash(&local_seed, remote_seed, &auth) {
            return Err(DeviceError::ConfigurationError(format!(
                "Tapo device at {endpoint} rejected the account credentials"
            )));
        }

        let response = self
            .http
            .post(format!("{base}/app/handshake2"))
            .header(COOKIE, &cookie)
            .body(handshake2_hash(&local_seed, remote_seed, &auth).to_vec())
            .send()
            .await
            .map_err(|e| DeviceError::ConnectionError(format!("{endpoint}: {e}")))?;
        if !response.status().is_success() {
            return Err(DeviceError::ProtocolError(format!(
                "handshake2 returned {}",
                response.status()
            )));
        }

        log::info!("[Tapo] Established session with {}", endpoint);
        Ok(CachedSession {
            expires_at: Instant::now() + Duration::from_secs(timeout_secs),
            inner: Mutex::new(KlapSession {
                cookie,
                cipher: KlapCipher::new(&local_seed, remote_seed, &auth),
            }),
        })
    }

    /// Sends a request, re-authenticating when the session is rejected.
    async fn call(&self, endpoint: &Endpoint, request: Value) -> DeviceResult<Value> {
        let key = endpoint.to_string();
        let mut reauths = 0;
        loop {
            let session = self.ensure_session(endpoint).await?;
            let outcome = {
                let mut klap = session.inner.lock().await;
                self.send(endpoint, &mut klap, &request).await
            };
            match outcome {
                Ok(result) => return Ok(result),
                Err(err) if err.needs_reauth() && reauths < TAPO_MAX_REAUTH => {
                    self.sessions
                        .remove_if(&key, |_, cached| Arc::ptr_eq(cached, &session));
                    reauths += 1;
                    log::info!(
                        "[Tapo] Re-authenticating with {} ({}/{})",
                        endpoint,
                        reauths,
                        TAPO_MAX_REAUTH
                    );
                }
                Err(err) => {
                    if err.needs_reauth() {
                        self.sessions
                            .remove_if(&key, |_, cached| Arc::ptr_eq(cached, &session));
                    }
                    return Err(err.into_device_error());
                }
            }
        }
    }

    async fn send(
        &self,
        endpoint: &Endpoint,
        klap: &mut KlapSession,
        request: &Value,
    ) -> Result<Value, CallError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| DeviceError::InvalidArgument(e.to_string()))?;
        let seq = klap.cipher.next_seq();
        let body = klap.cipher.encrypt(seq, &payload)?;

        let response = self
            .http
            .post(format!("http://{endpoint}/app/request?seq={seq}"))
            .header(COOKIE, &klap.cookie)
            .body(body)
            .send()
            .await
            .map_err(|e| DeviceError::DeviceUnreachable(format!("{endpoint}: {e}")))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(CallError::SessionRejected(format!(
                    "request returned {}",
                    response.status()
                )));
            }
            status => {
                return Err(
                    DeviceError::ProtocolError(format!("request returned {status}")).into(),
                );
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DeviceError::DeviceUnreachable(format!("{endpoint}: {e}")))?;
        let plaintext = klap.cipher.decrypt(seq, &body)?;
        let reply: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| DeviceError::ProtocolError(format!("malformed reply: {e}")))?;

        match reply.get("error_code").and_then(Value::as_i64) {
            Some(0) => Ok(reply.get("result").cloned().unwrap_or(Value::Null)),
            Some(TAPO_SESSION_EXPIRED) => {
                Err(CallError::SessionRejected("device reported session expired".into()))
            }
            Some(code) => Err(DeviceError::ProtocolError(format!(
                "{} failed with error_code {}",
                request["method"].as_str().unwrap_or("request"),
                code
            ))
            .into()),
            None => Err(DeviceError::ProtocolError("reply has no error_code".into()).into()),
        }
    }

    async fn device_info(&self, endpoint: &Endpoint) -> DeviceResult<DeviceInfo> {
        let result = self
            .call(
                endpoint,
                json!({ "method": "get_device_info", "requestTimeMils": now_millis() }),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| DeviceError::ProtocolError(format!("malformed device info: {e}")))
    }
}

/// Extracts `TP_SESSIONID=...` and its `TIMEOUT` from a `Set-Cookie` value.
fn parse_session_cookie(header: &str) -> Option<(String, u64)> {
    let mut session = None;
    let mut timeout = TAPO_DEFAULT_SESSION_SECS;
    for part in header.split(';') {
        match part.trim().split_once('=') {
            Some(("TP_SESSIONID", id)) => session = Some(format!("TP_SESSIONID={id}")),
            Some(("TIMEOUT", secs)) => {
                timeout = secs.parse().unwrap_or(TAPO_DEFAULT_SESSION_SECS);
            }
            _ => {}
        }
    }
    session.map(|cookie| (cookie, timeout))
}

// ─────────────────────────────────────────────────────────────────────────────
// Field mapping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DeviceInfo {
    device_on: bool,
    #[serde(default)]
    brightness: Option<u8>,
    #[serde(default)]
    hue: Option<u16>,
    #[serde(default)]
    saturation: Option<u8>,
    #[serde(default)]
    color_temp: Option<u16>,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

impl DeviceInfo {
    fn to_state(&self, now: u64) -> DeviceState {
        let color_temp = self.color_temp.filter(|t| *t > 0);
        let color = match (self.hue, self.saturation, color_temp) {
            (Some(h), Some(s), None) => Some(
                Hsv {
                    h,
                    s: f64::from(s) / 100.0,
                    v: f64::from(self.brightness.unwrap_or(100)) / 100.0,
                }
                .to_rgb(),
            ),
            _ => None,
        };
        DeviceState {
            power: self.device_on,
            brightness: self.brightness,
            color,
            color_temp,
            reachable: true,
            last_updated: now,
            ..DeviceState::default()
        }
    }
}

/// Nicknames are base64-encoded UTF-8. Undecodable values are shown as is.
fn decode_nickname(raw: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| raw.to_string())
}

/// `set_device_info` parameters for a command.
fn device_info_params(command: &DeviceCommand) -> DeviceResult<Value> {
    match *command {
        DeviceCommand::SetPower { on } => Ok(json!({ "device_on": on })),
        DeviceCommand::SetBrightness { level: 0 } => Ok(json!({ "device_on": false })),
        DeviceCommand::SetBrightness { level } => Ok(json!({
            "device_on": true,
            "brightness": level.clamp(1, 100),
        })),
        DeviceCommand::SetColor { color } => {
            let hsv = color.to_hsv();
            let mut params = json!({
                "device_on": true,
                "hue": hsv.h,
                "saturation": (hsv.s * 100.0).round() as u8,
                "color_temp": 0,
            });
            let brightness = (hsv.v * 100.0).round() as u8;
            if brightness > 0 {
                params["brightness"] = json!(brightness);
            }
            Ok(params)
        }
        DeviceCommand::SetVolume { .. } | DeviceCommand::SetMuted { .. } => {
            Err(DeviceError::UnsupportedCapability(Capability::Volume))
        }
        DeviceCommand::Media { .. } => Err(DeviceError::UnsupportedCapability(Capability::Media)),
    }
}
