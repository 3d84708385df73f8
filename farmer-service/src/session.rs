// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock as StdRwLock},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use lok_common::{WireCodec, account_id_from_token, codec::gunzip, codec::value_to_bytes};
use serde_json::{Value, json};
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    api::{Credentials, GameApi, device_info},
    error::ApiError,
    retry::RetryPolicy,
    token_store::TokenStore,
};

const MIN_CALL_SPACING: Duration = Duration::from_millis(100);
const DUPLICATE_WAIT: Duration = Duration::from_secs(2);
const MAX_DUPLICATE_RETRIES: u32 = 5;

/// Everything bound to one authenticated session. Replaced as a whole.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub token: Option<String>,
    pub codec: WireCodec,
    pub protected: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub token: Option<String>,
    pub xor_key: String,
    pub protected: HashSet<String>,
}

/// Receives side effects of successful calls.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_resources(&self, resources: [i64; 4]);
    async fn on_quota_exceeded(&self);
}

pub struct SessionClient {
    http: reqwest::Client,
    api_base: String,
    auth_base: String,
    session: RwLock<Session>,
    last_request_at: Mutex<Option<Instant>>,
    transport_policy: RetryPolicy,
    token_store: Arc<dyn TokenStore>,
    observer: StdRwLock<Option<Arc<dyn SessionObserver>>>,
}

impl SessionClient {
    pub fn new(
        http: reqwest::Client,
        api_base: impl Into<String>,
        auth_base: impl Into<String>,
        transport_policy: RetryPolicy,
        token_store: Arc<dyn TokenStore>,
    ) -> Self {
        Self {
            http,
            api_base: with_trailing_slash(api_base.into()),
            auth_base: with_trailing_slash(auth_base.into()),
            session: RwLock::new(Session::default()),
            last_request_at: Mutex::new(None),
            transport_policy,
            token_store,
            observer: StdRwLock::new(None),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        if let Ok(mut slot) = self.observer.write() {
            *slot = Some(observer);
        }
    }

    fn observer(&self) -> Option<Arc<dyn SessionObserver>> {
        self.observer.read().ok().and_then(|slot| slot.clone())
    }

    pub async fn last_request_at(&self) -> Option<Instant> {
        *self.last_request_at.lock().await
    }

    /// Waits so consecutive calls are at least 100ms apart, then stamps the call.
    async fn throttle(&self) {
        let mut last = self.last_request_at.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + MIN_CALL_SPACING;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn persist_token(&self, token: &str) {
        let Some(account_id) = account_id_from_token(token) else {
            return;
        };
        if let Err(error) = self.token_store.save(&account_id, token).await {
            warn!(account_id = %account_id, error = %error, "failed to persist session token");
        }
    }

    async fn forget_token(&self) {
        let token = self.session.read().await.token.clone();
        if let Some(account_id) = token.as_deref().and_then(account_id_from_token) {
            if let Err(error) = self.token_store.remove(&account_id).await {
                warn!(account_id = %account_id, error = %error, "failed to remove session token");
            }
        }
    }

    async fn post(&self, base: &str, endpoint: &str, body: &Value) -> Result<Value, ApiError> {
        let mut duplicates = 0;
        loop {
            let result = self
                .transport_policy
                .run(
                    endpoint,
                    || self.post_once(base, endpoint, body),
                    ApiError::is_transient,
                )
                .await;
            match result {
                Err(ApiError::Duplicated) if duplicates < MAX_DUPLICATE_RETRIES => {
                    duplicates += 1;
                    debug!(endpoint, duplicates, "backend reported duplicated request; waiting");
                    tokio::time::sleep(DUPLICATE_WAIT).await;
                }
                other => return other,
            }
        }
    }

    async fn post_once(&self, base: &str, endpoint: &str, body: &Value) -> Result<Value, ApiError> {
        let (token, codec, protected) = {
            let session = self.session.read().await;
            (
                session.token.clone(),
                session.codec.clone(),
                session.protected.contains(endpoint),
            )
        };

        let payload = if protected {
            codec.encode_json(body)?
        } else {
            body.to_string()
        };

        self.throttle().await;
        let mut request = self
            .http
            .post(format!("{base}{endpoint}"))
            .form(&[("json", payload)]);
        if let Some(token) = token.as_deref() {
            request = request.header("X-Access-Token", token);
        }
        let response = request.send().await?;
        let text = response.text().await?;

        let decoded = decode_response_text(&text, protected, &codec)?;
        let unpacked = unpack_response(decoded)?;
        match interpret_response(unpacked) {
            Ok(value) => {
                if let Some(resources) = resource_vector(&value) {
                    if let Some(observer) = self.observer() {
                        observer.on_resources(resources).await;
                    }
                }
                Ok(value)
            }
            Err(error) => {
                match &error {
                    ApiError::QuotaExceeded => {
                        if let Some(observer) = self.observer() {
                            observer.on_quota_exceeded().await;
                        }
                    }
                    ApiError::NotAuthenticated(code) if code == crate::error::CODE_NO_AUTH => {
                        self.forget_token().await;
                    }
                    _ => {}
                }
                debug!(endpoint, error = %error, "backend call rejected");
                Err(error)
            }
        }
    }

    async fn replace_session(&self, session: Session) {
        *self.session.write().await = session;
    }
}

#[async_trait]
impl GameApi for SessionClient {
    async fn call(&self, endpoint: &str, body: Value) -> Result<Value, ApiError> {
        let api_base = self.api_base.clone();
        self.post(&api_base, endpoint, &body).await
    }

    async fn login(&self, credentials: &Credentials) -> Result<String, ApiError> {
        let body = json!({
            "authType": "email",
            "email": credentials.email,
            "password": credentials.password,
            "deviceInfo": device_info(),
        });
        let auth_base = self.auth_base.clone();
        let response = self
            .post(&auth_base, "auth/login", &body)
            .await
            .map_err(|error| match error {
                ApiError::Business(code) => ApiError::Auth(code),
                other => other,
            })?;
        let token = response
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Auth("login response carried no token".to_string()))?;

        self.replace_session(Session {
            token: Some(token.clone()),
            ..Session::default()
        })
        .await;
        self.persist_token(&token).await;
        info!("logged in with credentials");
        Ok(token)
    }

    async fn connect(&self) -> Result<(), ApiError> {
        let auth_base = self.auth_base.clone();
        let response = self
            .post(
                &auth_base,
                "auth/connect",
                &json!({"deviceInfo": {"build": "global"}}),
            )
            .await?;
        let handshake = parse_handshake(&response)?;

        let mut session = self.session.read().await.clone();
        if let Some(token) = handshake.token.clone() {
            session.token = Some(token);
        }
        session.codec = WireCodec::new(handshake.xor_key.clone());
        session.protected = handshake.protected.clone();
        let token = session.token.clone();
        self.replace_session(session).await;

        if let Some(token) = token.as_deref() {
            self.persist_token(token).await;
        }
        info!(
            protected_endpoints = handshake.protected.len(),
            "session handshake complete"
        );
        Ok(())
    }

    async fn current_token(&self) -> Option<String> {
        self.session.read().await.token.clone()
    }

    async fn codec(&self) -> WireCodec {
        self.session.read().await.codec.clone()
    }

    async fn install_token(&self, token: String) {
        self.replace_session(Session {
            token: Some(token),
            ..Session::default()
        })
        .await;
    }
}

fn with_trailing_slash(mut base: String) -> String {
    if !base.ends_with('/') {
        base.push('/');
    }
    base
}

/// Protected responses arrive as `base64(xor(json))` unless they are plain JSON.
pub fn decode_response_text(
    text: &str,
    protected: bool,
    codec: &WireCodec,
) -> Result<Value, ApiError> {
    let trimmed = text.trim_start();
    if protected && !trimmed.starts_with('{') {
        return Ok(codec.decode_json(trimmed.as_bytes())?);
    }
    serde_json::from_str(trimmed).map_err(|error| ApiError::Decode(error.to_string()))
}

/// Expands `isPacked` responses whose `payload` is a gzip byte array.
pub fn unpack_response(value: Value) -> Result<Value, ApiError> {
    if value.get("isPacked").and_then(Value::as_bool) != Some(true) {
        return Ok(value);
    }
    let bytes = value
        .get("payload")
        .and_then(value_to_bytes)
        .ok_or_else(|| ApiError::Decode("packed response without byte payload".to_string()))?;
    let raw = gunzip(&bytes)?;
    serde_json::from_slice(&raw).map_err(|error| ApiError::Decode(error.to_string()))
}

pub fn interpret_response(value: Value) -> Result<Value, ApiError> {
    if value.get("result").and_then(Value::as_bool) == Some(true) {
        return Ok(value);
    }
    let code = value
        .get("err")
        .and_then(|err| err.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    Err(ApiError::from_code(code))
}

pub fn parse_handshake(value: &Value) -> Result<Handshake, ApiError> {
    let region_hash = value
        .get("regionHash")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Handshake("missing regionHash".to_string()))?;
    let region_raw = STANDARD
        .decode(region_hash)
        .map_err(|error| ApiError::Handshake(format!("regionHash is not base64: {error}")))?;
    let region: String = serde_json::from_slice(&region_raw)
        .map_err(|error| ApiError::Handshake(format!("regionHash is not a json string: {error}")))?;
    let xor_key = region
        .split_once('-')
        .map(|(_, key)| key.to_string())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ApiError::Handshake("regionHash carries no key".to_string()))?;

    let protected = match value.get("lstProtect").and_then(Value::as_str) {
        Some(encoded) => {
            let raw = STANDARD.decode(encoded).map_err(|error| {
                ApiError::Handshake(format!("lstProtect is not base64: {error}"))
            })?;
            let urls: Vec<String> = serde_json::from_slice(&raw).map_err(|error| {
                ApiError::Handshake(format!("lstProtect is not a url list: {error}"))
            })?;
            urls.iter()
                .map(|url| {
                    url.rsplit_once("/api/")
                        .map_or(url.as_str(), |(_, path)| path)
                        .to_string()
                })
                .collect()
        }
        None => HashSet::new(),
    };

    Ok(Handshake {
        token: value.get("token").and_then(Value::as_str).map(str::to_string),
        xor_key,
        protected,
    })
}

fn resource_vector(value: &Value) -> Option<[i64; 4]> {
    let items = value.get("resources")?.as_array()?;
    if items.len() != 4 {
        return None;
    }
    let mut resources = [0i64; 4];
    for (slot, item) in resources.iter_mut().zip(items) {
        *slot = item.as_i64().or_else(|| item.as_f64().map(|n| n as i64))?;
    }
    Some(resources)
}
