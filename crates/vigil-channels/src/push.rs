//! APNs push channel: HTTP/2 provider API with ES256 token auth.
//!
//! The provider token is a JWT signed with the team's `.p8` key. Apple
//! accepts a token for up to an hour, so one is minted and reused for 50 minutes.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use serde_json::{Map, Value};
use vigil_core::config::PushConfig;
use vigil_core::error::{SendError, VigilError};
use vigil_core::traits::NotificationChannel;
use vigil_core::types::Channel;

const PRODUCTION_HOST: &str = "https://api.push.apple.com";
const SANDBOX_HOST: &str = "https://api.sandbox.push.apple.com";
const TOKEN_TTL: Duration = Duration::from_secs(50 * 60);

#[derive(Debug, Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: i64,
}

struct CachedToken {
    jwt: String,
    minted: Instant,
}

/// Apple Push Notification service sender.
pub struct ApnsChannel {
    config: PushConfig,
    key: Option<EncodingKey>,
    client: Option<reqwest::Client>,
    token: Mutex<Option<CachedToken>>,
}

impl ApnsChannel {
    /// Build from config, reading the signing key from `key_path`. Incomplete
    /// credentials or an unreadable key leave the channel unavailable.
    pub fn new(config: PushConfig) -> Self {
        let key = if config.is_complete() {
            match std::fs::read(&config.key_path) {
                Ok(pem) => load_key(&pem),
                Err(e) => {
                    tracing::warn!("⚠️ APNs key {} unreadable: {e}", config.key_path);
                    None
                }
            }
        } else {
            None
        };
        Self::with_key(config, key)
    }

    /// Build with an already-loaded signing key.
    pub fn with_key(config: PushConfig, key: Option<EncodingKey>) -> Self {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
        {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("⚠️ APNs HTTP client unavailable: {e}");
                None
            }
        };
        Self {
            config,
            key,
            client,
            token: Mutex::new(None),
        }
    }

    fn host(&self) -> &'static str {
        if self.config.production {
            PRODUCTION_HOST
        } else {
            SANDBOX_HOST
        }
    }

    /// Current provider token, minting a new one when the cached one has aged out.
    fn provider_token(&self, key: &EncodingKey) -> Result<String, SendError> {
        let mut cached = self
            .token
            .lock()
            .map_err(|e| SendError::retryable(format!("APNs token cache: {e}")))?;
        if let Some(token) = cached.as_ref() {
            if token.minted.elapsed() < TOKEN_TTL {
                return Ok(token.jwt.clone());
            }
        }

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.config.key_id.clone());
        let claims = ProviderClaims {
            iss: &self.config.team_id,
            iat: chrono::Utc::now().timestamp(),
        };
        let jwt = jsonwebtoken::encode(&header, &claims, key)
            .map_err(|e| SendError::permanent(format!("APNs token signing failed: {e}")))?;

        *cached = Some(CachedToken {
            jwt: jwt.clone(),
            minted: Instant::now(),
        });
        Ok(jwt)
    }
}

fn load_key(pem: &[u8]) -> Option<EncodingKey> {
    match EncodingKey::from_ec_pem(pem) {
        Ok(key) => Some(key),
        Err(e) => {
            tracing::warn!("⚠️ APNs key is not a valid EC private key: {e}");
            None
        }
    }
}

/// `{"aps": {"alert": {...}, "sound": "default"}, ...data}`. Data keys never replace `aps`.
pub fn build_payload(title: &str, body: &str, data: &Map<String, Value>) -> Value {
    let mut payload = Map::new();
    payload.insert(
        "aps".into(),
        serde_json::json!({
            "alert": { "title": title, "body": body },
            "sound": "default",
        }),
    );
    for (k, v) in data {
        if k != "aps" {
            payload.insert(k.clone(), v.clone());
        }
    }
    Value::Object(payload)
}

/// Map an APNs response status to a send outcome.
pub fn classify_response(status: u16, reason: &str) -> Result<(), SendError> {
    match status {
        200 => Ok(()),
        // bad request, bad auth, bad path, unregistered device
        400 | 403 | 404 | 410 => Err(SendError::permanent(format!("APNs {status}: {reason}"))),
        429 | 500..=599 => Err(SendError::retryable(format!("APNs {status}: {reason}"))),
        _ => Err(SendError::permanent(format!("APNs unexpected {status}: {reason}"))),
    }
}

#[async_trait]
impl NotificationChannel for ApnsChannel {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn is_available(&self) -> bool {
        self.config.is_complete() && self.key.is_some() && self.client.is_some()
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        data: &Map<String, Value>,
    ) -> Result<(), SendError> {
        let (key, client) = match (&self.key, &self.client, self.config.is_complete()) {
            (Some(key), Some(client), true) => (key, client),
            _ => return Err(VigilError::ChannelUnconfigured("push".into()).into()),
        };
        let device_token = recipient.trim();
        if device_token.is_empty() {
            return Err(SendError::permanent("empty device token"));
        }

        let jwt = self.provider_token(key)?;
        let url = format!("{}/3/device/{device_token}", self.host());

        let resp = client
            .post(&url)
            .bearer_auth(jwt)
            .header("apns-topic", &self.config.bundle_id)
            .header("apns-push-type", "alert")
            .header("apns-priority", "10")
            .json(&build_payload(subject, body, data))
            .send()
            .await
            .map_err(|e| SendError::retryable(format!("APNs request failed: {e}")))?;

        let status = resp.status().as_u16();
        let reason = if status == 200 {
            String::new()
        } else {
            resp.json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(String::from))
                .unwrap_or_else(|| "no reason given".into())
        };

        classify_response(status, &reason)?;
        let short: String = device_token.chars().take(8).collect();
        tracing::debug!("📱 Push delivered to device {short}…");
        Ok(())
    }
}
