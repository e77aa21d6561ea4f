//! OIDC verification for inbound push notifications.
//!
//! Pub/sub push carries a bearer token signed by the platform's identity
//! service. Verification fails closed: any missing piece (header, audience
//! configuration, key, signature, claim) rejects the notification. The only
//! way around it is the explicit development opt-out in configuration.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::Config;

const CERTS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const KEY_CACHE_TTL: Duration = Duration::from_secs(3600);
const ALLOWED_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];

pub struct NotificationVerifier {
    enabled: bool,
    audience: Option<String>,
    http: reqwest::Client,
    certs_url: String,
    keys: tokio::sync::RwLock<Option<CachedKeys>>,
}

struct CachedKeys {
    by_kid: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[allow(dead_code)]
    sub: String,
}

impl NotificationVerifier {
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.verify_notifications,
            audience: config.notification_audience.clone(),
            http: reqwest::Client::new(),
            certs_url: CERTS_URL.to_string(),
            keys: tokio::sync::RwLock::new(None),
        }
    }

    pub fn disabled_for_development() -> Self {
        Self {
            enabled: false,
            audience: None,
            http: reqwest::Client::new(),
            certs_url: CERTS_URL.to_string(),
            keys: tokio::sync::RwLock::new(None),
        }
    }

    /// Check the Authorization header of a push delivery.
    pub async fn verify(&self, authorization: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(audience) = &self.audience else {
            tracing::warn!("notification verification enabled but no audience configured");
            return false;
        };

        let Some(token) = authorization.and_then(|h| h.strip_prefix("Bearer ")) else {
            tracing::warn!("push notification without bearer token");
            return false;
        };

        let header = match decode_header(token) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable notification token header");
                return false;
            }
        };
        let Some(kid) = header.kid else {
            tracing::warn!("notification token missing key id");
            return false;
        };

        let Some(key) = self.key_for(&kid).await else {
            tracing::warn!(kid = %kid, "no signing key for notification token");
            return false;
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[audience]);
        validation.set_issuer(&ALLOWED_ISSUERS);

        match decode::<Claims>(token, &key, &validation) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "notification token rejected");
                false
            }
        }
    }

    async fn key_for(&self, kid: &str) -> Option<DecodingKey> {
        {
            let cached = self.keys.read().await;
            if let Some(keys) = cached.as_ref() {
                if keys.fetched_at.elapsed() < KEY_CACHE_TTL {
                    if let Some(key) = keys.by_kid.get(kid) {
                        return Some(key.clone());
                    }
                }
            }
        }

        // Cache miss or stale; refetch. An unknown kid after a fresh fetch
        // stays a verification failure.
        match self.fetch_keys().await {
            Ok(by_kid) => {
                let key = by_kid.get(kid).cloned();
                *self.keys.write().await = Some(CachedKeys {
                    by_kid,
                    fetched_at: Instant::now(),
                });
                key
            }
            Err(e) => {
                tracing::warn!(error = %e, "signing key fetch failed");
                None
            }
        }
    }

    async fn fetch_keys(&self) -> anyhow::Result<HashMap<String, DecodingKey>> {
        let jwks: JwksResponse = self
            .http
            .get(&self.certs_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut by_kid = HashMap::with_capacity(jwks.keys.len());
        for jwk in jwks.keys {
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    by_kid.insert(jwk.kid, key);
                }
                Err(e) => {
                    tracing::warn!(kid = %jwk.kid, error = %e, "unusable signing key");
                }
            }
        }
        Ok(by_kid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueModeConfig;

    fn config(verify: bool, audience: Option<&str>) -> Config {
        Config {
            database_url: "postgres://localhost/test".into(),
            port: 8080,
            openai_api_key: "sk-test".into(),
            primary_model: "gpt-5".into(),
            fallback_model: "gpt-5-mini".into(),
            notification_audience: audience.map(Into::into),
            verify_notifications: verify,
            push_topic: "mail-notifications".into(),
            poll_tick_secs: 60,
            queue_mode: QueueModeConfig::Queue,
            extraction_bucket: "test-bucket".into(),
            mail_access_token: String::new(),
        }
    }

    #[tokio::test]
    async fn opt_out_accepts_anything() {
        let verifier = NotificationVerifier::new(&config(false, None));
        assert!(verifier.verify(None).await);
        assert!(verifier.verify(Some("garbage")).await);
    }

    #[tokio::test]
    async fn missing_audience_fails_closed() {
        let verifier = NotificationVerifier::new(&config(true, None));
        assert!(!verifier.verify(Some("Bearer whatever")).await);
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let verifier = NotificationVerifier::new(&config(true, Some("https://example.com/push")));
        assert!(!verifier.verify(None).await);
    }

    #[tokio::test]
    async fn non_bearer_scheme_is_rejected() {
        let verifier = NotificationVerifier::new(&config(true, Some("https://example.com/push")));
        assert!(!verifier.verify(Some("Basic dXNlcjpwYXNz")).await);
    }

    #[tokio::test]
    async fn malformed_token_is_rejected() {
        let verifier = NotificationVerifier::new(&config(true, Some("https://example.com/push")));
        assert!(!verifier.verify(Some("Bearer not.a.jwt")).await);
    }
}
