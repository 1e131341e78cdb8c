//! Signed RTC tokens.

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use vigil_core::{RtcGrant, RtcTokenIssuer, StoreError, UnsignedTokenIssuer};

use crate::config::CallsConfig;

#[derive(Debug, Serialize)]
struct RtcClaims<'a> {
    sub: &'a str,
    app: &'a str,
    channel: &'a str,
    uid: u32,
    exp: u64,
}

/// Mints HS256 tokens that an RTC media gateway sharing the secret can
/// verify.
pub struct JwtRtcTokenIssuer {
    key: EncodingKey,
    ttl: Duration,
}

impl JwtRtcTokenIssuer {
    #[must_use]
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            ttl,
        }
    }
}

#[async_trait]
impl RtcTokenIssuer for JwtRtcTokenIssuer {
    async fn issue(&self, grant: RtcGrant<'_>) -> Result<String, StoreError> {
        let claims = RtcClaims {
            sub: grant.user_id,
            app: grant.app_id,
            channel: grant.channel_name,
            uid: grant.uid,
            exp: jsonwebtoken::get_current_timestamp() + self.ttl.as_secs(),
        };
        encode(&Header::default(), &claims, &self.key)
            .map_err(|e| StoreError::Unavailable(format!("RTC token signing failed: {e}")))
    }
}

/// Pick the issuer for the configured call settings.
pub fn issuer_for(config: &CallsConfig) -> Arc<dyn RtcTokenIssuer> {
    match &config.rtc_secret {
        Some(secret) => Arc::new(JwtRtcTokenIssuer::new(
            secret.as_bytes(),
            Duration::from_secs(config.token_ttl_secs),
        )),
        None => {
            tracing::warn!("calls.rtc_secret not set, RTC tokens are unsigned");
            Arc::new(UnsignedTokenIssuer)
        }
    }
}
