use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SignerError;
use crate::model::{Intent, SubscriptionId};

const EXPIRY_SECS: i64 = 86_400 * 7;

/// Issues and verifies signed RESUME/STOP tokens: forgery resistance,
/// intent-domain separation, and expiry enforcement via a plain HMAC over
/// an explicit payload with a 7-day validity window.
pub struct LinkSigner {
    secret: String,
}

impl LinkSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    fn salt(intent: Intent) -> &'static str {
        match intent {
            Intent::Resume => "continue-monitoring",
            Intent::Stop => "stop-monitoring",
        }
    }

    fn mac_for(&self, intent: Intent) -> Hmac<Sha256> {
        let key = format!("{}:{}", self.secret, Self::salt(intent));
        Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("HMAC accepts a key of any length")
    }

    pub fn issue(&self, sub_id: SubscriptionId, intent: Intent) -> String {
        let issued_at = Utc::now().timestamp();
        let expires_at = issued_at + EXPIRY_SECS;
        let payload = format!("{sub_id}:{intent}:{issued_at}:{expires_at}");

        let mut mac = self.mac_for(intent);
        mac.update(payload.as_bytes());
        let tag = mac.finalize().into_bytes();

        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(tag)
        )
    }

    pub fn verify(&self, token: &str, intent: Intent) -> Result<SubscriptionId, SignerError> {
        let (payload_b64, tag_b64) = token.split_once('.').ok_or(SignerError::Malformed)?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| SignerError::Malformed)?;
        let payload = String::from_utf8(payload_bytes).map_err(|_| SignerError::Malformed)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| SignerError::Malformed)?;

        let mut mac = self.mac_for(intent);
        mac.update(payload.as_bytes());
        mac.verify_slice(&tag).map_err(|_| SignerError::BadSignature)?;

        let mut parts = payload.split(':');
        let sub_id: SubscriptionId = parts
            .next()
            .ok_or(SignerError::Malformed)?
            .parse()
            .map_err(|_| SignerError::Malformed)?;
        let intent_str = parts.next().ok_or(SignerError::Malformed)?;
        let expires_at: i64 = parts
            .nth(1) // skip issued_at
            .ok_or(SignerError::Malformed)?
            .parse()
            .map_err(|_| SignerError::Malformed)?;

        if intent_str != intent.to_string() {
            return Err(SignerError::WrongIntent);
        }
        if Utc::now().timestamp() > expires_at {
            return Err(SignerError::Expired);
        }

        Ok(sub_id)
    }
}
