//! HMAC signature verification for HTTP requests and channel messages

use super::canonical::canonical_path;
use super::nonce::NonceLedger;
use fleet_shared::{auth, now_secs, signing, Message};
use std::sync::Arc;
use tracing::debug;

/// Verifies signed requests and messages, then consumes their nonce
pub struct SignatureAuthenticator {
    secret: Vec<u8>,
    nonces: Arc<NonceLedger>,
    skew_secs: i64,
    debug: bool,
}

impl SignatureAuthenticator {
    /// Create an authenticator sharing `nonces` with other verifiers
    pub fn new(secret: impl Into<Vec<u8>>, nonces: Arc<NonceLedger>) -> Self {
        Self {
            secret: secret.into(),
            nonces,
            skew_secs: auth::SKEW_SECS,
            debug: false,
        }
    }

    /// Log mismatch details (expected signature, body hash)
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Check `ts` lies within the accepted skew of `now`
    pub fn is_timestamp_valid(&self, ts: i64, now: i64) -> bool {
        ts != 0 && ts >= now - self.skew_secs && ts <= now + self.skew_secs
    }

    /// Verify an HTTP request; `target` is the raw request path and query
    pub async fn verify_http_request(
        &self,
        ts: i64,
        nonce: &str,
        signature: &str,
        method: &str,
        target: &str,
        body: &[u8],
    ) -> bool {
        self.verify_http_request_at(ts, nonce, signature, method, target, body, now_secs())
            .await
    }

    /// Same as [`verify_http_request`](Self::verify_http_request) against an explicit clock
    #[allow(clippy::too_many_arguments)]
    pub async fn verify_http_request_at(
        &self,
        ts: i64,
        nonce: &str,
        signature: &str,
        method: &str,
        target: &str,
        body: &[u8],
        now: i64,
    ) -> bool {
        let path = canonical_path(target);
        if !self.is_timestamp_valid(ts, now) {
            if self.debug {
                debug!("[auth] http invalid timestamp: ts={} method={} path={}", ts, method, path);
            }
            return false;
        }

        let body_hash = signing::sha256_hex(body);
        let base = signing::http_signature_base(ts, nonce, method, &path, &body_hash);
        if !self.signature_matches(&base, signature) {
            if self.debug {
                debug!(
                    "[auth] http signature mismatch: method={} path={} ts={} nonce={} expected={} got={} bodyHash={}",
                    method,
                    path,
                    ts,
                    nonce,
                    signing::sign_hex(&self.secret, &base).unwrap_or_default(),
                    signature,
                    body_hash
                );
            }
            return false;
        }

        self.accept_nonce(auth::HTTP_NAMESPACE, nonce).await
    }

    /// Verify a channel message
    pub async fn verify_message(&self, message: &Message) -> bool {
        self.verify_message_at(message, now_secs()).await
    }

    /// Same as [`verify_message`](Self::verify_message) against an explicit clock
    pub async fn verify_message_at(&self, message: &Message, now: i64) -> bool {
        if !self.is_timestamp_valid(message.ts, now) {
            if self.debug {
                debug!("[auth] ws invalid timestamp: ts={} type={}", message.ts, message.msg_type);
            }
            return false;
        }

        let body_hash = signing::json_body_hash(message.body.as_ref());
        let base =
            signing::message_signature_base(message.ts, &message.nonce, &message.msg_type, &body_hash);
        if !self.signature_matches(&base, &message.sign) {
            if self.debug {
                debug!(
                    "[auth] ws signature mismatch: type={} ts={} nonce={} expected={} got={} bodyHash={}",
                    message.msg_type,
                    message.ts,
                    message.nonce,
                    signing::sign_hex(&self.secret, &base).unwrap_or_default(),
                    message.sign,
                    body_hash
                );
            }
            return false;
        }

        self.accept_nonce(auth::CHANNEL_NAMESPACE, &message.nonce).await
    }

    fn signature_matches(&self, base: &str, actual: &str) -> bool {
        match signing::sign_hex(&self.secret, base) {
            Some(expected) => signing::timing_safe_eq(&expected, actual),
            None => false,
        }
    }

    async fn accept_nonce(&self, namespace: &str, nonce: &str) -> bool {
        let accepted = self.nonces.check_and_store(namespace, nonce).await;
        if !accepted && self.debug {
            debug!("[auth] nonce replay rejected: ns={} nonce={}", namespace, nonce);
        }
        accepted
    }
}
