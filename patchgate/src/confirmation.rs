//! Confirmation tokens for risky patches.
//!
//! A patch that deletes files or touches sensitive paths is only applied when
//! the caller presents a token minted for that exact `(task_id, diff_name)`
//! pair. Tokens are HMAC-SHA256 signed, expire after [`TOKEN_TTL_MS`], and are
//! accepted at most once.
//!
//! Wire format: `base64("{task_id}:{diff_name}:{expires_at_ms}:{nonce_hex}:{signature_hex}")`
//!
//! Tokens are not persisted. Restarting the process (which generates a new
//! random secret by default) invalidates every outstanding token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Token lifetime: ten minutes.
pub const TOKEN_TTL_MS: i64 = 10 * 60 * 1000;

/// Length of the signature prefix used in the single-use registry key.
const SIGNATURE_PREFIX_LEN: usize = 16;

/// Source of wall-clock time, injectable for tests.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Token generation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token field '{field}' must be non-empty and must not contain ':'")]
    InvalidField { field: &'static str },
}

/// Why a presented token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    /// Not base64, not UTF-8, or not exactly five fields.
    Malformed,
    /// Bound to a different task or diff.
    BindingMismatch,
    Expired,
    BadSignature,
    AlreadyUsed,
}

impl std::fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed"),
            Self::BindingMismatch => write!(f, "binding_mismatch"),
            Self::Expired => write!(f, "expired"),
            Self::BadSignature => write!(f, "bad_signature"),
            Self::AlreadyUsed => write!(f, "already_used"),
        }
    }
}

/// Issues and verifies single-use confirmation tokens.
pub struct ConfirmationTokens {
    secret: Vec<u8>,
    clock: Arc<dyn Clock>,
    /// `nonce:signature-prefix` → expiry of the consumed token.
    used: Mutex<HashMap<String, i64>>,
}

impl ConfirmationTokens {
    /// Create a token service with an explicit signing secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            clock: Arc::new(SystemClock),
            used: Mutex::new(HashMap::new()),
        }
    }

    /// Create a token service with a fresh random 256-bit secret.
    pub fn with_random_secret() -> Self {
        Self::new(rand::random::<[u8; 32]>().to_vec())
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mint a token bound to `(task_id, diff_name)`.
    pub fn generate(&self, task_id: &str, diff_name: &str) -> Result<String, TokenError> {
        check_field("task_id", task_id)?;
        check_field("diff_name", diff_name)?;

        let expires_at = self.clock.now_ms() + TOKEN_TTL_MS;
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let payload = format!("{task_id}:{diff_name}:{expires_at}:{nonce}");
        let signature = hex::encode(self.sign(&payload).finalize().into_bytes());

        debug!(task_id, diff_name, expires_at, "Confirmation token issued");
        Ok(base64::engine::general_purpose::STANDARD.encode(format!("{payload}:{signature}")))
    }

    /// Accept the token once if it is well formed, bound to these values,
    /// unexpired and correctly signed.
    pub fn validate(&self, token: &str, task_id: &str, diff_name: &str) -> bool {
        match self.verify(token, task_id, diff_name) {
            Ok(()) => true,
            Err(reason) => {
                warn!(task_id, diff_name, %reason, "Confirmation token rejected");
                false
            }
        }
    }

    /// Like [`validate`](Self::validate) but reports the rejection reason.
    pub fn verify(&self, token: &str, task_id: &str, diff_name: &str) -> Result<(), TokenRejection> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token.trim())
            .map_err(|_| TokenRejection::Malformed)?;
        let decoded = String::from_utf8(decoded).map_err(|_| TokenRejection::Malformed)?;

        let fields: Vec<&str> = decoded.split(':').collect();
        let [bound_task, bound_diff, expires_at, nonce, signature] = fields.as_slice() else {
            return Err(TokenRejection::Malformed);
        };

        if *bound_task != task_id || *bound_diff != diff_name {
            return Err(TokenRejection::BindingMismatch);
        }

        let expires_at: i64 = expires_at.parse().map_err(|_| TokenRejection::Malformed)?;
        let now = self.clock.now_ms();
        if now > expires_at {
            return Err(TokenRejection::Expired);
        }

        let signature_bytes = hex::decode(signature).map_err(|_| TokenRejection::BadSignature)?;
        let payload = format!("{bound_task}:{bound_diff}:{expires_at}:{nonce}");
        self.sign(&payload)
            .verify_slice(&signature_bytes)
            .map_err(|_| TokenRejection::BadSignature)?;

        let prefix_len = SIGNATURE_PREFIX_LEN.min(signature.len());
        let key = format!("{nonce}:{}", &signature[..prefix_len]);

        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.retain(|_, expiry| *expiry >= now);
        if used.contains_key(&key) {
            return Err(TokenRejection::AlreadyUsed);
        }
        used.insert(key, expires_at);
        Ok(())
    }

    /// Number of consumed tokens still tracked (expired entries are evicted
    /// lazily on the next verification).
    pub fn tracked_count(&self) -> usize {
        self.used.lock().map(|u| u.len()).unwrap_or(0)
    }

    fn sign(&self, payload: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        mac
    }
}

impl std::fmt::Debug for ConfirmationTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationTokens")
            .field("tracked", &self.tracked_count())
            .finish_non_exhaustive()
    }
}

fn check_field(field: &'static str, value: &str) -> Result<(), TokenError> {
    if value.is_empty() || value.contains(':') {
        return Err(TokenError::InvalidField { field });
    }
    Ok(())
}
