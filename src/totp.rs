//! Time-based one-time passwords (RFC 6238, HMAC-SHA1, 6 digits, 30 s step).
//!
//! The marketplace's second factor is a standard authenticator-app code.
//! Secrets are pasted by humans, so normalization is lenient: whitespace is
//! stripped, case is folded, characters outside the Base32 alphabet are
//! dropped and padding is restored before decoding.

use chrono::{DateTime, Utc};
use data_encoding::BASE32;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use sha1::Sha1;

use crate::types::LendError;

type HmacSha1 = Hmac<Sha1>;

/// Length of one code window in seconds.
pub const STEP_SECS: i64 = 30;

/// Number of digits in a generated code.
pub const DIGITS: u32 = 6;

/// Default number of adjacent windows accepted on either side when verifying.
pub const DEFAULT_SKEW_WINDOWS: u32 = 1;

/// Normalize a human-entered Base32 secret into canonical padded form.
pub fn normalize_secret(secret: &str) -> String {
    let mut normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| matches!(c, 'A'..='Z' | '2'..='7'))
        .collect();

    while normalized.len() % 8 != 0 {
        normalized.push('=');
    }
    normalized
}

/// Decode a secret into key bytes, rejecting anything that yields no key.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>, LendError> {
    let normalized = normalize_secret(secret);
    let key = BASE32
        .decode(normalized.as_bytes())
        .map_err(|e| LendError::Configuration(format!("TOTP secret is not valid Base32: {e}")))?;

    if key.is_empty() {
        return Err(LendError::Configuration(
            "TOTP secret decodes to zero bytes".into(),
        ));
    }
    Ok(key)
}

/// Generates and verifies codes for one shared secret.
pub struct TotpGenerator {
    key: Secret<Vec<u8>>,
    skew_windows: u32,
}

impl TotpGenerator {
    pub fn new(secret: &str) -> Result<Self, LendError> {
        Ok(Self {
            key: Secret::new(decode_secret(secret)?),
            skew_windows: DEFAULT_SKEW_WINDOWS,
        })
    }

    /// Accept `windows` adjacent windows on either side during verification.
    pub fn with_skew_windows(mut self, windows: u32) -> Self {
        self.skew_windows = windows;
        self
    }

    /// Code for the window containing `at`.
    pub fn generate_at(&self, at: DateTime<Utc>) -> Result<String, LendError> {
        self.code_for_counter(counter_at(at))
    }

    /// Code for the current window.
    pub fn generate(&self) -> Result<String, LendError> {
        self.generate_at(Utc::now())
    }

    /// Whether `code` matches the window at `at` or one of its skew neighbours.
    pub fn verify_at(&self, code: &str, at: DateTime<Utc>) -> bool {
        let code = code.trim();
        if code.len() != DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }

        let current = counter_at(at);
        let skew = i64::from(self.skew_windows);
        (-skew..=skew)
            .filter_map(|offset| current.checked_add_signed(offset))
            .filter_map(|counter| self.code_for_counter(counter).ok())
            .any(|candidate| candidate == code)
    }

    pub fn verify(&self, code: &str) -> bool {
        self.verify_at(code, Utc::now())
    }

    fn code_for_counter(&self, counter: u64) -> Result<String, LendError> {
        let mut mac = HmacSha1::new_from_slice(self.key.expose_secret())
            .map_err(|e| LendError::Configuration(format!("invalid TOTP key: {e}")))?;
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        // Dynamic truncation
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = (u32::from(digest[offset] & 0x7f) << 24)
            | (u32::from(digest[offset + 1]) << 16)
            | (u32::from(digest[offset + 2]) << 8)
            | u32::from(digest[offset + 3]);

        Ok(format!(
            "{:0width$}",
            binary % 10u32.pow(DIGITS),
            width = DIGITS as usize
        ))
    }
}

fn counter_at(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp().div_euclid(STEP_SECS)).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
