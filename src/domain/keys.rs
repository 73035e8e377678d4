//! Pseudonymous user keys and salt epochs.
//!
//! Raw identifiers never persist: every `user_id` is reduced to a 32-byte
//! HMAC-SHA256 digest keyed by the salt epoch covering the event's day.
//! Keys are stable for every day inside one epoch and unlinkable across
//! epochs. A separate root key, keyed by the process secret alone, indexes
//! erasure records across days without tying them to any epoch.
//!
//! # Security
//!
//! Secret material is decoded into `Zeroizing` buffers and the `Debug`
//! implementations never expose secrets or full digests.

use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use base64::Engine as _;

type HmacSha256 = Hmac<Sha256>;

/// Prefix marking a base64-encoded secret.
const B64_PREFIX: &str = "b64:";

/// 32-byte pseudonymous user key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserKey([u8; 32]);

impl UserKey {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Rebuild a key from a persisted blob.
    ///
    /// # Errors
    /// Returns an error when the blob is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, String> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("user key must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self(arr))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 64-bit uniform hash consumed by the sketches, taken from the first
    /// eight digest bytes.
    #[must_use]
    pub fn sketch_hash(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }
}

// Keys are pseudonymous but still act as stable identifiers; Debug shows
// only a short prefix so log output cannot be joined back to full keys.
impl std::fmt::Debug for UserKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UserKey({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// One span of salt stability.
///
/// Days on or after `effective_date` (and before the next epoch's) share
/// this epoch's secret, so a user hashes identically across the whole
/// span. Epoch spans must cover at least the MAU window.
#[derive(Clone)]
pub struct SaltEpoch {
    pub id: i64,
    pub secret: String,
    pub effective_date: NaiveDate,
    pub rotation_days: u32,
}

impl std::fmt::Debug for SaltEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaltEpoch")
            .field("id", &self.id)
            .field("secret", &"[redacted]")
            .field("effective_date", &self.effective_date)
            .field("rotation_days", &self.rotation_days)
            .finish()
    }
}

impl SaltEpoch {
    /// Derive the pseudonymous key for a user under this epoch.
    ///
    /// The message binds the epoch id but never the day, so the key stays
    /// stable for the epoch's entire span.
    ///
    /// # Errors
    /// Returns an error when the secret fails to decode.
    pub fn derive_key(&self, user_id: &str) -> Result<UserKey, String> {
        let secret = decode_secret(&self.secret)?;
        let mut mac =
            HmacSha256::new_from_slice(&secret).map_err(|e| format!("invalid HMAC key: {e}"))?;
        mac.update(self.id.to_string().as_bytes());
        mac.update(b"::");
        mac.update(user_id.as_bytes());
        let digest = mac.finalize().into_bytes();
        Ok(UserKey(digest.into()))
    }
}

/// Decode a secret that is either raw UTF-8 or `b64:`-prefixed base64.
///
/// # Errors
/// Returns an error for malformed base64 or an empty secret.
pub fn decode_secret(secret: &str) -> Result<Zeroizing<Vec<u8>>, String> {
    let bytes = if let Some(encoded) = secret.strip_prefix(B64_PREFIX) {
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| format!("invalid base64 secret: {e}"))?
    } else {
        secret.as_bytes().to_vec()
    };
    if bytes.is_empty() {
        return Err("secret must not be empty".to_string());
    }
    Ok(Zeroizing::new(bytes))
}

/// Derive the epoch-independent root key used to index erasures.
///
/// # Errors
/// Returns an error when the secret fails to decode.
pub fn derive_root_key(secret: &str, user_id: &str) -> Result<UserKey, String> {
    let secret = decode_secret(secret)?;
    let mut mac =
        HmacSha256::new_from_slice(&secret).map_err(|e| format!("invalid HMAC key: {e}"))?;
    mac.update(user_id.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(UserKey(digest.into()))
}

/// Mint a fresh `b64:` secret for local development and rotations.
#[must_use]
pub fn generate_random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!(
        "{B64_PREFIX}{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Ordered collection of salt epochs with day lookup.
#[derive(Debug, Clone, Default)]
pub struct SaltSchedule {
    /// Sorted by `effective_date` ascending
    epochs: Vec<SaltEpoch>,
}

impl SaltSchedule {
    #[must_use]
    pub fn new(mut epochs: Vec<SaltEpoch>) -> Self {
        epochs.sort_by_key(|e| (e.effective_date, e.id));
        Self { epochs }
    }

    pub fn push(&mut self, epoch: SaltEpoch) {
        self.epochs.push(epoch);
        self.epochs.sort_by_key(|e| (e.effective_date, e.id));
    }

    /// Epoch covering `day`: the latest epoch whose effective date is not
    /// after it.
    #[must_use]
    pub fn epoch_for(&self, day: NaiveDate) -> Option<&SaltEpoch> {
        self.epochs
            .iter()
            .rev()
            .find(|e| e.effective_date <= day)
    }

    #[must_use]
    pub fn latest(&self) -> Option<&SaltEpoch> {
        self.epochs.last()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}
