//! Human-comparable device key fingerprints.
//!
//! Matrix clients show a device's ed25519 key as unpadded base64 split into
//! groups of four characters. Operators compare these by eye when deciding
//! whether a device is the one they expect.

use crate::error::CryptoError;
use crate::util::{decode_b64, encode_b64};

const GROUP_LEN: usize = 4;

/// Format an ed25519 key (base64, padded or not) as `abcd efgh ...`.
pub fn format_fingerprint(ed25519_key: &str) -> Result<String, CryptoError> {
    let raw = decode_b64(ed25519_key)?;
    if raw.len() != 32 {
        return Err(CryptoError::InvalidKey(format!(
            "ed25519 key must be 32 bytes, got {}",
            raw.len()
        )));
    }
    let normalized = encode_b64(&raw);
    Ok(normalized
        .as_bytes()
        .chunks(GROUP_LEN)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(" "))
}

/// Compare a key against a fingerprint typed or pasted by an operator.
/// Whitespace is ignored; case is not.
pub fn fingerprint_matches(ed25519_key: &str, fingerprint: &str) -> bool {
    let compact: String = fingerprint.chars().filter(|c| !c.is_whitespace()).collect();
    match decode_b64(ed25519_key) {
        Ok(raw) => encode_b64(&raw) == compact.trim_end_matches('='),
        Err(_) => false,
    }
}
