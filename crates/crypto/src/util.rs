use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;

use crate::error::CryptoError;

/// Seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Matrix encodes binary values as unpadded standard base64.
pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

/// Accepts both padded and unpadded input.
pub fn decode_b64(s: &str) -> Result<Vec<u8>, CryptoError> {
    let trimmed = s.trim_end_matches('=');
    STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(s))
        .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_accepts_padded_and_unpadded() {
        assert_eq!(decode_b64("aGk").unwrap(), b"hi");
        assert_eq!(decode_b64("aGk=").unwrap(), b"hi");
        assert!(decode_b64("***").is_err());
    }

    #[test]
    fn encode_omits_padding() {
        assert_eq!(encode_b64(b"hi"), "aGk");
    }
}
