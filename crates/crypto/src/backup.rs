//! Server-side key backup: secret storage and backup entry decryption.
//!
//! The chain is recovery key (or passphrase) -> secret-storage key ->
//! `m.megolm_backup.v1` secret -> curve25519 backup private key -> one
//! decrypted room key per backup entry.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use mxagent_shared::api::room_keys::{
    AesHmacSha2Encrypted, BackedUpRoomKey, EncryptedSessionData, PassphraseInfo,
    SecretStorageKeyDescription,
};
use mxagent_shared::constants::{PBKDF2_ALGORITHM, SECRET_STORAGE_ALGORITHM};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::util::{decode_b64, encode_b64};

type HmacSha256 = Hmac<Sha256>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

const BASE58_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const RECOVERY_KEY_PREFIX: [u8; 2] = [0x8b, 0x01];
const RECOVERY_KEY_LEN: usize = 35;
const DEFAULT_PASSPHRASE_BITS: u32 = 256;

/// Key material a user supplies to unlock secret storage.
pub enum RecoveryCredential {
    RecoveryKey(Zeroizing<String>),
    Passphrase(Zeroizing<String>),
}

impl std::fmt::Debug for RecoveryCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryCredential::RecoveryKey(_) => f.write_str("RecoveryKey([REDACTED])"),
            RecoveryCredential::Passphrase(_) => f.write_str("Passphrase([REDACTED])"),
        }
    }
}

/// 32-byte secret-storage key.
pub struct SecretStorageKey(Zeroizing<[u8; 32]>);

impl SecretStorageKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

fn base58_decode(input: &str) -> Option<Vec<u8>> {
    let mut bytes: Vec<u8> = Vec::new();
    for c in input.bytes() {
        let mut carry = BASE58_ALPHABET.iter().position(|&a| a == c)? as u32;
        for b in bytes.iter_mut().rev() {
            carry += (*b as u32) * 58;
            *b = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.insert(0, (carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let leading = input.bytes().take_while(|&c| c == b'1').count();
    let mut out = vec![0u8; leading];
    out.extend(bytes);
    Some(out)
}

fn base58_encode(input: &[u8]) -> String {
    let mut digits: Vec<u8> = Vec::new();
    for &byte in input {
        let mut carry = byte as u32;
        for d in digits.iter_mut().rev() {
            carry += (*d as u32) << 8;
            *d = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.insert(0, (carry % 58) as u8);
            carry /= 58;
        }
    }
    let leading = input.iter().take_while(|&&b| b == 0).count();
    std::iter::repeat('1')
        .take(leading)
        .chain(digits.iter().map(|&d| BASE58_ALPHABET[d as usize] as char))
        .collect()
}

/// Parse a recovery key as shown to users (base58, spaces ignored).
pub fn decode_recovery_key(recovery_key: &str) -> Result<SecretStorageKey, CryptoError> {
    let compact: Zeroizing<String> =
        Zeroizing::new(recovery_key.chars().filter(|c| !c.is_whitespace()).collect());
    let decoded = Zeroizing::new(base58_decode(&compact).ok_or_else(|| {
        CryptoError::InvalidRecoveryCredential("recovery key is not valid base58".into())
    })?);

    if decoded.len() != RECOVERY_KEY_LEN || decoded[..2] != RECOVERY_KEY_PREFIX {
        return Err(CryptoError::InvalidRecoveryCredential(
            "recovery key has the wrong length or prefix".into(),
        ));
    }
    if decoded.iter().fold(0u8, |acc, b| acc ^ b) != 0 {
        return Err(CryptoError::InvalidRecoveryCredential(
            "recovery key parity check failed".into(),
        ));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&decoded[2..34]);
    Ok(SecretStorageKey::from_bytes(key))
}

/// Format a secret-storage key as a recovery key, in groups of four.
pub fn encode_recovery_key(key: &SecretStorageKey) -> String {
    let mut raw = Zeroizing::new(Vec::with_capacity(RECOVERY_KEY_LEN));
    raw.extend_from_slice(&RECOVERY_KEY_PREFIX);
    raw.extend_from_slice(key.as_bytes());
    let parity = raw.iter().fold(0u8, |acc, b| acc ^ b);
    raw.push(parity);

    let encoded = Zeroizing::new(base58_encode(&raw));
    encoded
        .as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// PBKDF2-HMAC-SHA512 over the passphrase with the stored salt.
pub fn derive_from_passphrase(
    passphrase: &str,
    info: &PassphraseInfo,
) -> Result<SecretStorageKey, CryptoError> {
    if info.algorithm != PBKDF2_ALGORITHM {
        return Err(CryptoError::BackupError(format!(
            "unsupported passphrase algorithm {}",
            info.algorithm
        )));
    }
    if info.bits.unwrap_or(DEFAULT_PASSPHRASE_BITS) != DEFAULT_PASSPHRASE_BITS {
        return Err(CryptoError::BackupError("only 256-bit passphrase keys are supported".into()));
    }
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), info.salt.as_bytes(), info.iterations, &mut key);
    Ok(SecretStorageKey::from_bytes(key))
}

/// Turn a credential into the secret-storage key described by `description`,
/// checking it against the description's MAC when one is present.
pub fn derive_secret_storage_key(
    credential: &RecoveryCredential,
    description: &SecretStorageKeyDescription,
) -> Result<SecretStorageKey, CryptoError> {
    if description.algorithm != SECRET_STORAGE_ALGORITHM {
        return Err(CryptoError::BackupError(format!(
            "unsupported secret storage algorithm {}",
            description.algorithm
        )));
    }
    let key = match credential {
        RecoveryCredential::RecoveryKey(k) => decode_recovery_key(k)?,
        RecoveryCredential::Passphrase(p) => {
            let info = description.passphrase.as_ref().ok_or_else(|| {
                CryptoError::InvalidRecoveryCredential(
                    "secret storage key has no passphrase; use the recovery key".into(),
                )
            })?;
            derive_from_passphrase(p, info)?
        }
    };
    check_key(&key, description)?;
    Ok(key)
}

/// Compare the key against the description's `iv`/`mac` pair. Descriptions
/// without one are accepted as-is.
pub fn check_key(
    key: &SecretStorageKey,
    description: &SecretStorageKeyDescription,
) -> Result<(), CryptoError> {
    let (Some(iv), Some(mac)) = (&description.iv, &description.mac) else {
        tracing::debug!("secret storage key has no check value");
        return Ok(());
    };
    let iv = decode_iv(iv)?;
    let expected = decode_b64(mac)?;
    let check = encrypt_secret(key, "", &[0u8; 32], iv)?;
    let actual = decode_b64(&check.mac)?;
    if actual.ct_eq(&expected).into() {
        Ok(())
    } else {
        Err(CryptoError::InvalidRecoveryCredential(
            "recovery key or passphrase does not match".into(),
        ))
    }
}

fn decode_iv(iv: &str) -> Result<[u8; 16], CryptoError> {
    decode_b64(iv)?
        .try_into()
        .map_err(|_| CryptoError::BackupError("iv must be 16 bytes".into()))
}

struct SecretKeys {
    aes: Zeroizing<[u8; 32]>,
    mac: Zeroizing<[u8; 32]>,
}

fn secret_keys(key: &SecretStorageKey, name: &str) -> Result<SecretKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), key.as_bytes());
    let mut okm = Zeroizing::new([0u8; 64]);
    hk.expand(name.as_bytes(), &mut okm[..])
        .map_err(|e| CryptoError::BackupError(format!("hkdf: {e}")))?;
    let mut aes = Zeroizing::new([0u8; 32]);
    let mut mac = Zeroizing::new([0u8; 32]);
    aes.copy_from_slice(&okm[..32]);
    mac.copy_from_slice(&okm[32..]);
    Ok(SecretKeys { aes, mac })
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<HmacSha256, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::BackupError(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac)
}

/// Encrypt a secret for account data under `name`.
pub fn encrypt_secret(
    key: &SecretStorageKey,
    name: &str,
    plaintext: &[u8],
    iv: [u8; 16],
) -> Result<AesHmacSha2Encrypted, CryptoError> {
    let keys = secret_keys(key, name)?;
    let mut buf = plaintext.to_vec();
    Aes256Ctr::new((&*keys.aes).into(), &iv.into()).apply_keystream(&mut buf);
    let tag = hmac_sha256(&keys.mac[..], &buf)?.finalize().into_bytes();
    Ok(AesHmacSha2Encrypted {
        iv: encode_b64(&iv),
        ciphertext: encode_b64(&buf),
        mac: encode_b64(&tag),
    })
}

/// Decrypt an account-data secret stored under `name`.
pub fn decrypt_secret(
    key: &SecretStorageKey,
    name: &str,
    encrypted: &AesHmacSha2Encrypted,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let keys = secret_keys(key, name)?;
    let iv = decode_iv(&encrypted.iv)?;
    let ciphertext = decode_b64(&encrypted.ciphertext)?;
    let tag = decode_b64(&encrypted.mac)?;
    hmac_sha256(&keys.mac[..], &ciphertext)?
        .verify_slice(&tag)
        .map_err(|_| CryptoError::InvalidRecoveryCredential(format!("MAC mismatch on secret {name}")))?;

    let mut plaintext = Zeroizing::new(ciphertext);
    Aes256Ctr::new((&*keys.aes).into(), &iv.into()).apply_keystream(&mut plaintext);
    Ok(plaintext)
}

/// The curve25519 private key that decrypts backup entries.
pub struct BackupDecryptionKey {
    secret: StaticSecret,
}

impl BackupDecryptionKey {
    /// Parse the decrypted `m.megolm_backup.v1` secret (base64 of 32 bytes).
    pub fn from_secret(secret: &[u8]) -> Result<Self, CryptoError> {
        let text = std::str::from_utf8(secret)
            .map_err(|_| CryptoError::BackupError("backup secret is not text".into()))?;
        let raw = Zeroizing::new(decode_b64(text.trim())?);
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::BackupError("backup key must be 32 bytes".into()))?;
        Ok(Self {
            secret: StaticSecret::from(bytes),
        })
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    pub fn public_key(&self) -> String {
        encode_b64(PublicKey::from(&self.secret).as_bytes())
    }

    /// The backup descriptor's public key must match ours.
    pub fn check_public_key(&self, expected: &str) -> Result<(), CryptoError> {
        let expected = decode_b64(expected)?;
        let ours = PublicKey::from(&self.secret);
        if ours.as_bytes().as_slice().ct_eq(&expected).into() {
            Ok(())
        } else {
            Err(CryptoError::InvalidRecoveryCredential(
                "backup key does not match the server backup".into(),
            ))
        }
    }

    pub fn decrypt_entry(&self, data: &EncryptedSessionData) -> Result<BackedUpRoomKey, CryptoError> {
        let ephemeral = public_key_from_b64(&data.ephemeral)?;
        let shared = self.secret.diffie_hellman(&ephemeral);
        let keys = entry_keys(shared.as_bytes())?;

        let ciphertext = decode_b64(&data.ciphertext)?;
        let tag = decode_b64(&data.mac)?;
        // Existing backups MAC an empty string; accept a MAC over the ciphertext too.
        let empty_ok = hmac_sha256(&keys.mac[..], b"")?.verify_truncated_left(&tag).is_ok();
        if !empty_ok {
            hmac_sha256(&keys.mac[..], &ciphertext)?
                .verify_truncated_left(&tag)
                .map_err(|_| CryptoError::InvalidRecoveryCredential("backup entry MAC mismatch".into()))?;
        }

        let plaintext = Zeroizing::new(
            Aes256CbcDec::new((&*keys.aes).into(), &keys.iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
                .map_err(|_| CryptoError::DecryptionFailed("backup entry padding is invalid".into()))?,
        );
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

struct EntryKeys {
    aes: Zeroizing<[u8; 32]>,
    mac: Zeroizing<[u8; 32]>,
    iv: [u8; 16],
}

fn entry_keys(shared_secret: &[u8]) -> Result<EntryKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = Zeroizing::new([0u8; 80]);
    hk.expand(b"", &mut okm[..])
        .map_err(|e| CryptoError::BackupError(format!("hkdf: {e}")))?;
    let mut aes = Zeroizing::new([0u8; 32]);
    let mut mac = Zeroizing::new([0u8; 32]);
    let mut iv = [0u8; 16];
    aes.copy_from_slice(&okm[..32]);
    mac.copy_from_slice(&okm[32..64]);
    iv.copy_from_slice(&okm[64..]);
    Ok(EntryKeys { aes, mac, iv })
}

fn public_key_from_b64(key: &str) -> Result<PublicKey, CryptoError> {
    let bytes: [u8; 32] = decode_b64(key)?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("curve25519 key must be 32 bytes".into()))?;
    Ok(PublicKey::from(bytes))
}

/// Encrypt a room key for the backup identified by `public_key`.
pub fn encrypt_backup_entry(
    public_key: &str,
    room_key: &BackedUpRoomKey,
) -> Result<EncryptedSessionData, CryptoError> {
    let recipient = public_key_from_b64(public_key)?;
    let ephemeral = StaticSecret::from(rand::random::<[u8; 32]>());
    let shared = ephemeral.diffie_hellman(&recipient);
    let keys = entry_keys(shared.as_bytes())?;

    let plaintext = Zeroizing::new(serde_json::to_vec(room_key)?);
    let ciphertext = Aes256CbcEnc::new((&*keys.aes).into(), &keys.iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);
    let tag = hmac_sha256(&keys.mac[..], b"")?.finalize().into_bytes();

    Ok(EncryptedSessionData {
        ephemeral: encode_b64(PublicKey::from(&ephemeral).as_bytes()),
        ciphertext: encode_b64(&ciphertext),
        mac: encode_b64(&tag[..8]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn description_for(key: &SecretStorageKey, passphrase: Option<PassphraseInfo>) -> SecretStorageKeyDescription {
        let iv = [7u8; 16];
        let check = encrypt_secret(key, "", &[0u8; 32], iv).unwrap();
        SecretStorageKeyDescription {
            algorithm: SECRET_STORAGE_ALGORITHM.into(),
            name: None,
            passphrase,
            iv: Some(check.iv),
            mac: Some(check.mac),
        }
    }

    fn room_key() -> BackedUpRoomKey {
        BackedUpRoomKey {
            algorithm: "m.megolm.v1.aes-sha2".into(),
            sender_key: "sender".into(),
            session_key: "exported-session".into(),
            sender_claimed_keys: BTreeMap::new(),
            forwarding_curve25519_key_chain: vec![],
        }
    }

    #[test]
    fn recovery_key_survives_formatting() {
        let key = SecretStorageKey::from_bytes([42u8; 32]);
        let formatted = encode_recovery_key(&key);
        assert!(formatted.starts_with("Es"));
        assert!(formatted.split(' ').all(|g| g.len() <= 4));

        let decoded = decode_recovery_key(&formatted).unwrap();
        assert_eq!(decoded.as_bytes(), key.as_bytes());
    }

    #[test]
    fn recovery_key_with_bad_parity_is_rejected() {
        let key = SecretStorageKey::from_bytes([1u8; 32]);
        let mut formatted: Vec<char> = encode_recovery_key(&key).chars().collect();
        let last = formatted.len() - 1;
        formatted[last] = if formatted[last] == '2' { '3' } else { '2' };
        let broken: String = formatted.into_iter().collect();
        assert!(matches!(
            decode_recovery_key(&broken),
            Err(CryptoError::InvalidRecoveryCredential(_))
        ));
        assert!(decode_recovery_key("0OIl").is_err());
    }

    #[test]
    fn wrong_recovery_key_fails_key_check() {
        let right = SecretStorageKey::from_bytes([3u8; 32]);
        let wrong = SecretStorageKey::from_bytes([4u8; 32]);
        let description = description_for(&right, None);

        let credential = RecoveryCredential::RecoveryKey(Zeroizing::new(encode_recovery_key(&wrong)));
        assert!(matches!(
            derive_secret_storage_key(&credential, &description),
            Err(CryptoError::InvalidRecoveryCredential(_))
        ));
        let credential = RecoveryCredential::RecoveryKey(Zeroizing::new(encode_recovery_key(&right)));
        assert!(derive_secret_storage_key(&credential, &description).is_ok());
    }

    #[test]
    fn passphrase_derives_matching_key() {
        let info = PassphraseInfo {
            algorithm: PBKDF2_ALGORITHM.into(),
            salt: "salty".into(),
            iterations: 10,
            bits: None,
        };
        let key = derive_from_passphrase("correct horse", &info).unwrap();
        let description = description_for(&key, Some(info));

        let ok = RecoveryCredential::Passphrase(Zeroizing::new("correct horse".into()));
        assert!(derive_secret_storage_key(&ok, &description).is_ok());
        let bad = RecoveryCredential::Passphrase(Zeroizing::new("battery staple".into()));
        assert!(derive_secret_storage_key(&bad, &description).is_err());
    }

    #[test]
    fn passphrase_needs_passphrase_info() {
        let key = SecretStorageKey::from_bytes([5u8; 32]);
        let description = description_for(&key, None);
        let credential = RecoveryCredential::Passphrase(Zeroizing::new("anything".into()));
        assert!(matches!(
            derive_secret_storage_key(&credential, &description),
            Err(CryptoError::InvalidRecoveryCredential(_))
        ));
    }

    #[test]
    fn secret_decrypts_under_its_name_only() {
        let key = SecretStorageKey::from_bytes([9u8; 32]);
        let encrypted = encrypt_secret(&key, "m.megolm_backup.v1", b"payload", [1u8; 16]).unwrap();
        let plain = decrypt_secret(&key, "m.megolm_backup.v1", &encrypted).unwrap();
        assert_eq!(plain.as_slice(), b"payload");
        assert!(decrypt_secret(&key, "m.cross_signing.master", &encrypted).is_err());
    }

    #[test]
    fn backup_entry_decrypts_with_matching_key() {
        let backup_key = BackupDecryptionKey::from_bytes([11u8; 32]);
        let public = backup_key.public_key();
        backup_key.check_public_key(&public).unwrap();

        let entry = encrypt_backup_entry(&public, &room_key()).unwrap();
        let decrypted = backup_key.decrypt_entry(&entry).unwrap();
        assert_eq!(decrypted.session_key, "exported-session");
        assert_eq!(decrypted.sender_key, "sender");

        let other = BackupDecryptionKey::from_bytes([12u8; 32]);
        assert!(other.check_public_key(&public).is_err());
        assert!(other.decrypt_entry(&entry).is_err());
    }

    #[test]
    fn backup_secret_parses_from_base64() {
        let secret = encode_b64(&[11u8; 32]);
        let key = BackupDecryptionKey::from_secret(secret.as_bytes()).unwrap();
        assert_eq!(key.public_key(), BackupDecryptionKey::from_bytes([11u8; 32]).public_key());
        assert!(BackupDecryptionKey::from_secret(b"c2hvcnQ").is_err());
    }
}
