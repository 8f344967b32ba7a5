//! Per-device trust and the policy deciding who receives room keys.

use rusqlite::Connection;

use crate::error::CryptoError;
use crate::storage::device_store::DeviceRecord;
use crate::storage::CryptoStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    Unverified,
    Verified,
    Blacklisted,
}

impl TrustState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustState::Unverified => "unverified",
            TrustState::Verified => "verified",
            TrustState::Blacklisted => "blacklisted",
        }
    }

    /// Unknown values read back as `Unverified`.
    pub fn parse(s: &str) -> Self {
        match s {
            "verified" => TrustState::Verified,
            "blacklisted" => TrustState::Blacklisted,
            _ => TrustState::Unverified,
        }
    }
}

impl std::fmt::Display for TrustState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How newly seen, unverified devices are treated when sharing room keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Share with every non-blacklisted device.
    #[default]
    TrustOnFirstUse,
    /// Share only with devices verified interactively.
    ExplicitOnly,
}

impl TrustPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tofu" | "trust_on_first_use" => Some(TrustPolicy::TrustOnFirstUse),
            "explicit" | "explicit_only" => Some(TrustPolicy::ExplicitOnly),
            _ => None,
        }
    }

    /// Whether `device` may receive room keys under this policy.
    pub fn allows(&self, device: &DeviceRecord) -> bool {
        if device.deleted {
            return false;
        }
        match (self, device.trust) {
            (_, TrustState::Blacklisted) => false,
            (_, TrustState::Verified) => true,
            (TrustPolicy::TrustOnFirstUse, TrustState::Unverified) => true,
            (TrustPolicy::ExplicitOnly, TrustState::Unverified) => false,
        }
    }
}

/// Mark a known device as verified. Overrides any policy decision.
pub fn verify_device(conn: &Connection, user_id: &str, device_id: &str) -> Result<(), CryptoError> {
    set_trust(conn, user_id, device_id, TrustState::Verified)
}

pub fn blacklist_device(conn: &Connection, user_id: &str, device_id: &str) -> Result<(), CryptoError> {
    set_trust(conn, user_id, device_id, TrustState::Blacklisted)
}

pub fn set_trust(
    conn: &Connection,
    user_id: &str,
    device_id: &str,
    trust: TrustState,
) -> Result<(), CryptoError> {
    let store = CryptoStore::new(conn);
    if !store.set_device_trust(user_id, device_id, trust)? {
        return Err(CryptoError::UnknownDevice {
            user_id: user_id.into(),
            device_id: device_id.into(),
        });
    }
    tracing::info!(user_id, device_id, trust = %trust, "device trust changed");
    Ok(())
}

/// Verified devices of `user_id`, excluding `except_device`.
pub fn verified_devices(
    conn: &Connection,
    user_id: &str,
    except_device: &str,
) -> Result<Vec<DeviceRecord>, CryptoError> {
    Ok(CryptoStore::new(conn)
        .devices_for_user(user_id)?
        .into_iter()
        .filter(|d| d.trust == TrustState::Verified && d.device_id != except_device)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_test_db;

    fn device(trust: TrustState) -> DeviceRecord {
        DeviceRecord {
            user_id: "@b:hs".into(),
            device_id: "D".into(),
            curve25519_key: "c".into(),
            ed25519_key: "e".into(),
            display_name: None,
            trust,
            first_seen_at: 0,
            last_seen_at: 0,
            verified_at: None,
            deleted: false,
        }
    }

    #[test]
    fn tofu_shares_with_unverified_but_not_blacklisted() {
        let policy = TrustPolicy::TrustOnFirstUse;
        assert!(policy.allows(&device(TrustState::Unverified)));
        assert!(policy.allows(&device(TrustState::Verified)));
        assert!(!policy.allows(&device(TrustState::Blacklisted)));
    }

    #[test]
    fn explicit_only_requires_verification() {
        let policy = TrustPolicy::ExplicitOnly;
        assert!(!policy.allows(&device(TrustState::Unverified)));
        assert!(policy.allows(&device(TrustState::Verified)));
        assert!(!policy.allows(&device(TrustState::Blacklisted)));
    }

    #[test]
    fn deleted_devices_never_receive_keys() {
        let mut d = device(TrustState::Verified);
        d.deleted = true;
        assert!(!TrustPolicy::TrustOnFirstUse.allows(&d));
    }

    #[test]
    fn policy_parse_accepts_config_names() {
        assert_eq!(TrustPolicy::parse("tofu"), Some(TrustPolicy::TrustOnFirstUse));
        assert_eq!(TrustPolicy::parse("Explicit"), Some(TrustPolicy::ExplicitOnly));
        assert_eq!(TrustPolicy::parse("whatever"), None);
        assert_eq!(TrustPolicy::default(), TrustPolicy::TrustOnFirstUse);
    }

    #[test]
    fn trust_state_round_trips_through_text() {
        for state in [TrustState::Unverified, TrustState::Verified, TrustState::Blacklisted] {
            assert_eq!(TrustState::parse(state.as_str()), state);
        }
        assert_eq!(TrustState::parse("garbage"), TrustState::Unverified);
    }

    #[test]
    fn verify_unknown_device_fails() {
        let conn = init_test_db();
        assert!(matches!(
            verify_device(&conn, "@b:hs", "D"),
            Err(CryptoError::UnknownDevice { .. })
        ));
    }

    #[test]
    fn verified_devices_excludes_self() {
        let conn = init_test_db();
        let store = CryptoStore::new(&conn);
        for id in ["ME", "OTHER", "UNTRUSTED"] {
            let mut d = device(TrustState::Unverified);
            d.user_id = "@me:hs".into();
            d.device_id = id.into();
            store.upsert_device(&d).unwrap();
        }
        verify_device(&conn, "@me:hs", "ME").unwrap();
        verify_device(&conn, "@me:hs", "OTHER").unwrap();

        let verified = verified_devices(&conn, "@me:hs", "ME").unwrap();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].device_id, "OTHER");
    }
}
