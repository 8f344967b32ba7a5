macro_rules! define_id {
    ($name:ident) => {
        /// Typed wrapper around an opaque Matrix identifier string.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(UserId);
define_id!(DeviceId);
define_id!(RoomId);
define_id!(EventId);
define_id!(TransactionId);

impl UserId {
    /// The localpart of `@localpart:server`, used for password login.
    pub fn localpart(&self) -> &str {
        let trimmed = self.0.strip_prefix('@').unwrap_or(&self.0);
        trimmed.split(':').next().unwrap_or(trimmed)
    }

    /// The server name after the first colon, if present.
    pub fn server_name(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, server)| server)
    }
}

#[allow(clippy::new_without_default)]
impl TransactionId {
    /// Generate a fresh random transaction id (32 hex chars).
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl RoomId {
    /// Room aliases (`#name:server`) need resolving before use as a room id.
    pub fn is_alias(&self) -> bool {
        self.0.starts_with('#')
    }
}
