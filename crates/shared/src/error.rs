/// Error taxonomy shared by every agent operation.
///
/// Each variant carries a short operator-facing remediation hint via
/// [`MxError::remediation`].
#[derive(Debug, thiserror::Error)]
pub enum MxError {
    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("no olm session established with: {}", .missing.join(", "))]
    NoSessionEstablished { missing: Vec<String> },

    #[error("missing room key for session {session_id} in {room_id}")]
    DecryptionGap { room_id: String, session_id: String },

    #[error("verification codes did not match")]
    CodeMismatch,

    #[error("verification timed out")]
    TimedOut,

    #[error("verification cancelled: {0}")]
    VerificationCancelled(String),

    #[error("verification already in progress with {user_id} {device_id}")]
    TransactionInProgress { user_id: String, device_id: String },

    #[error("invalid recovery credential: {0}")]
    InvalidRecoveryCredential(String),

    #[error("no key backup configured")]
    NoBackupConfigured,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl MxError {
    /// Operator hint printed next to the error.
    pub fn remediation(&self) -> &'static str {
        match self {
            MxError::NetworkFailure(_) => "check connectivity to the homeserver and retry",
            MxError::AuthFailure(_) => "access token rejected; run `setup` again to log in",
            MxError::NoSessionEstablished { .. } => {
                "recipients have no one-time keys available; ask them to open their client"
            }
            MxError::DecryptionGap { .. } => {
                "run `fetch-keys` or `backup restore` to recover the missing room key"
            }
            MxError::CodeMismatch => "the emoji did not match; do not trust this device",
            MxError::TimedOut => "the other device did not respond; start verification again",
            MxError::VerificationCancelled(_) => "the other device cancelled; start verification again",
            MxError::TransactionInProgress { .. } => {
                "finish or cancel the running verification first"
            }
            MxError::InvalidRecoveryCredential(_) => "check the recovery key or passphrase",
            MxError::NoBackupConfigured => "enable key backup from another client first",
            MxError::Timeout(_) => "raise --timeout or check whether another process holds the store",
            MxError::NotConfigured(_) => "run `setup` to create a device for this agent",
            MxError::Config(_) => "fix the configuration file or environment variables",
            MxError::Storage(_) => "the local store may be corrupt; check permissions on the store directory",
            MxError::Crypto(_) => "inspect logs with MXAGENT_LOG_LEVEL=debug",
            MxError::Protocol(_) => "the homeserver returned an unexpected response",
        }
    }

    /// Transient failures the retry policy may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MxError::NetworkFailure(_) | MxError::Timeout(_))
    }

    /// Errors caused by missing or invalid local configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MxError::NotConfigured(_) | MxError::Config(_) | MxError::AuthFailure(_)
        )
    }

    /// Errors ending a verification attempt without trust change.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            MxError::CodeMismatch
                | MxError::TimedOut
                | MxError::VerificationCancelled(_)
                | MxError::TransactionInProgress { .. }
        )
    }
}

impl From<serde_json::Error> for MxError {
    fn from(e: serde_json::Error) -> Self {
        MxError::Protocol(e.to_string())
    }
}
