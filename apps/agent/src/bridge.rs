//! Hands the short code to a supervising process through the filesystem.
//!
//! `verification-code.txt` holds the code of the current transaction. It
//! is removed when a transaction starts, replaced atomically once keys are
//! exchanged, and left in place afterwards. `verification.log` collects
//! one timestamped line per status change.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::SecondsFormat;
use mxagent_crypto::master_key::write_private_file;
use mxagent_crypto::sas::ShortCode;
use mxagent_shared::error::MxError;

use crate::credentials::StorePaths;
use crate::verification::{VerificationObserver, VerificationUpdate};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn io_error(path: &Path, e: std::io::Error) -> MxError {
    MxError::Storage(format!("{}: {e}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FileBridge {
    code_path: PathBuf,
    log_path: PathBuf,
}

impl FileBridge {
    pub fn new(code_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            code_path: code_path.into(),
            log_path: log_path.into(),
        }
    }

    pub fn for_store(paths: &StorePaths) -> Self {
        Self::new(paths.verification_code(), paths.verification_log())
    }

    pub fn code_path(&self) -> &Path {
        &self.code_path
    }

    pub fn clear_code(&self) -> Result<(), MxError> {
        match std::fs::remove_file(&self.code_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.code_path, e)),
        }
    }

    /// Replace the code file in one rename so readers never see a partial write.
    pub fn write_code(&self, transaction_id: &str, code: &ShortCode) -> Result<(), MxError> {
        let contents = format!(
            "transaction: {transaction_id}\nemoji: {}\ndecimal: {}\n",
            code.emoji_line(),
            code.decimal_line()
        );
        let mut tmp = self.code_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        write_private_file(&tmp, contents.as_bytes())?;
        std::fs::rename(&tmp, &self.code_path).map_err(|e| io_error(&self.code_path, e))
    }

    pub fn log(&self, line: &str) -> Result<(), MxError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| io_error(&self.log_path, e))?;
        let stamp = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        writeln!(file, "{stamp} {line}").map_err(|e| io_error(&self.log_path, e))
    }
}

impl VerificationObserver for FileBridge {
    fn report(&self, update: &VerificationUpdate<'_>) -> Result<(), MxError> {
        match update {
            VerificationUpdate::Requested { transaction_id, peer } => {
                self.clear_code()?;
                self.log(&format!("{transaction_id} requested {}", peer.label()))
            }
            VerificationUpdate::Code { transaction_id, code } => {
                self.write_code(transaction_id, code)?;
                self.log(&format!("{transaction_id} code {}", code.emoji_line()))
            }
            VerificationUpdate::Confirmed { transaction_id } => {
                self.log(&format!("{transaction_id} confirmed"))
            }
            VerificationUpdate::Cancelled {
                transaction_id,
                reason,
            } => self.log(&format!("{transaction_id} cancelled: {reason}")),
            VerificationUpdate::TimedOut { transaction_id } => {
                self.log(&format!("{transaction_id} timed_out"))
            }
        }
    }
}

/// A short code as read back from the code file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCode {
    pub transaction_id: String,
    pub emoji: String,
    pub decimal: String,
}

impl BridgeCode {
    fn parse(contents: &str) -> Option<Self> {
        let mut transaction_id = None;
        let mut emoji = None;
        let mut decimal = None;
        for line in contents.lines() {
            match line.split_once(": ") {
                Some(("transaction", v)) => transaction_id = Some(v.to_string()),
                Some(("emoji", v)) => emoji = Some(v.to_string()),
                Some(("decimal", v)) => decimal = Some(v.to_string()),
                _ => {}
            }
        }
        Some(Self {
            transaction_id: transaction_id?,
            emoji: emoji?,
            decimal: decimal?,
        })
    }
}

/// Reader side of [`FileBridge`], for a process supervising the agent.
#[derive(Debug, Clone)]
pub struct BridgeObserver {
    code_path: PathBuf,
}

impl BridgeObserver {
    pub fn new(code_path: impl Into<PathBuf>) -> Self {
        Self {
            code_path: code_path.into(),
        }
    }

    /// Current code, if one has been published.
    pub fn read(&self) -> Result<Option<BridgeCode>, MxError> {
        match std::fs::read_to_string(&self.code_path) {
            Ok(contents) => Ok(BridgeCode::parse(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&self.code_path, e)),
        }
    }

    /// Wait up to `timeout` for a code to appear.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<BridgeCode>, MxError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(code) = self.read()? {
                return Ok(Some(code));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
