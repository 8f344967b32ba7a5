//! Interactive SAS device verification (`m.sas.v1`).
//!
//! [`VerificationEngine`] is a pure state machine: it consumes incoming
//! `m.key.verification.*` contents and returns the events to send, without
//! touching the network or the store. The caller delivers the events and
//! records trust once a transaction reaches [`VerificationState::Confirmed`].
//!
//! At most one live transaction exists per peer device. Finished ones stay
//! readable until [`VerificationEngine::forget`] removes them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use mxagent_shared::api::verification::{
    AcceptContent, CancelContent, DoneContent, KeyContent, MacContent, ReadyContent,
    RequestContent, StartContent, VerificationEvent,
};
use mxagent_shared::constants::{SAS_HASH, SAS_KEY_AGREEMENT, SAS_MAC_METHOD, SAS_METHOD};
use serde_json::Value;
use sha2::{Digest, Sha256};
use vodozemac::sas::{EstablishedSas, Mac, Sas};
use vodozemac::Curve25519PublicKey;

use crate::error::CryptoError;
use crate::identity::canonical_json;
use crate::storage::device_store::DeviceRecord;
use crate::util::encode_b64;

/// The 64-entry emoji table shared by every Matrix client.
pub const EMOJI_TABLE: [(&str, &str); 64] = [
    ("🐶", "Dog"),
    ("🐱", "Cat"),
    ("🦁", "Lion"),
    ("🐎", "Horse"),
    ("🦄", "Unicorn"),
    ("🐷", "Pig"),
    ("🐘", "Elephant"),
    ("🐰", "Rabbit"),
    ("🐼", "Panda"),
    ("🐓", "Rooster"),
    ("🐧", "Penguin"),
    ("🐢", "Turtle"),
    ("🐟", "Fish"),
    ("🐙", "Octopus"),
    ("🦋", "Butterfly"),
    ("🌷", "Flower"),
    ("🌳", "Tree"),
    ("🌵", "Cactus"),
    ("🍄", "Mushroom"),
    ("🌏", "Globe"),
    ("🌙", "Moon"),
    ("☁️", "Cloud"),
    ("🔥", "Fire"),
    ("🍌", "Banana"),
    ("🍎", "Apple"),
    ("🍓", "Strawberry"),
    ("🌽", "Corn"),
    ("🍕", "Pizza"),
    ("🎂", "Cake"),
    ("❤️", "Heart"),
    ("😀", "Smiley"),
    ("🤖", "Robot"),
    ("🎩", "Hat"),
    ("👓", "Glasses"),
    ("🔧", "Spanner"),
    ("🎅", "Santa"),
    ("👍", "Thumbs Up"),
    ("☂️", "Umbrella"),
    ("⌛", "Hourglass"),
    ("⏰", "Clock"),
    ("🎁", "Gift"),
    ("💡", "Light Bulb"),
    ("📕", "Book"),
    ("✏️", "Pencil"),
    ("📎", "Paperclip"),
    ("✂️", "Scissors"),
    ("🔒", "Lock"),
    ("🔑", "Key"),
    ("🔨", "Hammer"),
    ("☎️", "Telephone"),
    ("🏁", "Flag"),
    ("🚂", "Train"),
    ("🚲", "Bicycle"),
    ("✈️", "Aeroplane"),
    ("🚀", "Rocket"),
    ("🏆", "Trophy"),
    ("⚽", "Ball"),
    ("🎸", "Guitar"),
    ("🎺", "Trumpet"),
    ("🔔", "Bell"),
    ("⚓", "Anchor"),
    ("🎧", "Headphones"),
    ("📁", "Folder"),
    ("📌", "Pin"),
];

const SAS_INFO_PREFIX: &str = "MATRIX_KEY_VERIFICATION_SAS";
const MAC_INFO_PREFIX: &str = "MATRIX_KEY_VERIFICATION_MAC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emoji {
    pub symbol: &'static str,
    pub description: &'static str,
}

/// The short authentication string both sides compare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortCode {
    pub emoji: Vec<Emoji>,
    pub decimals: [u16; 3],
}

impl ShortCode {
    fn from_indices(indices: [u8; 7], decimals: (u16, u16, u16)) -> Self {
        let emoji = indices
            .iter()
            .map(|&i| {
                let (symbol, description) = EMOJI_TABLE[(i & 0x3f) as usize];
                Emoji { symbol, description }
            })
            .collect();
        Self {
            emoji,
            decimals: [decimals.0, decimals.1, decimals.2],
        }
    }

    /// `🐶 Dog | 🔑 Key | ...`
    pub fn emoji_line(&self) -> String {
        self.emoji
            .iter()
            .map(|e| format!("{} {}", e.symbol, e.description))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    pub fn decimal_line(&self) -> String {
        let [a, b, c] = self.decimals;
        format!("{a} {b} {c}")
    }
}

impl fmt::Display for ShortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.emoji_line())
    }
}

/// Which side sent `m.key.verification.request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    User,
    TimedOut,
    /// The peer's MAC did not match the keys we hold for it.
    CodeMismatch,
    MismatchedCommitment,
    /// The operator reported that the short codes differ.
    MismatchedSas,
    UnexpectedMessage,
    UnknownMethod,
    /// Another device of ours answered the request.
    Accepted,
    Other(String),
}

impl CancelReason {
    pub fn code(&self) -> &str {
        match self {
            CancelReason::User => "m.user",
            CancelReason::TimedOut => "m.timeout",
            CancelReason::CodeMismatch => "m.key_mismatch",
            CancelReason::MismatchedCommitment => "m.mismatched_commitment",
            CancelReason::MismatchedSas => "m.mismatched_sas",
            CancelReason::UnexpectedMessage => "m.unexpected_message",
            CancelReason::UnknownMethod => "m.unknown_method",
            CancelReason::Accepted => "m.accepted",
            CancelReason::Other(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "m.user" => CancelReason::User,
            "m.timeout" => CancelReason::TimedOut,
            "m.key_mismatch" => CancelReason::CodeMismatch,
            "m.mismatched_commitment" => CancelReason::MismatchedCommitment,
            "m.mismatched_sas" => CancelReason::MismatchedSas,
            "m.unexpected_message" => CancelReason::UnexpectedMessage,
            "m.unknown_method" => CancelReason::UnknownMethod,
            "m.accepted" => CancelReason::Accepted,
            other => CancelReason::Other(other.to_string()),
        }
    }

    fn description(&self) -> &'static str {
        match self {
            CancelReason::User => "cancelled by user",
            CancelReason::TimedOut => "verification timed out",
            CancelReason::CodeMismatch => "MAC did not match the device keys",
            CancelReason::MismatchedCommitment => "key commitment mismatch",
            CancelReason::MismatchedSas => "short codes did not match",
            CancelReason::UnexpectedMessage => "unexpected verification message",
            CancelReason::UnknownMethod => "unsupported verification method",
            CancelReason::Accepted => "handled by another device",
            CancelReason::Other(_) => "cancelled",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationState {
    Requested,
    Ready,
    Started,
    KeyExchanged,
    /// Our MAC is sent; waiting for the peer's.
    MacExchanged,
    Confirmed,
    Cancelled(CancelReason),
    TimedOut,
}

impl VerificationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationState::Confirmed | VerificationState::Cancelled(_) | VerificationState::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Requested => "requested",
            VerificationState::Ready => "ready",
            VerificationState::Started => "started",
            VerificationState::KeyExchanged => "key_exchanged",
            VerificationState::MacExchanged => "mac_exchanged",
            VerificationState::Confirmed => "confirmed",
            VerificationState::Cancelled(_) => "cancelled",
            VerificationState::TimedOut => "timed_out",
        }
    }
}

/// A verification event addressed to one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub user_id: String,
    pub device_id: String,
    pub event: VerificationEvent,
}

pub struct VerificationTransaction {
    pub transaction_id: String,
    pub peer_user: String,
    pub peer_device: String,
    pub peer_ed25519: String,
    pub role: Role,
    pub state: VerificationState,
    pub deadline: Instant,
    pub short_code: Option<ShortCode>,
    sas: Option<Sas>,
    established: Option<EstablishedSas>,
    our_key: String,
    we_started: bool,
    start_content: Option<Value>,
    their_commitment: Option<String>,
    peer_mac: Option<MacContent>,
}

impl fmt::Debug for VerificationTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationTransaction")
            .field("transaction_id", &self.transaction_id)
            .field("peer_user", &self.peer_user)
            .field("peer_device", &self.peer_device)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("short_code", &self.short_code)
            .finish_non_exhaustive()
    }
}

impl VerificationTransaction {
    fn new(
        transaction_id: String,
        peer: &DeviceRecord,
        role: Role,
        state: VerificationState,
        deadline: Instant,
    ) -> Self {
        let sas = Sas::new();
        let our_key = sas.public_key().to_base64();
        Self {
            transaction_id,
            peer_user: peer.user_id.clone(),
            peer_device: peer.device_id.clone(),
            peer_ed25519: peer.ed25519_key.clone(),
            role,
            state,
            deadline,
            short_code: None,
            sas: Some(sas),
            established: None,
            our_key,
            we_started: false,
            start_content: None,
            their_commitment: None,
            peer_mac: None,
        }
    }

    fn is_with(&self, user_id: &str, device_id: &str) -> bool {
        self.peer_user == user_id && self.peer_device == device_id
    }
}

fn commitment(public_key: &str, start: &Value) -> Result<String, CryptoError> {
    let canonical = canonical_json(start)?;
    let digest = Sha256::digest(format!("{public_key}{canonical}").as_bytes());
    Ok(encode_b64(&digest))
}

fn start_is_supported(start: &StartContent) -> bool {
    start.method == SAS_METHOD
        && start.key_agreement_protocols.iter().any(|p| p == SAS_KEY_AGREEMENT)
        && start.hashes.iter().any(|h| h == SAS_HASH)
        && start.message_authentication_codes.iter().any(|m| m == SAS_MAC_METHOD)
        && start.short_authentication_string.iter().any(|s| s == "emoji")
}

fn accept_is_supported(accept: &AcceptContent) -> bool {
    accept.method == SAS_METHOD
        && accept.key_agreement_protocol == SAS_KEY_AGREEMENT
        && accept.hash == SAS_HASH
        && accept.message_authentication_code == SAS_MAC_METHOD
}

/// Drives every SAS transaction of this device.
pub struct VerificationEngine {
    own_user: String,
    own_device: String,
    own_ed25519: String,
    timeout: Duration,
    transactions: HashMap<String, VerificationTransaction>,
}

impl VerificationEngine {
    pub fn new(own_user: &str, own_device: &str, own_ed25519: &str, timeout: Duration) -> Self {
        Self {
            own_user: own_user.to_string(),
            own_device: own_device.to_string(),
            own_ed25519: own_ed25519.to_string(),
            timeout,
            transactions: HashMap::new(),
        }
    }

    pub fn transaction(&self, transaction_id: &str) -> Option<&VerificationTransaction> {
        self.transactions.get(transaction_id)
    }

    pub fn state(&self, transaction_id: &str) -> Option<&VerificationState> {
        self.transactions.get(transaction_id).map(|t| &t.state)
    }

    pub fn short_code(&self, transaction_id: &str) -> Option<&ShortCode> {
        self.transactions
            .get(transaction_id)
            .and_then(|t| t.short_code.as_ref())
    }

    /// Incoming requests that have not been answered yet.
    pub fn pending_requests(&self) -> Vec<&VerificationTransaction> {
        let mut pending: Vec<_> = self
            .transactions
            .values()
            .filter(|t| t.role == Role::Responder && t.state == VerificationState::Requested)
            .collect();
        pending.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
        pending
    }

    /// Drop a finished transaction. Live transactions are kept.
    pub fn forget(&mut self, transaction_id: &str) -> Option<VerificationTransaction> {
        match self.transactions.get(transaction_id) {
            Some(t) if t.state.is_terminal() => self.transactions.remove(transaction_id),
            _ => None,
        }
    }

    fn ensure_no_live_transaction(&self, user_id: &str, device_id: &str) -> Result<(), CryptoError> {
        if self
            .transactions
            .values()
            .any(|t| t.is_with(user_id, device_id) && !t.state.is_terminal())
        {
            return Err(CryptoError::TransactionInProgress {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    fn get_mut(&mut self, transaction_id: &str) -> Result<&mut VerificationTransaction, CryptoError> {
        self.transactions
            .get_mut(transaction_id)
            .ok_or_else(|| CryptoError::UnknownTransaction(transaction_id.to_string()))
    }

    /// Open a transaction with `peer` and build the request to send.
    pub fn request(
        &mut self,
        transaction_id: &str,
        peer: &DeviceRecord,
        timestamp_ms: i64,
        now: Instant,
    ) -> Result<Outgoing, CryptoError> {
        self.ensure_no_live_transaction(&peer.user_id, &peer.device_id)?;
        let txn = VerificationTransaction::new(
            transaction_id.to_string(),
            peer,
            Role::Initiator,
            VerificationState::Requested,
            now + self.timeout,
        );
        self.transactions.insert(transaction_id.to_string(), txn);
        tracing::info!(transaction_id, peer = %peer.label(), "verification requested");

        Ok(self.outgoing(
            peer,
            VerificationEvent::Request(RequestContent {
                from_device: self.own_device.as_str().into(),
                methods: vec![SAS_METHOD.to_string()],
                timestamp: timestamp_ms,
                transaction_id: transaction_id.to_string(),
            }),
        ))
    }

    /// Register a request received from `peer`. It is answered by
    /// [`Self::accept_request`].
    pub fn receive_request(
        &mut self,
        content: &RequestContent,
        peer: &DeviceRecord,
        now: Instant,
    ) -> Result<(), CryptoError> {
        if content.from_device.as_str() != peer.device_id {
            return Err(CryptoError::VerificationProtocol(
                "request from_device does not match sender device".into(),
            ));
        }
        if self.transactions.contains_key(&content.transaction_id) {
            return Err(CryptoError::VerificationProtocol(format!(
                "duplicate transaction {}",
                content.transaction_id
            )));
        }
        self.ensure_no_live_transaction(&peer.user_id, &peer.device_id)?;
        if !content.methods.iter().any(|m| m == SAS_METHOD) {
            return Err(CryptoError::VerificationProtocol(
                "peer does not offer m.sas.v1".into(),
            ));
        }
        let txn = VerificationTransaction::new(
            content.transaction_id.clone(),
            peer,
            Role::Responder,
            VerificationState::Requested,
            now + self.timeout,
        );
        self.transactions.insert(content.transaction_id.clone(), txn);
        tracing::info!(transaction_id = %content.transaction_id, peer = %peer.label(), "verification request received");
        Ok(())
    }

    /// Answer an incoming request with `ready`.
    pub fn accept_request(&mut self, transaction_id: &str) -> Result<Outgoing, CryptoError> {
        let own_device = self.own_device.clone();
        let txn = self.get_mut(transaction_id)?;
        if txn.role != Role::Responder || txn.state != VerificationState::Requested {
            return Err(CryptoError::VerificationProtocol(format!(
                "cannot accept transaction in state {}",
                txn.state.as_str()
            )));
        }
        txn.state = VerificationState::Ready;
        Ok(Outgoing {
            user_id: txn.peer_user.clone(),
            device_id: txn.peer_device.clone(),
            event: VerificationEvent::Ready(ReadyContent {
                from_device: own_device.into(),
                methods: vec![SAS_METHOD.to_string()],
                transaction_id: transaction_id.to_string(),
            }),
        })
    }

    /// Feed one event from `sender`. Returns the events to send in reply.
    ///
    /// Protocol violations cancel the transaction and return the cancel
    /// event rather than an error.
    pub fn handle_event(
        &mut self,
        sender: &str,
        event: &VerificationEvent,
    ) -> Result<Vec<Outgoing>, CryptoError> {
        let transaction_id = event.transaction_id().to_string();
        let txn = self.get_mut(&transaction_id)?;
        if txn.peer_user != sender {
            return Err(CryptoError::VerificationProtocol(format!(
                "{sender} is not part of transaction {transaction_id}"
            )));
        }
        if txn.state.is_terminal() {
            tracing::debug!(transaction_id, event_type = event.event_type(), "event for finished transaction");
            return Ok(Vec::new());
        }

        let result = match event {
            VerificationEvent::Request(_) => Err(CancelReason::UnexpectedMessage),
            VerificationEvent::Ready(ready) => self.on_ready(&transaction_id, ready),
            VerificationEvent::Start(start) => self.on_start(&transaction_id, start),
            VerificationEvent::Accept(accept) => self.on_accept(&transaction_id, accept),
            VerificationEvent::Key(key) => self.on_key(&transaction_id, key),
            VerificationEvent::Mac(mac) => self.on_mac(&transaction_id, mac),
            VerificationEvent::Done(_) => Ok(Vec::new()),
            VerificationEvent::Cancel(cancel) => {
                let reason = CancelReason::from_code(&cancel.code);
                tracing::info!(transaction_id, code = %cancel.code, reason = %cancel.reason, "peer cancelled verification");
                self.get_mut(&transaction_id)?.state = VerificationState::Cancelled(reason);
                Ok(Vec::new())
            }
        };

        match result {
            Ok(outgoing) => Ok(outgoing),
            Err(reason) => Ok(self.cancel(&transaction_id, reason)?.into_iter().collect()),
        }
    }

    fn on_ready(&mut self, transaction_id: &str, ready: &ReadyContent) -> Result<Vec<Outgoing>, CancelReason> {
        let own_device = self.own_device.clone();
        let txn = self.transactions.get_mut(transaction_id).ok_or(CancelReason::UnexpectedMessage)?;
        if txn.role != Role::Initiator || txn.state != VerificationState::Requested {
            return Err(CancelReason::UnexpectedMessage);
        }
        if ready.from_device.as_str() != txn.peer_device {
            return Err(CancelReason::UnexpectedMessage);
        }
        if !ready.methods.iter().any(|m| m == SAS_METHOD) {
            return Err(CancelReason::UnknownMethod);
        }

        let start = StartContent {
            from_device: own_device.into(),
            method: SAS_METHOD.to_string(),
            transaction_id: transaction_id.to_string(),
            key_agreement_protocols: vec![SAS_KEY_AGREEMENT.to_string()],
            hashes: vec![SAS_HASH.to_string()],
            message_authentication_codes: vec![SAS_MAC_METHOD.to_string()],
            short_authentication_string: vec!["emoji".to_string(), "decimal".to_string()],
        };
        txn.start_content =
            Some(serde_json::to_value(&start).map_err(|e| CancelReason::Other(e.to_string()))?);
        txn.we_started = true;
        txn.state = VerificationState::Started;
        Ok(vec![Outgoing {
            user_id: txn.peer_user.clone(),
            device_id: txn.peer_device.clone(),
            event: VerificationEvent::Start(start),
        }])
    }

    fn on_start(&mut self, transaction_id: &str, start: &StartContent) -> Result<Vec<Outgoing>, CancelReason> {
        let we_win = (self.own_user.as_str(), self.own_device.as_str());
        let txn = self.transactions.get_mut(transaction_id).ok_or(CancelReason::UnexpectedMessage)?;
        if start.from_device.as_str() != txn.peer_device {
            return Err(CancelReason::UnexpectedMessage);
        }
        match txn.state {
            VerificationState::Ready => {}
            VerificationState::Started if txn.we_started => {
                // Both sides started: the lexicographically smaller user/device keeps its start.
                if we_win < (txn.peer_user.as_str(), txn.peer_device.as_str()) {
                    tracing::debug!(transaction_id, "ignoring peer start, ours takes precedence");
                    return Ok(Vec::new());
                }
                txn.we_started = false;
            }
            _ => return Err(CancelReason::UnexpectedMessage),
        }
        if !start_is_supported(start) {
            return Err(CancelReason::UnknownMethod);
        }

        let start_value = serde_json::to_value(start).map_err(|e| CancelReason::Other(e.to_string()))?;
        let commitment = commitment(&txn.our_key, &start_value).map_err(|e| CancelReason::Other(e.to_string()))?;
        txn.start_content = Some(start_value);
        txn.state = VerificationState::Started;

        let mut sas_strings = vec!["emoji".to_string()];
        if start.short_authentication_string.iter().any(|s| s == "decimal") {
            sas_strings.push("decimal".to_string());
        }
        Ok(vec![Outgoing {
            user_id: txn.peer_user.clone(),
            device_id: txn.peer_device.clone(),
            event: VerificationEvent::Accept(AcceptContent {
                transaction_id: transaction_id.to_string(),
                method: SAS_METHOD.to_string(),
                key_agreement_protocol: SAS_KEY_AGREEMENT.to_string(),
                hash: SAS_HASH.to_string(),
                message_authentication_code: SAS_MAC_METHOD.to_string(),
                short_authentication_string: sas_strings,
                commitment,
            }),
        }])
    }

    fn on_accept(&mut self, transaction_id: &str, accept: &AcceptContent) -> Result<Vec<Outgoing>, CancelReason> {
        let txn = self.transactions.get_mut(transaction_id).ok_or(CancelReason::UnexpectedMessage)?;
        if txn.state != VerificationState::Started || !txn.we_started || txn.their_commitment.is_some() {
            return Err(CancelReason::UnexpectedMessage);
        }
        if !accept_is_supported(accept) {
            return Err(CancelReason::UnknownMethod);
        }
        txn.their_commitment = Some(accept.commitment.clone());
        Ok(vec![Outgoing {
            user_id: txn.peer_user.clone(),
            device_id: txn.peer_device.clone(),
            event: VerificationEvent::Key(KeyContent {
                transaction_id: transaction_id.to_string(),
                key: txn.our_key.clone(),
            }),
        }])
    }

    fn on_key(&mut self, transaction_id: &str, key: &KeyContent) -> Result<Vec<Outgoing>, CancelReason> {
        let own = (self.own_user.clone(), self.own_device.clone());
        let txn = self.transactions.get_mut(transaction_id).ok_or(CancelReason::UnexpectedMessage)?;
        if txn.state != VerificationState::Started || txn.established.is_some() {
            return Err(CancelReason::UnexpectedMessage);
        }
        let start = txn.start_content.clone().ok_or(CancelReason::UnexpectedMessage)?;

        let mut outgoing = Vec::new();
        if txn.we_started {
            let expected = txn.their_commitment.as_deref().ok_or(CancelReason::UnexpectedMessage)?;
            let actual = commitment(&key.key, &start).map_err(|e| CancelReason::Other(e.to_string()))?;
            if actual != expected {
                return Err(CancelReason::MismatchedCommitment);
            }
        } else {
            outgoing.push(Outgoing {
                user_id: txn.peer_user.clone(),
                device_id: txn.peer_device.clone(),
                event: VerificationEvent::Key(KeyContent {
                    transaction_id: transaction_id.to_string(),
                    key: txn.our_key.clone(),
                }),
            });
        }

        let their_key = Curve25519PublicKey::from_base64(&key.key).map_err(|_| CancelReason::CodeMismatch)?;
        let sas = txn.sas.take().ok_or(CancelReason::UnexpectedMessage)?;
        let established = sas.diffie_hellman(their_key).map_err(|_| CancelReason::CodeMismatch)?;

        let ours = format!("{}|{}|{}", own.0, own.1, txn.our_key);
        let theirs = format!("{}|{}|{}", txn.peer_user, txn.peer_device, key.key);
        let (starting, accepting) = if txn.we_started { (ours, theirs) } else { (theirs, ours) };
        let info = format!("{SAS_INFO_PREFIX}|{starting}|{accepting}|{transaction_id}");
        let bytes = established.bytes(&info);
        txn.short_code = Some(ShortCode::from_indices(bytes.emoji_indices(), bytes.decimals()));
        txn.established = Some(established);
        txn.state = VerificationState::KeyExchanged;
        tracing::info!(transaction_id, "verification keys exchanged");
        Ok(outgoing)
    }

    fn on_mac(&mut self, transaction_id: &str, mac: &MacContent) -> Result<Vec<Outgoing>, CancelReason> {
        let txn = self.transactions.get_mut(transaction_id).ok_or(CancelReason::UnexpectedMessage)?;
        match txn.state {
            VerificationState::KeyExchanged if txn.peer_mac.is_none() => {
                txn.peer_mac = Some(mac.clone());
                Ok(Vec::new())
            }
            VerificationState::MacExchanged => {
                txn.peer_mac = Some(mac.clone());
                self.finish(transaction_id)
            }
            _ => Err(CancelReason::UnexpectedMessage),
        }
    }

    /// The operator confirmed that both short codes match: send our MAC.
    pub fn confirm(&mut self, transaction_id: &str) -> Result<Vec<Outgoing>, CryptoError> {
        let own_user = self.own_user.clone();
        let own_device = self.own_device.clone();
        let own_ed25519 = self.own_ed25519.clone();
        let txn = self.get_mut(transaction_id)?;
        if txn.state != VerificationState::KeyExchanged {
            return Err(CryptoError::VerificationProtocol(format!(
                "cannot confirm transaction in state {}",
                txn.state.as_str()
            )));
        }
        let established = txn
            .established
            .as_ref()
            .ok_or_else(|| CryptoError::VerificationProtocol("no shared secret".into()))?;

        let base_info = format!(
            "{MAC_INFO_PREFIX}{own_user}{own_device}{}{}{transaction_id}",
            txn.peer_user, txn.peer_device
        );
        let key_id = format!("ed25519:{own_device}");
        let mut macs = BTreeMap::new();
        macs.insert(
            key_id.clone(),
            established
                .calculate_mac(&own_ed25519, &format!("{base_info}{key_id}"))
                .to_base64(),
        );
        let keys = established
            .calculate_mac(&key_id, &format!("{base_info}KEYS"))
            .to_base64();

        txn.state = VerificationState::MacExchanged;
        let mut outgoing = vec![Outgoing {
            user_id: txn.peer_user.clone(),
            device_id: txn.peer_device.clone(),
            event: VerificationEvent::Mac(MacContent {
                transaction_id: transaction_id.to_string(),
                mac: macs,
                keys,
            }),
        }];

        if txn.peer_mac.is_some() {
            match self.finish(transaction_id) {
                Ok(more) => outgoing.extend(more),
                Err(reason) => outgoing.extend(self.cancel(transaction_id, reason)?),
            }
        }
        Ok(outgoing)
    }

    /// Check the peer's MAC and complete the transaction.
    fn finish(&mut self, transaction_id: &str) -> Result<Vec<Outgoing>, CancelReason> {
        let own_user = self.own_user.clone();
        let own_device = self.own_device.clone();
        let txn = self.transactions.get_mut(transaction_id).ok_or(CancelReason::UnexpectedMessage)?;
        let mac = txn.peer_mac.clone().ok_or(CancelReason::UnexpectedMessage)?;
        let established = txn.established.as_ref().ok_or(CancelReason::UnexpectedMessage)?;

        let base_info = format!(
            "{MAC_INFO_PREFIX}{}{}{own_user}{own_device}{transaction_id}",
            txn.peer_user, txn.peer_device
        );
        let mut key_ids: Vec<&str> = mac.mac.keys().map(String::as_str).collect();
        key_ids.sort_unstable();
        let keys_mac = Mac::from_base64(&mac.keys).map_err(|_| CancelReason::CodeMismatch)?;
        established
            .verify_mac(&key_ids.join(","), &format!("{base_info}KEYS"), &keys_mac)
            .map_err(|_| CancelReason::CodeMismatch)?;

        let device_key_id = format!("ed25519:{}", txn.peer_device);
        let device_mac = mac.mac.get(&device_key_id).ok_or(CancelReason::CodeMismatch)?;
        let device_mac = Mac::from_base64(device_mac).map_err(|_| CancelReason::CodeMismatch)?;
        established
            .verify_mac(&txn.peer_ed25519, &format!("{base_info}{device_key_id}"), &device_mac)
            .map_err(|_| CancelReason::CodeMismatch)?;

        txn.state = VerificationState::Confirmed;
        tracing::info!(transaction_id, peer_device = %txn.peer_device, "verification confirmed");
        Ok(vec![Outgoing {
            user_id: txn.peer_user.clone(),
            device_id: txn.peer_device.clone(),
            event: VerificationEvent::Done(DoneContent {
                transaction_id: transaction_id.to_string(),
            }),
        }])
    }

    /// Cancel a live transaction. Returns the cancel event to send, or `None`
    /// if the transaction had already finished.
    pub fn cancel(
        &mut self,
        transaction_id: &str,
        reason: CancelReason,
    ) -> Result<Option<Outgoing>, CryptoError> {
        let txn = self.get_mut(transaction_id)?;
        if txn.state.is_terminal() {
            return Ok(None);
        }
        tracing::info!(transaction_id, code = reason.code(), "cancelling verification");
        let event = VerificationEvent::Cancel(CancelContent {
            transaction_id: transaction_id.to_string(),
            code: reason.code().to_string(),
            reason: reason.description().to_string(),
        });
        txn.state = if reason == CancelReason::TimedOut {
            VerificationState::TimedOut
        } else {
            VerificationState::Cancelled(reason)
        };
        Ok(Some(Outgoing {
            user_id: txn.peer_user.clone(),
            device_id: txn.peer_device.clone(),
            event,
        }))
    }

    /// Time out every live transaction whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Outgoing> {
        let due: Vec<String> = self
            .transactions
            .values()
            .filter(|t| !t.state.is_terminal() && t.deadline <= now)
            .map(|t| t.transaction_id.clone())
            .collect();
        due.iter()
            .filter_map(|id| self.cancel(id, CancelReason::TimedOut).ok().flatten())
            .collect()
    }

    fn outgoing(&self, peer: &DeviceRecord, event: VerificationEvent) -> Outgoing {
        Outgoing {
            user_id: peer.user_id.clone(),
            device_id: peer.device_id.clone(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::TrustState;

    struct Side {
        engine: VerificationEngine,
        device: DeviceRecord,
    }

    fn side(user: &str, device: &str) -> Side {
        let account = vodozemac::olm::Account::new();
        let ed25519 = account.ed25519_key().to_base64();
        Side {
            engine: VerificationEngine::new(user, device, &ed25519, Duration::from_secs(300)),
            device: DeviceRecord {
                user_id: user.into(),
                device_id: device.into(),
                curve25519_key: account.curve25519_key().to_base64(),
                ed25519_key: ed25519,
                display_name: None,
                trust: TrustState::Unverified,
                first_seen_at: 0,
                last_seen_at: 0,
                verified_at: None,
                deleted: false,
            },
        }
    }

    fn deliver(to: &mut Side, from: &Side, outgoing: Vec<Outgoing>) -> Vec<Outgoing> {
        let mut replies = Vec::new();
        for out in outgoing {
            assert_eq!(out.device_id, to.device.device_id);
            replies.extend(to.engine.handle_event(&from.device.user_id, &out.event).unwrap());
        }
        replies
    }

    /// Run request/ready/start/accept/key until both sides show a code.
    fn exchange_keys(alice: &mut Side, bob: &mut Side) -> String {
        let now = Instant::now();
        let request = alice.engine.request("txn1", &bob.device, 0, now).unwrap();
        let VerificationEvent::Request(content) = &request.event else {
            panic!("expected request");
        };
        bob.engine.receive_request(content, &alice.device, now).unwrap();
        assert_eq!(bob.engine.pending_requests().len(), 1);

        let ready = bob.engine.accept_request("txn1").unwrap();
        let start = deliver(alice, bob, vec![ready]);
        let accept = deliver(bob, alice, start);
        let key = deliver(alice, bob, accept);
        let bob_key = deliver(bob, alice, key);
        let nothing = deliver(alice, bob, bob_key);
        assert!(nothing.is_empty());
        "txn1".to_string()
    }

    #[test]
    fn emoji_table_has_64_distinct_entries() {
        let names: std::collections::HashSet<_> = EMOJI_TABLE.iter().map(|(_, n)| n).collect();
        assert_eq!(names.len(), 64);
        assert_eq!(EMOJI_TABLE[0], ("🐶", "Dog"));
        assert_eq!(EMOJI_TABLE[63], ("📌", "Pin"));
    }

    #[test]
    fn both_sides_derive_the_same_code() {
        let mut alice = side("@alice:hs", "A");
        let mut bob = side("@alice:hs", "B");
        let txn = exchange_keys(&mut alice, &mut bob);

        assert_eq!(alice.engine.state(&txn), Some(&VerificationState::KeyExchanged));
        assert_eq!(bob.engine.state(&txn), Some(&VerificationState::KeyExchanged));
        let a = alice.engine.short_code(&txn).unwrap();
        let b = bob.engine.short_code(&txn).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.emoji.len(), 7);
        assert!(a.decimals.iter().all(|d| (1000..=9191).contains(d)));
    }

    #[test]
    fn confirming_both_sides_completes() {
        let mut alice = side("@alice:hs", "A");
        let mut bob = side("@alice:hs", "B");
        let txn = exchange_keys(&mut alice, &mut bob);

        let alice_mac = alice.engine.confirm(&txn).unwrap();
        assert_eq!(alice.engine.state(&txn), Some(&VerificationState::MacExchanged));
        // Bob has not confirmed yet, so the MAC is held.
        assert!(deliver(&mut bob, &alice, alice_mac).is_empty());

        let bob_out = bob.engine.confirm(&txn).unwrap();
        assert_eq!(bob.engine.state(&txn), Some(&VerificationState::Confirmed));
        assert!(matches!(bob_out[1].event, VerificationEvent::Done(_)));

        let alice_out = deliver(&mut alice, &bob, bob_out);
        assert_eq!(alice.engine.state(&txn), Some(&VerificationState::Confirmed));
        assert!(matches!(alice_out[0].event, VerificationEvent::Done(_)));
    }

    #[test]
    fn wrong_device_key_is_a_mismatch() {
        let mut alice = side("@alice:hs", "A");
        let mut bob = side("@alice:hs", "B");
        // Alice holds a different ed25519 key for Bob than Bob's real one.
        bob_with_forged_key(&mut bob);
        let txn = exchange_keys(&mut alice, &mut bob);

        let bob_mac = bob.engine.confirm(&txn).unwrap();
        alice.engine.confirm(&txn).unwrap();
        let replies = deliver(&mut alice, &bob, bob_mac);
        assert_eq!(
            alice.engine.state(&txn),
            Some(&VerificationState::Cancelled(CancelReason::CodeMismatch))
        );
        match &replies[0].event {
            VerificationEvent::Cancel(c) => assert_eq!(c.code, "m.key_mismatch"),
            other => panic!("expected cancel, got {other:?}"),
        }
    }

    fn bob_with_forged_key(bob: &mut Side) {
        let other = vodozemac::olm::Account::new();
        bob.engine.own_ed25519 = other.ed25519_key().to_base64();
    }

    #[test]
    fn tampered_key_breaks_commitment() {
        let mut alice = side("@alice:hs", "A");
        let mut bob = side("@alice:hs", "B");
        let now = Instant::now();
        let request = alice.engine.request("t", &bob.device, 0, now).unwrap();
        let VerificationEvent::Request(content) = &request.event else {
            panic!("expected request");
        };
        bob.engine.receive_request(content, &alice.device, now).unwrap();
        let ready = bob.engine.accept_request("t").unwrap();
        let start = deliver(&mut alice, &bob, vec![ready]);
        let accept = deliver(&mut bob, &alice, start);
        let key = deliver(&mut alice, &bob, accept);
        let mut bob_key = deliver(&mut bob, &alice, key);

        let mallory = Sas::new().public_key().to_base64();
        if let VerificationEvent::Key(k) = &mut bob_key[0].event {
            k.key = mallory;
        }
        let replies = deliver(&mut alice, &bob, bob_key);
        assert_eq!(
            alice.engine.state("t"),
            Some(&VerificationState::Cancelled(CancelReason::MismatchedCommitment))
        );
        assert!(matches!(replies[0].event, VerificationEvent::Cancel(_)));
    }

    #[test]
    fn second_transaction_to_same_device_is_refused() {
        let mut alice = side("@alice:hs", "A");
        let bob = side("@alice:hs", "B");
        let now = Instant::now();
        alice.engine.request("t1", &bob.device, 0, now).unwrap();
        assert!(matches!(
            alice.engine.request("t2", &bob.device, 0, now),
            Err(CryptoError::TransactionInProgress { .. })
        ));

        alice.engine.cancel("t1", CancelReason::User).unwrap();
        assert!(alice.engine.request("t2", &bob.device, 0, now).is_ok());
        assert!(alice.engine.forget("t1").is_some());
        assert!(alice.engine.forget("t2").is_none());
    }

    #[test]
    fn deadline_times_out_without_confirmation() {
        let mut alice = side("@alice:hs", "A");
        let bob = side("@alice:hs", "B");
        let now = Instant::now();
        alice.engine.request("t", &bob.device, 0, now).unwrap();

        assert!(alice.engine.expire(now + Duration::from_secs(299)).is_empty());
        let out = alice.engine.expire(now + Duration::from_secs(300));
        assert_eq!(out.len(), 1);
        assert_eq!(alice.engine.state("t"), Some(&VerificationState::TimedOut));
        match &out[0].event {
            VerificationEvent::Cancel(c) => assert_eq!(c.code, "m.timeout"),
            other => panic!("expected cancel, got {other:?}"),
        }
    }

    #[test]
    fn peer_cancel_ends_transaction() {
        let mut alice = side("@alice:hs", "A");
        let bob = side("@alice:hs", "B");
        alice.engine.request("t", &bob.device, 0, Instant::now()).unwrap();
        let cancel = VerificationEvent::Cancel(CancelContent {
            transaction_id: "t".into(),
            code: "m.user".into(),
            reason: "no".into(),
        });
        assert!(alice.engine.handle_event("@alice:hs", &cancel).unwrap().is_empty());
        assert_eq!(
            alice.engine.state("t"),
            Some(&VerificationState::Cancelled(CancelReason::User))
        );
    }

    #[test]
    fn events_from_strangers_are_refused() {
        let mut alice = side("@alice:hs", "A");
        let bob = side("@alice:hs", "B");
        alice.engine.request("t", &bob.device, 0, Instant::now()).unwrap();
        let done = VerificationEvent::Done(DoneContent { transaction_id: "t".into() });
        assert!(alice.engine.handle_event("@mallory:hs", &done).is_err());
        assert!(matches!(
            alice.engine.handle_event("@alice:hs", &VerificationEvent::Done(DoneContent {
                transaction_id: "unknown".into()
            })),
            Err(CryptoError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn out_of_order_mac_cancels() {
        let mut alice = side("@alice:hs", "A");
        let bob = side("@alice:hs", "B");
        alice.engine.request("t", &bob.device, 0, Instant::now()).unwrap();
        let mac = VerificationEvent::Mac(MacContent {
            transaction_id: "t".into(),
            mac: BTreeMap::new(),
            keys: String::new(),
        });
        let out = alice.engine.handle_event("@alice:hs", &mac).unwrap();
        assert_eq!(
            alice.engine.state("t"),
            Some(&VerificationState::Cancelled(CancelReason::UnexpectedMessage))
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn start_collision_is_won_by_smaller_device() {
        let mut alice = side("@alice:hs", "A");
        let mut bob = side("@alice:hs", "B");
        let now = Instant::now();
        let request = alice.engine.request("t", &bob.device, 0, now).unwrap();
        let VerificationEvent::Request(content) = &request.event else {
            panic!("expected request");
        };
        bob.engine.receive_request(content, &alice.device, now).unwrap();
        let ready = bob.engine.accept_request("t").unwrap();
        let alice_start = deliver(&mut alice, &bob, vec![ready]);

        // Bob, as the larger device, yields to Alice's start.
        let bob_start = VerificationEvent::Start(StartContent {
            from_device: "B".into(),
            method: SAS_METHOD.into(),
            transaction_id: "t".into(),
            key_agreement_protocols: vec![SAS_KEY_AGREEMENT.into()],
            hashes: vec![SAS_HASH.into()],
            message_authentication_codes: vec![SAS_MAC_METHOD.into()],
            short_authentication_string: vec!["emoji".into()],
        });
        assert!(alice.engine.handle_event("@alice:hs", &bob_start).unwrap().is_empty());
        let accept = deliver(&mut bob, &alice, alice_start);
        assert!(matches!(accept[0].event, VerificationEvent::Accept(_)));
    }

    #[test]
    fn short_code_lines() {
        let code = ShortCode::from_indices([0, 1, 2, 3, 4, 5, 63], (1000, 2000, 3000));
        assert!(code.emoji_line().starts_with("🐶 Dog | 🐱 Cat"));
        assert!(code.emoji_line().ends_with("📌 Pin"));
        assert_eq!(code.decimal_line(), "1000 2000 3000");
        assert_eq!(code.to_string(), code.emoji_line());
    }

    #[test]
    fn cancel_codes_round_trip() {
        for reason in [
            CancelReason::User,
            CancelReason::TimedOut,
            CancelReason::CodeMismatch,
            CancelReason::MismatchedCommitment,
            CancelReason::MismatchedSas,
            CancelReason::UnexpectedMessage,
            CancelReason::UnknownMethod,
            CancelReason::Accepted,
        ] {
            assert_eq!(CancelReason::from_code(reason.code()), reason);
        }
        assert_eq!(
            CancelReason::from_code("org.example.custom"),
            CancelReason::Other("org.example.custom".into())
        );
    }
}
