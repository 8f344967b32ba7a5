//! `m.key.verification.*` to-device event contents.

use std::collections::BTreeMap;

use crate::ids::DeviceId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContent {
    pub from_device: DeviceId,
    pub methods: Vec<String>,
    pub timestamp: i64,
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyContent {
    pub from_device: DeviceId,
    pub methods: Vec<String>,
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartContent {
    pub from_device: DeviceId,
    pub method: String,
    pub transaction_id: String,
    #[serde(default)]
    pub key_agreement_protocols: Vec<String>,
    #[serde(default)]
    pub hashes: Vec<String>,
    #[serde(default)]
    pub message_authentication_codes: Vec<String>,
    #[serde(default)]
    pub short_authentication_string: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptContent {
    pub transaction_id: String,
    pub method: String,
    pub key_agreement_protocol: String,
    pub hash: String,
    pub message_authentication_code: String,
    pub short_authentication_string: Vec<String>,
    pub commitment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyContent {
    pub transaction_id: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacContent {
    pub transaction_id: String,
    /// `"ed25519:<device>" -> mac`
    pub mac: BTreeMap<String, String>,
    pub keys: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneContent {
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelContent {
    pub transaction_id: String,
    pub code: String,
    #[serde(default)]
    pub reason: String,
}

/// Any verification event, tagged by its Matrix event type.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationEvent {
    Request(RequestContent),
    Ready(ReadyContent),
    Start(StartContent),
    Accept(AcceptContent),
    Key(KeyContent),
    Mac(MacContent),
    Done(DoneContent),
    Cancel(CancelContent),
}

impl VerificationEvent {
    /// Parse from an event type and untyped content. Non-verification types yield `None`.
    pub fn parse(
        event_type: &str,
        content: &serde_json::Value,
    ) -> Option<Result<Self, serde_json::Error>> {
        use crate::constants::*;
        let c = content.clone();
        let parsed = match event_type {
            VERIFICATION_REQUEST => serde_json::from_value(c).map(Self::Request),
            VERIFICATION_READY => serde_json::from_value(c).map(Self::Ready),
            VERIFICATION_START => serde_json::from_value(c).map(Self::Start),
            VERIFICATION_ACCEPT => serde_json::from_value(c).map(Self::Accept),
            VERIFICATION_KEY => serde_json::from_value(c).map(Self::Key),
            VERIFICATION_MAC => serde_json::from_value(c).map(Self::Mac),
            VERIFICATION_DONE => serde_json::from_value(c).map(Self::Done),
            VERIFICATION_CANCEL => serde_json::from_value(c).map(Self::Cancel),
            _ => return None,
        };
        Some(parsed)
    }

    pub fn event_type(&self) -> &'static str {
        use crate::constants::*;
        match self {
            Self::Request(_) => VERIFICATION_REQUEST,
            Self::Ready(_) => VERIFICATION_READY,
            Self::Start(_) => VERIFICATION_START,
            Self::Accept(_) => VERIFICATION_ACCEPT,
            Self::Key(_) => VERIFICATION_KEY,
            Self::Mac(_) => VERIFICATION_MAC,
            Self::Done(_) => VERIFICATION_DONE,
            Self::Cancel(_) => VERIFICATION_CANCEL,
        }
    }

    pub fn transaction_id(&self) -> &str {
        match self {
            Self::Request(c) => &c.transaction_id,
            Self::Ready(c) => &c.transaction_id,
            Self::Start(c) => &c.transaction_id,
            Self::Accept(c) => &c.transaction_id,
            Self::Key(c) => &c.transaction_id,
            Self::Mac(c) => &c.transaction_id,
            Self::Done(c) => &c.transaction_id,
            Self::Cancel(c) => &c.transaction_id,
        }
    }

    pub fn content(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Request(c) => serde_json::to_value(c),
            Self::Ready(c) => serde_json::to_value(c),
            Self::Start(c) => serde_json::to_value(c),
            Self::Accept(c) => serde_json::to_value(c),
            Self::Key(c) => serde_json::to_value(c),
            Self::Mac(c) => serde_json::to_value(c),
            Self::Done(c) => serde_json::to_value(c),
            Self::Cancel(c) => serde_json::to_value(c),
        }
    }
}
