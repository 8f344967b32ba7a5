//! Drives SAS verification over the to-device channel.
//!
//! [`VerificationEngine`] decides what to send; [`Verifier`] moves those
//! events through the homeserver, keeps syncing until the transaction
//! advances, and records trust once it is confirmed. Progress is reported
//! to a [`VerificationObserver`].

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mxagent_crypto::error::CryptoError;
use mxagent_crypto::sas::{CancelReason, Outgoing, ShortCode, VerificationEngine, VerificationState};
use mxagent_crypto::storage::device_store::DeviceRecord;
use mxagent_crypto::trust::TrustState;
use mxagent_shared::api::to_device::SendToDeviceRequest;
use mxagent_shared::api::verification::{RequestContent, VerificationEvent};
use mxagent_shared::error::MxError;
use mxagent_shared::ids::{DeviceId, TransactionId, UserId};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::manager::CryptoManager;
use crate::sync::SyncEngine;

const DEFAULT_POLL: Duration = Duration::from_secs(5);
const MAX_REQUEST_AGE_MS: i64 = 10 * 60 * 1000;
const MAX_REQUEST_SKEW_MS: i64 = 5 * 60 * 1000;

/// Display-name fragments of clients a person is likely looking at.
const INTERACTIVE_HINTS: &[&str] = &[
    "element", "desktop", "ios", "android", "web", "mobile", "fluffychat", "nheko", "schildi",
    "cinny",
];
/// Display-name fragments of unattended devices.
const HEADLESS_HINTS: &[&str] = &["headless", "backup", "bot", "agent", "server", "cli"];

/// Progress of one transaction, as reported to an observer.
#[derive(Debug, Clone, Copy)]
pub enum VerificationUpdate<'a> {
    Requested {
        transaction_id: &'a str,
        peer: &'a DeviceRecord,
    },
    Code {
        transaction_id: &'a str,
        code: &'a ShortCode,
    },
    Confirmed {
        transaction_id: &'a str,
    },
    Cancelled {
        transaction_id: &'a str,
        reason: &'a CancelReason,
    },
    TimedOut {
        transaction_id: &'a str,
    },
}

/// Receives verification progress. A failing `Code` report aborts the
/// transaction before any MAC is sent.
pub trait VerificationObserver: Send + Sync {
    fn report(&self, update: &VerificationUpdate<'_>) -> Result<(), MxError>;
}

/// Observer that only logs.
#[derive(Debug, Default)]
pub struct LogObserver;

impl VerificationObserver for LogObserver {
    fn report(&self, update: &VerificationUpdate<'_>) -> Result<(), MxError> {
        tracing::debug!(?update, "verification update");
        Ok(())
    }
}

/// A transaction that reached the key exchange and awaits the operator.
#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub transaction_id: String,
    pub peer: DeviceRecord,
    pub short_code: ShortCode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationOutcome {
    pub transaction_id: String,
    pub user_id: String,
    pub device_id: String,
    /// Key requests sent for outstanding gaps after trust was granted.
    pub keys_requested: usize,
}

fn client_rank(device: &DeviceRecord) -> u8 {
    let name = device
        .display_name
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if HEADLESS_HINTS.iter().any(|h| name.contains(h)) {
        2
    } else if INTERACTIVE_HINTS.iter().any(|h| name.contains(h)) {
        0
    } else {
        1
    }
}

/// Candidate devices to verify with, best first.
///
/// Interactive clients come first and unattended ones last; within a rank
/// the most recently seen device wins. `last_seen_ms` overrides the
/// store's own timestamps where the homeserver reported one.
pub fn rank_targets(
    devices: &[DeviceRecord],
    own_device: &str,
    last_seen_ms: &HashMap<String, i64>,
) -> Vec<DeviceRecord> {
    let mut candidates: Vec<DeviceRecord> = devices
        .iter()
        .filter(|d| d.device_id != own_device && !d.deleted && d.trust != TrustState::Blacklisted)
        .cloned()
        .collect();
    candidates.sort_by_key(|d| {
        let seen = last_seen_ms
            .get(&d.device_id)
            .copied()
            .unwrap_or(d.last_seen_at * 1000);
        (client_rank(d), Reverse(seen))
    });
    candidates
}

pub struct Verifier {
    manager: Arc<CryptoManager>,
    sync: Arc<SyncEngine>,
    engine: VerificationEngine,
    observer: Arc<dyn VerificationObserver>,
    poll: Duration,
}

impl Verifier {
    pub fn new(
        manager: Arc<CryptoManager>,
        sync: Arc<SyncEngine>,
        observer: Arc<dyn VerificationObserver>,
        timeout: Duration,
    ) -> Self {
        let identity = manager.identity();
        let engine = VerificationEngine::new(
            &identity.user_id,
            &identity.device_id,
            &identity.ed25519,
            timeout,
        );
        Self {
            manager,
            sync,
            engine,
            observer,
            poll: DEFAULT_POLL,
        }
    }

    /// Long-poll length used while waiting for the peer.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn state(&self, transaction_id: &str) -> Option<&VerificationState> {
        self.engine.state(transaction_id)
    }

    /// The device to verify with: `device_id` if given, otherwise the best
    /// ranked other device of our own user.
    pub async fn select_target(&self, device_id: Option<&str>) -> Result<DeviceRecord, MxError> {
        let own_user = self.manager.user_id().to_string();
        self.manager.invalidate_devices(&own_user)?;
        self.manager.refresh_device_lists().await?;
        let devices = self.manager.devices_of(&own_user)?;

        if let Some(id) = device_id {
            return devices
                .into_iter()
                .find(|d| d.device_id == id && !d.deleted)
                .ok_or_else(|| MxError::Config(format!("{id} is not a known device of {own_user}")));
        }

        let last_seen = match self.manager.api().devices().await {
            Ok(resp) => resp
                .devices
                .into_iter()
                .filter_map(|d| d.last_seen_ts.map(|ts| (d.device_id.to_string(), ts)))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not list devices, ranking by local data");
                HashMap::new()
            }
        };
        rank_targets(&devices, self.manager.device_id(), &last_seen)
            .into_iter()
            .next()
            .ok_or_else(|| MxError::NotConfigured(format!("{own_user} has no other device to verify with")))
    }

    /// Request verification and run it until both sides hold the short code.
    pub async fn begin_verification(&mut self, device_id: Option<&str>) -> Result<PendingVerification, MxError> {
        let peer = self.select_target(device_id).await?;
        let transaction_id = TransactionId::new().to_string();
        let request = self
            .engine
            .request(&transaction_id, &peer, crate::now_millis(), Instant::now())?;
        self.observer.report(&VerificationUpdate::Requested {
            transaction_id: &transaction_id,
            peer: &peer,
        })?;
        self.send(vec![request]).await?;
        tracing::info!(transaction_id = %transaction_id, peer = %peer.label(), "waiting for the other device to accept");
        self.await_code(&transaction_id).await
    }

    /// Wait for one of our other devices to ask for verification, answer it,
    /// and run until the short code is known.
    pub async fn wait_for_request(&mut self, timeout: Duration) -> Result<PendingVerification, MxError> {
        let deadline = Instant::now() + timeout;
        let transaction_id = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MxError::TimedOut);
            }
            let outcome = self.sync.sync_once(&self.manager, self.poll.min(remaining)).await?;
            let mut accepted = None;
            for (sender, event) in outcome.verification_events {
                match event {
                    VerificationEvent::Request(request) if accepted.is_none() => {
                        accepted = self.accept_incoming(&sender, &request).await?;
                    }
                    other => self.dispatch(&sender, other).await?,
                }
            }
            if let Some(id) = accepted {
                break id;
            }
        };
        self.await_code(&transaction_id).await
    }

    /// The operator saw matching codes: exchange MACs and mark the peer
    /// verified. Outstanding room keys are requested from it afterwards.
    pub async fn confirm_verification(&mut self, transaction_id: &str) -> Result<VerificationOutcome, MxError> {
        let outgoing = self.engine.confirm(transaction_id)?;
        self.send(outgoing).await?;
        self.pump(transaction_id, |s| *s == VerificationState::Confirmed).await?;

        let (user_id, device_id) = {
            let txn = self.transaction(transaction_id)?;
            (txn.peer_user.clone(), txn.peer_device.clone())
        };
        self.manager.mark_device_verified(&user_id, &device_id)?;
        self.observer
            .report(&VerificationUpdate::Confirmed { transaction_id })?;
        self.engine.forget(transaction_id);

        let keys_requested = match self.manager.request_keys_for_gaps(None, Duration::ZERO).await {
            Ok(round) => round.request_ids.len(),
            Err(e) => {
                tracing::warn!(error = %e, "could not request missing room keys");
                0
            }
        };
        Ok(VerificationOutcome {
            transaction_id: transaction_id.to_string(),
            user_id,
            device_id,
            keys_requested,
        })
    }

    /// The operator saw different codes. The peer is told and no trust changes.
    pub async fn reject_code(&mut self, transaction_id: &str) -> Result<(), MxError> {
        if let Some(out) = self.engine.cancel(transaction_id, CancelReason::MismatchedSas)? {
            self.send(vec![out]).await?;
        }
        let state = VerificationState::Cancelled(CancelReason::MismatchedSas);
        Err(self.failure(transaction_id, &state)?)
    }

    pub async fn cancel(&mut self, transaction_id: &str) -> Result<(), MxError> {
        if let Some(out) = self.engine.cancel(transaction_id, CancelReason::User)? {
            self.send(vec![out]).await?;
            self.observer.report(&VerificationUpdate::Cancelled {
                transaction_id,
                reason: &CancelReason::User,
            })?;
        }
        self.engine.forget(transaction_id);
        Ok(())
    }

    /// Run verification on a background task. The returned handle carries
    /// the short code; dropping it cancels the transaction.
    pub async fn spawn(mut self, device_id: Option<String>) -> Result<VerificationHandle, MxError> {
        let (pending_tx, pending_rx) = oneshot::channel();
        let (decision_tx, decision_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();

        tokio::spawn(async move {
            let pending = match self.begin_verification(device_id.as_deref()).await {
                Ok(pending) => pending,
                Err(e) => {
                    let _ = pending_tx.send(Err(e));
                    return;
                }
            };
            let transaction_id = pending.transaction_id.clone();
            if pending_tx.send(Ok(pending)).is_err() {
                if let Err(e) = self.cancel(&transaction_id).await {
                    tracing::warn!(error = %e, "could not cancel abandoned verification");
                }
                return;
            }
            let result = self.decide(&transaction_id, decision_rx).await;
            let _ = result_tx.send(result);
        });

        let pending = pending_rx
            .await
            .map_err(|_| MxError::Crypto("verification task ended unexpectedly".into()))??;
        Ok(VerificationHandle {
            pending,
            decision: Some(decision_tx),
            result: result_rx,
        })
    }

    async fn decide(
        &mut self,
        transaction_id: &str,
        decision: oneshot::Receiver<Decision>,
    ) -> Result<VerificationOutcome, MxError> {
        let remaining = self
            .transaction(transaction_id)?
            .deadline
            .saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, decision).await {
            Ok(Ok(Decision::Confirm)) => self.confirm_verification(transaction_id).await,
            Ok(Ok(Decision::Reject)) => {
                self.reject_code(transaction_id).await?;
                Err(MxError::CodeMismatch)
            }
            Ok(Ok(Decision::Cancel)) | Ok(Err(_)) => {
                self.cancel(transaction_id).await?;
                Err(MxError::VerificationCancelled(CancelReason::User.code().to_string()))
            }
            Err(_) => {
                if let Some(out) = self.engine.cancel(transaction_id, CancelReason::TimedOut)? {
                    self.send(vec![out]).await?;
                }
                Err(self.failure(transaction_id, &VerificationState::TimedOut)?)
            }
        }
    }

    fn transaction(&self, transaction_id: &str) -> Result<&mxagent_crypto::sas::VerificationTransaction, MxError> {
        self.engine
            .transaction(transaction_id)
            .ok_or_else(|| MxError::Crypto(format!("unknown verification transaction {transaction_id}")))
    }

    async fn await_code(&mut self, transaction_id: &str) -> Result<PendingVerification, MxError> {
        self.pump(transaction_id, |s| *s == VerificationState::KeyExchanged).await?;
        let (peer_user, peer_device, short_code) = {
            let txn = self.transaction(transaction_id)?;
            let code = txn
                .short_code
                .clone()
                .ok_or_else(|| MxError::Crypto("keys exchanged without a short code".into()))?;
            (txn.peer_user.clone(), txn.peer_device.clone(), code)
        };
        let peer = self
            .manager
            .device(&peer_user, &peer_device)?
            .ok_or_else(|| MxError::Crypto(format!("{peer_user} {peer_device} left the device list")))?;

        if let Err(e) = self.observer.report(&VerificationUpdate::Code {
            transaction_id,
            code: &short_code,
        }) {
            tracing::error!(error = %e, "could not publish the short code");
            self.cancel(transaction_id).await?;
            return Err(e);
        }
        Ok(PendingVerification {
            transaction_id: transaction_id.to_string(),
            peer,
            short_code,
        })
    }

    /// Sync and feed events until `done` holds for the transaction. A
    /// terminal state that is not `done` becomes the matching error.
    async fn pump(
        &mut self,
        transaction_id: &str,
        done: impl Fn(&VerificationState) -> bool,
    ) -> Result<(), MxError> {
        loop {
            let expired = self.engine.expire(Instant::now());
            self.send(expired).await?;

            let (state, deadline) = {
                let txn = self.transaction(transaction_id)?;
                (txn.state.clone(), txn.deadline)
            };
            if done(&state) {
                return Ok(());
            }
            if state.is_terminal() {
                return Err(self.failure(transaction_id, &state)?);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = self.sync.sync_once(&self.manager, self.poll.min(remaining)).await?;
            for (sender, event) in outcome.verification_events {
                self.dispatch(&sender, event).await?;
            }
        }
    }

    async fn dispatch(&mut self, sender: &str, event: VerificationEvent) -> Result<(), MxError> {
        match self.engine.handle_event(sender, &event) {
            Ok(outgoing) => self.send(outgoing).await,
            Err(CryptoError::UnknownTransaction(id)) => {
                tracing::debug!(transaction_id = %id, event_type = event.event_type(), "event for another transaction");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(sender, error = %e, "verification event rejected");
                Ok(())
            }
        }
    }

    async fn accept_incoming(&mut self, sender: &str, request: &RequestContent) -> Result<Option<String>, MxError> {
        if sender != self.manager.user_id() || request.from_device.as_str() == self.manager.device_id() {
            tracing::info!(sender, from_device = %request.from_device, "ignoring verification request");
            return Ok(None);
        }
        let age = crate::now_millis() - request.timestamp;
        if !(-MAX_REQUEST_SKEW_MS..=MAX_REQUEST_AGE_MS).contains(&age) {
            tracing::info!(transaction_id = %request.transaction_id, age_ms = age, "ignoring stale verification request");
            return Ok(None);
        }

        let device_id = request.from_device.as_str();
        let mut peer = self.manager.device(sender, device_id)?;
        if peer.is_none() {
            self.manager.invalidate_devices(sender)?;
            self.manager.refresh_device_lists().await?;
            peer = self.manager.device(sender, device_id)?;
        }
        let Some(peer) = peer else {
            tracing::warn!(sender, device_id, "verification request from unknown device");
            return Ok(None);
        };

        if let Err(e) = self.engine.receive_request(request, &peer, Instant::now()) {
            tracing::warn!(transaction_id = %request.transaction_id, error = %e, "cannot accept verification request");
            return Ok(None);
        }
        self.observer.report(&VerificationUpdate::Requested {
            transaction_id: &request.transaction_id,
            peer: &peer,
        })?;
        let ready = self.engine.accept_request(&request.transaction_id)?;
        self.send(vec![ready]).await?;
        Ok(Some(request.transaction_id.clone()))
    }

    /// Report a failed transaction and turn its state into an error.
    fn failure(&mut self, transaction_id: &str, state: &VerificationState) -> Result<MxError, MxError> {
        let err = match state {
            VerificationState::TimedOut => {
                self.observer
                    .report(&VerificationUpdate::TimedOut { transaction_id })?;
                MxError::TimedOut
            }
            VerificationState::Cancelled(reason) => {
                self.observer.report(&VerificationUpdate::Cancelled {
                    transaction_id,
                    reason,
                })?;
                match reason {
                    CancelReason::CodeMismatch
                    | CancelReason::MismatchedSas
                    | CancelReason::MismatchedCommitment => MxError::CodeMismatch,
                    other => MxError::VerificationCancelled(other.code().to_string()),
                }
            }
            other => MxError::Protocol(format!("verification stopped in state {}", other.as_str())),
        };
        self.engine.forget(transaction_id);
        Ok(err)
    }

    async fn send(&self, outgoing: Vec<Outgoing>) -> Result<(), MxError> {
        for out in outgoing {
            let request = SendToDeviceRequest::single(
                &UserId::from(out.user_id.as_str()),
                &DeviceId::from(out.device_id.as_str()),
                out.event.content()?,
            );
            self.manager
                .send_to_device(out.event.event_type(), &request)
                .await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Confirm,
    Reject,
    Cancel,
}

/// A verification running on a background task.
pub struct VerificationHandle {
    pending: PendingVerification,
    decision: Option<oneshot::Sender<Decision>>,
    result: oneshot::Receiver<Result<VerificationOutcome, MxError>>,
}

impl std::fmt::Debug for VerificationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationHandle")
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl VerificationHandle {
    pub fn pending(&self) -> &PendingVerification {
        &self.pending
    }

    pub async fn confirm(self) -> Result<VerificationOutcome, MxError> {
        self.decide(Decision::Confirm).await
    }

    pub async fn reject(self) -> Result<VerificationOutcome, MxError> {
        self.decide(Decision::Reject).await
    }

    pub async fn cancel(self) -> Result<(), MxError> {
        match self.decide(Decision::Cancel).await {
            Ok(_) | Err(MxError::VerificationCancelled(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn decide(self, decision: Decision) -> Result<VerificationOutcome, MxError> {
        let VerificationHandle {
            decision: sender,
            result,
            ..
        } = self;
        if let Some(sender) = sender {
            let _ = sender.send(decision);
        }
        result
            .await
            .map_err(|_| MxError::Crypto("verification task ended unexpectedly".into()))?
    }
}
