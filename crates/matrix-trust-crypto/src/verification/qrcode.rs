// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use as_variant::as_variant;
use eyeball::{ObservableWriteGuard, SharedObservable};
use futures_core::Stream;
use matrix_trust_qrcode::{qrcode::QrCode, EncodingError, QrVerificationData};
use rand::{thread_rng, RngCore};
use ruma::{serde::Base64, DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use subtle::ConstantTimeEq;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument, trace, warn};

use super::{
    requests::{OutgoingContent, OutgoingVerificationRequest, VerificationTransport},
    CancelCode, CancelContent, CancelInfo, FlowId, StartContent, VerificationEvent,
    VerificationStore, VerificationTxState, RECIPROCATE_METHOD,
};
use crate::error::VerificationError;

const SECRET_SIZE: usize = 16;
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// A change of the trust of a device or identity that a verification will
/// apply.
#[derive(Clone, Debug, PartialEq, Eq)]
enum TrustAction {
    OwnMasterKey,
    UserMasterKey(OwnedUserId),
    Device(OwnedUserId, OwnedDeviceId),
}

/// The outcome of checking a QR code that we scanned.
enum ScanOutcome {
    Trust { now: Vec<TrustAction>, deferred: Vec<TrustAction> },
    Cancel(CancelCode),
}

/// An object controlling QR code style key verification flows.
#[derive(Clone)]
pub struct QrVerification {
    flow_id: FlowId,
    other_user_id: OwnedUserId,
    other_device_id: Arc<StdMutex<Option<OwnedDeviceId>>>,
    qr_code: Option<Arc<QrVerificationData>>,
    state: SharedObservable<VerificationTxState>,
    events: broadcast::Sender<VerificationEvent>,
    store: VerificationStore,
    transport: Arc<dyn VerificationTransport>,
    pending_requests: Arc<StdMutex<Vec<OutgoingVerificationRequest>>>,
    send_lock: Arc<Mutex<()>>,
    deferred_trust: Arc<StdMutex<Vec<TrustAction>>>,
    we_started: bool,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for QrVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrVerification")
            .field("flow_id", &self.flow_id)
            .field("other_user_id", &self.other_user_id)
            .field("state", &*self.state.read())
            .field("we_started", &self.we_started)
            .finish_non_exhaustive()
    }
}

impl QrVerification {
    pub(crate) fn new(
        store: VerificationStore,
        transport: Arc<dyn VerificationTransport>,
        flow_id: FlowId,
        other_user_id: OwnedUserId,
        other_device_id: Option<OwnedDeviceId>,
        qr_code: Option<QrVerificationData>,
        we_started: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            flow_id,
            other_user_id,
            other_device_id: Arc::new(StdMutex::new(other_device_id)),
            qr_code: qr_code.map(Arc::new),
            state: SharedObservable::new(VerificationTxState::None),
            events,
            store,
            transport,
            pending_requests: Default::default(),
            send_lock: Default::default(),
            deferred_trust: Default::default(),
            we_started,
        }
    }

    /// Get our own user id.
    pub fn user_id(&self) -> &UserId {
        self.store.account.user_id()
    }

    /// Get the user id of the other user that is participating in this
    /// verification flow.
    pub fn other_user_id(&self) -> &UserId {
        &self.other_user_id
    }

    /// Get the device id of the other side, if we know it already.
    pub fn other_device_id(&self) -> Option<OwnedDeviceId> {
        self.other_device_id.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Get the unique ID that identifies this QR code verification flow.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Is this a verification that is verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.other_user_id == self.store.account.user_id
    }

    /// Did we initiate the verification flow.
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// Did the other side initiate the verification flow.
    pub fn is_incoming(&self) -> bool {
        !self.we_started
    }

    /// Has the verification flow completed successfully.
    pub fn is_done(&self) -> bool {
        matches!(*self.state.read(), VerificationTxState::Verified | VerificationTxState::Done)
    }

    /// Has the verification flow been cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.read(), VerificationTxState::Cancelled(_))
    }

    /// Get info about the cancellation if the verification flow has been
    /// cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        as_variant!(self.state.get(), VerificationTxState::Cancelled)
    }

    /// Get the current state of the verification flow.
    pub fn state(&self) -> VerificationTxState {
        self.state.get()
    }

    /// Listen for changes of the state of the verification flow.
    ///
    /// The stream only yields the latest state, a slow consumer might skip
    /// intermediate states.
    pub fn changes(&self) -> impl Stream<Item = VerificationTxState> {
        self.state.subscribe()
    }

    /// Subscribe to every event of the verification flow.
    pub fn subscribe(&self) -> broadcast::Receiver<VerificationEvent> {
        self.events.subscribe()
    }

    /// Get the text form of our own QR code.
    ///
    /// Returns `None` if we couldn't create a QR code, this happens if we
    /// don't know the keys the QR code needs to contain.
    pub fn qr_code_text(&self) -> Result<Option<String>, EncodingError> {
        self.qr_code.as_deref().map(QrVerificationData::to_encoded_string).transpose()
    }

    /// Generate a QR code object that is representing this verification flow.
    ///
    /// The `QrCode` can then be rendered as an image or as an unicode string.
    pub fn to_qr_code(&self) -> Result<Option<QrCode>, EncodingError> {
        self.qr_code.as_deref().map(QrVerificationData::to_qr_code).transpose()
    }

    /// Generate a the raw bytes that should be encoded as a QR code is
    /// representing this verification flow.
    pub fn to_bytes(&self) -> Result<Option<Vec<u8>>, EncodingError> {
        self.qr_code.as_deref().map(QrVerificationData::to_bytes).transpose()
    }

    /// The user scanned the QR code of the other side.
    ///
    /// The scanned code is checked against the keys we know about, if it
    /// checks out we tell the other side that we scanned it and trust the
    /// keys that the code proves.
    ///
    /// A code that doesn't belong to this flow, or contains unexpected keys,
    /// cancels the verification.
    #[instrument(skip_all, fields(flow_id = self.flow_id.as_str()))]
    pub async fn user_has_scanned_other_qr_code(
        &self,
        text: &str,
    ) -> Result<(), VerificationError> {
        let state = self.state();

        if state != VerificationTxState::None {
            return Err(VerificationError::InvalidState { action: "scan a QR code", found: state });
        }

        let data = match QrVerificationData::from_encoded_str(text) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = ?e, "The scanned QR code couldn't be decoded");
                return self.cancel_with_code(CancelCode::QrCodeInvalid).await;
            }
        };

        if data.transaction_id() != self.flow_id.as_str() {
            warn!(
                transaction_id = data.transaction_id(),
                "The scanned QR code belongs to a different verification flow"
            );
            return self.cancel_with_code(CancelCode::QrCodeInvalid).await;
        }

        let (now, deferred) = match self.check_scanned_code(&data).await? {
            ScanOutcome::Trust { now, deferred } => (now, deferred),
            ScanOutcome::Cancel(code) => return self.cancel_with_code(code).await,
        };

        match self.transition_from(&VerificationTxState::None, VerificationTxState::Started) {
            Ok(()) => {}
            Err(found) if found.is_terminal() => {
                debug!(state = ?found, "The verification flow finished while checking the QR code");
                return Ok(());
            }
            Err(found) => {
                return Err(VerificationError::InvalidState { action: "scan a QR code", found });
            }
        }

        self.queue_request(OutgoingContent::Start {
            from_device: self.store.account.device_id.clone(),
            method: RECIPROCATE_METHOD.to_owned(),
            secret: data.secret().clone(),
        });

        let waiting = VerificationTxState::WaitingOtherReciprocateConfirm;

        if self.transition_from(&VerificationTxState::Started, waiting.clone()).is_ok() {
            *self.deferred_trust.lock().unwrap_or_else(PoisonError::into_inner) = deferred;
            self.apply_trust_or_cancel(&now, &waiting).await?;
        }

        self.flush_requests().await
    }

    async fn check_scanned_code(
        &self,
        data: &QrVerificationData,
    ) -> Result<ScanOutcome, VerificationError> {
        let Some(own_master_key) = self.store.own_master_key().await? else {
            warn!("Can't check the scanned QR code, we don't have a master key");
            return Ok(ScanOutcome::Cancel(CancelCode::MismatchedKeys));
        };

        let outcome = match data {
            QrVerificationData::VerifyingAnotherUser(_) => {
                if self.is_self_verification() {
                    return Ok(ScanOutcome::Cancel(CancelCode::QrCodeInvalid));
                }

                if data.second_key() != own_master_key {
                    warn!("The other side doesn't see our master key");
                    return Ok(ScanOutcome::Cancel(CancelCode::MismatchedKeys));
                }

                let their_master_key = self
                    .store
                    .get_cross_signing_keys(&self.other_user_id)
                    .await?
                    .map(|k| k.master_key);

                match their_master_key {
                    Some(key) if key == data.first_key() => ScanOutcome::Trust {
                        now: Vec::new(),
                        deferred: vec![TrustAction::UserMasterKey(self.other_user_id.clone())],
                    },
                    Some(_) => {
                        warn!("The master key of the other user doesn't match the QR code");
                        ScanOutcome::Cancel(CancelCode::MismatchedKeys)
                    }
                    None => ScanOutcome::Trust { now: Vec::new(), deferred: Vec::new() },
                }
            }
            QrVerificationData::SelfVerifyingMasterKeyTrusted(_) => {
                if !self.is_self_verification() {
                    return Ok(ScanOutcome::Cancel(CancelCode::QrCodeInvalid));
                }

                if data.first_key() != own_master_key {
                    warn!("The other device has a different master key");
                    return Ok(ScanOutcome::Cancel(CancelCode::MismatchedKeys));
                }

                if data.second_key() != self.store.account.ed25519_key {
                    warn!("The other device doesn't see our device key");
                    return Ok(ScanOutcome::Cancel(CancelCode::MismatchedKeys));
                }

                ScanOutcome::Trust { now: vec![TrustAction::OwnMasterKey], deferred: Vec::new() }
            }
            QrVerificationData::SelfVerifyingMasterKeyNotTrusted(_) => {
                if !self.is_self_verification() {
                    return Ok(ScanOutcome::Cancel(CancelCode::QrCodeInvalid));
                }

                if data.second_key() != own_master_key {
                    warn!("The other device has a different master key");
                    return Ok(ScanOutcome::Cancel(CancelCode::MismatchedKeys));
                }

                let device = match self.other_device_id() {
                    Some(device_id) => self.store.get_device(self.user_id(), &device_id).await?,
                    None => None,
                };

                match device {
                    Some(device) if device.ed25519_key == data.first_key() => ScanOutcome::Trust {
                        now: vec![TrustAction::Device(device.user_id, device.device_id)],
                        deferred: Vec::new(),
                    },
                    Some(device) => {
                        warn!(
                            device_id = %device.device_id,
                            "The device key of the other device doesn't match the QR code"
                        );
                        ScanOutcome::Cancel(CancelCode::MismatchedKeys)
                    }
                    None => ScanOutcome::Trust { now: Vec::new(), deferred: Vec::new() },
                }
            }
        };

        if let ScanOutcome::Trust { now, deferred } = &outcome {
            if now.is_empty() && deferred.is_empty() {
                warn!(
                    mode = data.mode(),
                    "The scanned QR code is valid but we don't know any of the keys it could \
                     verify, there's nothing to trust"
                );
                return Ok(ScanOutcome::Cancel(CancelCode::MismatchedKeys));
            }
        }

        Ok(outcome)
    }

    /// Receive the reciprocation of the other side, sent after they scanned
    /// our QR code.
    ///
    /// This doesn't trust anything yet, the user needs to confirm that the
    /// other side did scan our QR code using [`confirm_scanning()`].
    ///
    /// Only the device the flow is with may reciprocate, a repeated
    /// reciprocation from that device is ignored.
    ///
    /// [`confirm_scanning()`]: #method.confirm_scanning
    #[instrument(skip_all, fields(flow_id = self.flow_id.as_str()))]
    pub async fn receive_start(&self, content: &StartContent) -> Result<(), VerificationError> {
        let Some(qr_code) = &self.qr_code else {
            warn!("Received a reciprocation, but we didn't show a QR code");
            return self.cancel_with_code(CancelCode::UnexpectedMessage).await;
        };

        if content.method != RECIPROCATE_METHOD {
            warn!(method = %content.method, "Received a start message with an unknown method");
            return self.cancel_with_code(CancelCode::UnexpectedMessage).await;
        }

        let state = self.state();

        if state.is_terminal() {
            debug!(?state, "Ignoring a reciprocation, the verification flow already finished");
            return Ok(());
        }

        if !bool::from(content.secret.as_bytes().ct_eq(qr_code.secret().as_bytes())) {
            warn!("The reciprocated secret doesn't match the secret of our QR code");
            return self.cancel_with_code(CancelCode::MismatchedKeys).await;
        }

        let from_device = &content.from_device;

        if !self.is_other_device(from_device) {
            warn!(
                %from_device,
                expected_device = ?self.other_device_id(),
                "Received a reciprocation from an unexpected device"
            );
            return self.cancel_with_code(CancelCode::MismatchedKeys).await;
        }

        if self
            .transition_from(&VerificationTxState::None, VerificationTxState::QrScannedByOther)
            .is_ok()
        {
            self.other_device_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert_with(|| from_device.clone());
            debug!(%from_device, "The other side scanned our QR code");

            return Ok(());
        }

        match self.state() {
            VerificationTxState::QrScannedByOther
            | VerificationTxState::Started
            | VerificationTxState::WaitingOtherDone => {
                // Another device might have won the race for the first reciprocation.
                if !self.is_other_device(from_device) {
                    warn!(%from_device, "Received a reciprocation from an unexpected device");
                    return self.cancel_with_code(CancelCode::MismatchedKeys).await;
                }

                debug!(%from_device, "Ignoring a repeated reciprocation");
                Ok(())
            }
            state if state.is_terminal() => Ok(()),
            state => {
                warn!(?state, "Received a reciprocation in an unexpected state");
                self.cancel_with_code(CancelCode::UnexpectedMessage).await
            }
        }
    }

    /// Is the given device the other device of this flow, an unknown other
    /// device matches any device.
    fn is_other_device(&self, device_id: &DeviceId) -> bool {
        self.other_device_id().is_none_or(|d| d.as_str() == device_id.as_str())
    }

    /// Confirm that the other side has scanned our QR code.
    ///
    /// This trusts the keys our QR code contains on behalf of the other side.
    #[instrument(skip_all, fields(flow_id = self.flow_id.as_str()))]
    pub async fn confirm_scanning(&self) -> Result<(), VerificationError> {
        let scanned = VerificationTxState::QrScannedByOther;

        if let Err(found) = self.transition_from(&scanned, VerificationTxState::Started) {
            return Err(VerificationError::InvalidState { action: "confirm a scan", found });
        }

        let trust = match self.qr_code.as_deref() {
            Some(QrVerificationData::VerifyingAnotherUser(_)) => {
                vec![TrustAction::UserMasterKey(self.other_user_id.clone())]
            }
            Some(QrVerificationData::SelfVerifyingMasterKeyTrusted(_)) => self
                .other_device_id()
                .map(|d| TrustAction::Device(self.other_user_id.clone(), d))
                .into_iter()
                .collect(),
            Some(QrVerificationData::SelfVerifyingMasterKeyNotTrusted(_)) => {
                vec![TrustAction::OwnMasterKey]
            }
            None => Vec::new(),
        };

        self.apply_trust_or_cancel(&trust, &VerificationTxState::Started).await?;

        if self
            .transition_from(&VerificationTxState::Started, VerificationTxState::WaitingOtherDone)
            .is_ok()
        {
            self.queue_request(OutgoingContent::Done);
        }

        self.flush_requests().await
    }

    /// Deny that the other side has scanned our QR code.
    ///
    /// This cancels the verification flow.
    pub async fn deny_scanning(&self) -> Result<(), VerificationError> {
        let state = self.state();

        if state != VerificationTxState::QrScannedByOther {
            return Err(VerificationError::InvalidState { action: "deny a scan", found: state });
        }

        self.cancel_with_code(CancelCode::MismatchedKeys).await
    }

    /// Receive the `done` message of the other side.
    #[instrument(skip_all, fields(flow_id = self.flow_id.as_str()))]
    pub async fn receive_done(&self) -> Result<(), VerificationError> {
        let state = self.state();

        match state {
            VerificationTxState::WaitingOtherReciprocateConfirm => {
                let deferred =
                    self.deferred_trust.lock().unwrap_or_else(PoisonError::into_inner).clone();

                // Trust is recorded before the flow is reported as verified.
                self.apply_trust_or_cancel(&deferred, &state).await?;

                if self.transition_from(&state, VerificationTxState::Verified).is_ok() {
                    self.deferred_trust.lock().unwrap_or_else(PoisonError::into_inner).clear();
                    self.queue_request(OutgoingContent::Done);
                }

                self.flush_requests().await
            }
            VerificationTxState::WaitingOtherDone => {
                let _ = self.transition_from(&state, VerificationTxState::Done);
                Ok(())
            }
            _ => {
                warn!(?state, "Received a done message in an unexpected state");
                self.cancel_with_code(CancelCode::UnexpectedMessage).await
            }
        }
    }

    /// Receive a cancellation from the other side.
    pub fn receive_cancel(&self, content: &CancelContent) {
        let code = CancelCode::from_wire(&content.code).unwrap_or_else(|| {
            debug!(code = %content.code, "The other side cancelled with an unknown code");
            CancelCode::User
        });

        let info = CancelInfo::new(false, code, content.reason.clone());

        if self.transition(|s| !s.is_terminal(), VerificationTxState::Cancelled(info)).is_ok() {
            debug!(code = %content.code, reason = %content.reason, "The other side cancelled");
        }
    }

    /// Cancel the verification flow.
    pub async fn cancel(&self) -> Result<(), VerificationError> {
        self.cancel_with_code(CancelCode::User).await
    }

    /// Cancel the verification flow with the given code.
    ///
    /// Cancelling a flow that already finished doesn't do anything.
    pub async fn cancel_with_code(&self, code: CancelCode) -> Result<(), VerificationError> {
        let info = CancelInfo::ours(code);

        if self.transition(|s| !s.is_terminal(), VerificationTxState::Cancelled(info)).is_err() {
            trace!("The verification flow already finished, not cancelling");
            return Ok(());
        }

        self.deferred_trust.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.queue_request(OutgoingContent::Cancel { code, reason: code.reason().to_owned() });
        self.flush_requests().await
    }

    /// Resend the messages that couldn't be sent earlier.
    pub async fn retry_pending_requests(&self) -> Result<(), VerificationError> {
        self.flush_requests().await
    }

    /// Does this flow still have messages that need to be sent.
    pub fn has_pending_requests(&self) -> bool {
        !self.pending_requests.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    fn transition_from(
        &self,
        from: &VerificationTxState,
        new_state: VerificationTxState,
    ) -> Result<(), VerificationTxState> {
        self.transition(|s| s == from, new_state)
    }

    /// Move into a new state if the current state satisfies `expected` and
    /// the move is allowed.
    ///
    /// Every state change goes through here, listeners are notified while
    /// the state is locked so they observe changes in order.
    fn transition(
        &self,
        expected: impl FnOnce(&VerificationTxState) -> bool,
        new_state: VerificationTxState,
    ) -> Result<(), VerificationTxState> {
        let mut guard = self.state.write();

        if !expected(&*guard) {
            return Err((*guard).clone());
        }

        if !guard.can_transition_to(&new_state) {
            warn!(from = ?*guard, to = ?new_state, "Refusing an invalid state transition");
            return Err((*guard).clone());
        }

        trace!(from = ?*guard, to = ?new_state, "Verification state changed");
        ObservableWriteGuard::set(&mut guard, new_state.clone());

        let mut events = vec![VerificationEvent::StateChanged(new_state.clone())];

        match new_state {
            VerificationTxState::Cancelled(info) => events.push(VerificationEvent::Cancelled(info)),
            VerificationTxState::Verified | VerificationTxState::Done => {
                events.push(VerificationEvent::Done)
            }
            _ => {}
        }

        for event in events {
            if self.events.send(event).is_err() {
                trace!("Nobody is listening for verification events");
            }
        }

        Ok(())
    }

    /// Apply the trust actions, a failure to store them cancels the flow so
    /// it can't end up as verified without the trust being recorded.
    async fn apply_trust_or_cancel(
        &self,
        actions: &[TrustAction],
        expected_state: &VerificationTxState,
    ) -> Result<(), VerificationError> {
        let Err(error) = self.apply_trust(actions, expected_state).await else {
            return Ok(());
        };

        warn!(error = ?error, "Couldn't store the trust of the verified keys, cancelling");

        if let Err(cancel_error) = self.cancel_with_code(CancelCode::User).await {
            warn!(error = ?cancel_error, "Couldn't send the cancellation");
        }

        Err(error)
    }

    async fn apply_trust(
        &self,
        actions: &[TrustAction],
        expected_state: &VerificationTxState,
    ) -> Result<(), VerificationError> {
        for action in actions {
            if *self.state.read() != *expected_state {
                debug!(?action, "The verification flow changed its state, not applying trust");
                return Ok(());
            }

            match action {
                TrustAction::OwnMasterKey => {
                    self.store.inner().mark_own_master_key_trusted().await?;
                }
                TrustAction::UserMasterKey(user_id) => {
                    self.store.inner().mark_user_master_key_trusted(user_id).await?;
                }
                TrustAction::Device(user_id, device_id) => {
                    self.store.inner().mark_device_verified(user_id, device_id).await?;
                }
            }

            debug!(?action, "Applied trust");
        }

        Ok(())
    }

    fn queue_request(&self, content: OutgoingContent) {
        let request = OutgoingVerificationRequest::new(
            self.flow_id.clone(),
            self.other_user_id.clone(),
            self.other_device_id(),
            content,
        );

        self.pending_requests.lock().unwrap_or_else(PoisonError::into_inner).push(request);
    }

    fn next_pending_request(&self) -> Option<OutgoingVerificationRequest> {
        self.pending_requests.lock().unwrap_or_else(PoisonError::into_inner).first().cloned()
    }

    /// Send out the queued messages in order, a message stays queued until
    /// it was sent successfully.
    async fn flush_requests(&self) -> Result<(), VerificationError> {
        let _guard = self.send_lock.lock().await;

        while let Some(request) = self.next_pending_request() {
            if let Err(e) = self.transport.send(&request).await {
                warn!(
                    error = ?e,
                    event_type = request.event_type(),
                    "Couldn't send a verification message, it will be retried"
                );
                return Err(e.into());
            }

            self.pending_requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|r| r.request_id != request.request_id);
        }

        Ok(())
    }

    pub(crate) fn generate_secret() -> Base64 {
        let mut shared_secret = vec![0u8; SECRET_SIZE];
        let mut rng = thread_rng();
        rng.fill_bytes(&mut shared_secret);

        Base64::new(shared_secret)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    use assert_matches2::assert_matches;
    use async_trait::async_trait;
    use futures_util::{pin_mut, StreamExt};
    use matrix_trust_qrcode::{
        QrVerificationData, SelfVerificationData, SelfVerificationNoMasterKey, VerificationData,
    };
    use ruma::{device_id, serde::Base64, user_id, DeviceId, TransactionId, UserId};
    use tokio::sync::{broadcast, Notify};
    use vodozemac::{Ed25519Keypair, Ed25519PublicKey};

    use super::QrVerification;
    use crate::{
        error::VerificationError,
        identities::{CrossSigningKeys, DeviceKeys},
        olm::{Account, StaticAccountData},
        store::{self, CryptoStoreError, MemoryStore, TrustStore},
        verification::{
            requests::testing::RecordingTransport, CancelCode, CancelContent, FlowId,
            OutgoingContent, StartContent, VerificationEvent, VerificationStore,
            VerificationTxState, RECIPROCATE_METHOD,
        },
    };

    /// A trust store that can hold back its first key lookup until it's told
    /// to continue, or refuse to record any trust.
    #[derive(Debug)]
    struct FlakyTrustStore {
        inner: Arc<MemoryStore>,
        fail_marking: AtomicBool,
        pause_lookup: AtomicBool,
        lookup_started: Notify,
        resume_lookup: Notify,
    }

    impl FlakyTrustStore {
        fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                fail_marking: AtomicBool::new(false),
                pause_lookup: AtomicBool::new(false),
                lookup_started: Notify::new(),
                resume_lookup: Notify::new(),
            })
        }

        fn marking_result(&self) -> store::Result<()> {
            if self.fail_marking.load(Ordering::SeqCst) {
                Err(CryptoStoreError::backend(io::Error::other("the disk is full")))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl TrustStore for FlakyTrustStore {
        async fn get_cross_signing_keys(
            &self,
            user_id: &UserId,
        ) -> store::Result<Option<CrossSigningKeys>> {
            if self.pause_lookup.swap(false, Ordering::SeqCst) {
                self.lookup_started.notify_one();
                self.resume_lookup.notified().await;
            }

            self.inner.get_cross_signing_keys(user_id).await
        }

        async fn get_device(
            &self,
            user_id: &UserId,
            device_id: &DeviceId,
        ) -> store::Result<Option<DeviceKeys>> {
            self.inner.get_device(user_id, device_id).await
        }

        async fn get_user_devices(&self, user_id: &UserId) -> store::Result<Vec<DeviceKeys>> {
            self.inner.get_user_devices(user_id).await
        }

        async fn mark_device_verified(
            &self,
            user_id: &UserId,
            device_id: &DeviceId,
        ) -> store::Result<()> {
            self.marking_result()?;
            self.inner.mark_device_verified(user_id, device_id).await
        }

        async fn mark_own_master_key_trusted(&self) -> store::Result<()> {
            self.marking_result()?;
            self.inner.mark_own_master_key_trusted().await
        }

        async fn mark_user_master_key_trusted(&self, user_id: &UserId) -> store::Result<()> {
            self.marking_result()?;
            self.inner.mark_user_master_key_trusted(user_id).await
        }
    }

    struct Side {
        account: StaticAccountData,
        store: Arc<MemoryStore>,
        transport: Arc<RecordingTransport>,
    }

    impl Side {
        fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
            let account = Account::new(user_id, device_id).static_data().clone();

            Self { store: Arc::new(MemoryStore::new(user_id)), transport: Arc::default(), account }
        }

        fn device(&self) -> DeviceKeys {
            let account = &self.account;
            DeviceKeys::new(&account.user_id, &account.device_id, account.ed25519_key)
        }

        async fn knows(&self, other: &Side) {
            self.store.save_device(other.device()).await;
        }

        async fn has_master_key(&self, user_id: &UserId, key: Ed25519PublicKey, trusted: bool) {
            let mut keys = CrossSigningKeys::new(user_id, key);
            keys.master_key_trusted = trusted;
            self.store.save_cross_signing_keys(keys).await;
        }

        async fn master_key_trusted(&self, user_id: &UserId) -> bool {
            self.store.get_cross_signing_keys(user_id).await.unwrap().unwrap().master_key_trusted
        }

        async fn device_verified(&self, other: &Side) -> bool {
            self.store
                .get_device(&other.account.user_id, &other.account.device_id)
                .await
                .unwrap()
                .unwrap()
                .is_verified()
        }

        fn verification(
            &self,
            flow_id: &FlowId,
            other: &Side,
            other_device_known: bool,
            qr_code: Option<QrVerificationData>,
        ) -> QrVerification {
            self.verification_with_store(
                flow_id,
                other,
                other_device_known,
                qr_code,
                self.store.clone(),
            )
        }

        fn verification_with_store(
            &self,
            flow_id: &FlowId,
            other: &Side,
            other_device_known: bool,
            qr_code: Option<QrVerificationData>,
            store: Arc<dyn TrustStore>,
        ) -> QrVerification {
            let we_started = qr_code.is_some();

            QrVerification::new(
                VerificationStore::new(self.account.clone(), store),
                self.transport.clone(),
                flow_id.clone(),
                other.account.user_id.clone(),
                other_device_known.then(|| other.account.device_id.clone()),
                qr_code,
                we_started,
            )
        }

        fn last_sent(&self) -> OutgoingContent {
            self.transport.sent().pop().expect("a message should have been sent").content
        }
    }

    fn alice(device_id: &str) -> Side {
        Side::new(user_id!("@alice:localhost"), device_id.into())
    }

    fn bob() -> Side {
        Side::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"))
    }

    fn flow_id() -> FlowId {
        FlowId::from(TransactionId::new())
    }

    fn master_key() -> Ed25519PublicKey {
        Ed25519Keypair::new().public_key()
    }

    fn events(receiver: &mut broadcast::Receiver<VerificationEvent>) -> Vec<VerificationEvent> {
        std::iter::from_fn(|| receiver.try_recv().ok()).collect()
    }

    fn reciprocation(content: OutgoingContent) -> StartContent {
        assert_matches!(content, OutgoingContent::Start { from_device, method, secret });
        StartContent { from_device, method, secret }
    }

    /// Alice scans the QR code of Bob, Bob's code contains a wrong master key
    /// for Alice if `mismatched` is set.
    async fn other_user_setup(mismatched: bool) -> (Side, Side, QrVerification, QrVerification) {
        let alice = alice("ALICEDEVICE");
        let bob = bob();
        let alice_master_key = master_key();
        let bob_master_key = master_key();

        alice.has_master_key(&alice.account.user_id, alice_master_key, true).await;
        alice.has_master_key(&bob.account.user_id, bob_master_key, false).await;
        bob.has_master_key(&bob.account.user_id, bob_master_key, true).await;
        bob.has_master_key(&alice.account.user_id, alice_master_key, false).await;

        let flow_id = flow_id();
        let data = VerificationData::new(
            flow_id.as_str().to_owned(),
            bob_master_key,
            if mismatched { master_key() } else { alice_master_key },
            QrVerification::generate_secret(),
        );

        let bob_verification = bob.verification(&flow_id, &alice, true, Some(data.into()));
        let alice_verification = alice.verification(&flow_id, &bob, true, None);

        (alice, bob, alice_verification, bob_verification)
    }

    #[tokio::test]
    async fn self_verification_with_a_trusted_master_key() {
        let old_device = alice("OLDDEVICE");
        let new_device = alice("NEWDEVICE");
        let master_key = master_key();

        old_device.has_master_key(&old_device.account.user_id, master_key, true).await;
        new_device.has_master_key(&new_device.account.user_id, master_key, false).await;
        old_device.knows(&new_device).await;
        new_device.knows(&old_device).await;

        let flow_id = flow_id();
        let data = SelfVerificationData::new(
            flow_id.as_str().to_owned(),
            master_key,
            new_device.account.ed25519_key,
            QrVerification::generate_secret(),
        );

        let displaying = old_device.verification(&flow_id, &new_device, false, Some(data.into()));
        let scanning = new_device.verification(&flow_id, &old_device, true, None);
        let mut scanning_events = scanning.subscribe();

        assert!(displaying.is_self_verification());
        assert_eq!(scanning.qr_code_text().unwrap(), None);

        let text = displaying.qr_code_text().unwrap().unwrap();
        scanning.user_has_scanned_other_qr_code(&text).await.unwrap();

        assert_eq!(scanning.state(), VerificationTxState::WaitingOtherReciprocateConfirm);
        assert!(new_device.master_key_trusted(&new_device.account.user_id).await);

        let start = reciprocation(new_device.last_sent());
        assert_eq!(start.method, RECIPROCATE_METHOD);

        displaying.receive_start(&start).await.unwrap();
        assert_eq!(displaying.state(), VerificationTxState::QrScannedByOther);
        assert_eq!(displaying.other_device_id(), Some(new_device.account.device_id.clone()));
        assert!(!old_device.device_verified(&new_device).await);

        displaying.confirm_scanning().await.unwrap();
        assert_eq!(displaying.state(), VerificationTxState::WaitingOtherDone);
        assert!(old_device.device_verified(&new_device).await);
        assert_eq!(old_device.last_sent(), OutgoingContent::Done);

        scanning.receive_done().await.unwrap();
        assert_eq!(scanning.state(), VerificationTxState::Verified);
        assert_eq!(new_device.last_sent(), OutgoingContent::Done);
        assert!(scanning.is_done());

        displaying.receive_done().await.unwrap();
        assert_eq!(displaying.state(), VerificationTxState::Done);
        assert!(displaying.is_done());

        assert_eq!(
            events(&mut scanning_events),
            vec![
                VerificationEvent::StateChanged(VerificationTxState::Started),
                VerificationEvent::StateChanged(
                    VerificationTxState::WaitingOtherReciprocateConfirm
                ),
                VerificationEvent::StateChanged(VerificationTxState::Verified),
                VerificationEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn self_verification_without_a_trusted_master_key() {
        let old_device = alice("OLDDEVICE");
        let new_device = alice("NEWDEVICE");
        let master_key = master_key();

        old_device.has_master_key(&old_device.account.user_id, master_key, true).await;
        new_device.has_master_key(&new_device.account.user_id, master_key, false).await;
        old_device.knows(&new_device).await;
        new_device.knows(&old_device).await;

        let flow_id = flow_id();
        let data = SelfVerificationNoMasterKey::new(
            flow_id.as_str().to_owned(),
            new_device.account.ed25519_key,
            master_key,
            QrVerification::generate_secret(),
        );

        let displaying = new_device.verification(&flow_id, &old_device, false, Some(data.into()));
        let scanning = old_device.verification(&flow_id, &new_device, true, None);

        let text = displaying.qr_code_text().unwrap().unwrap();
        scanning.user_has_scanned_other_qr_code(&text).await.unwrap();
        assert!(old_device.device_verified(&new_device).await);

        displaying.receive_start(&reciprocation(old_device.last_sent())).await.unwrap();
        assert!(!new_device.master_key_trusted(&new_device.account.user_id).await);

        displaying.confirm_scanning().await.unwrap();
        assert!(new_device.master_key_trusted(&new_device.account.user_id).await);
    }

    #[tokio::test]
    async fn nothing_to_trust() {
        let old_device = alice("OLDDEVICE");
        let new_device = alice("NEWDEVICE");
        let master_key = master_key();

        old_device.has_master_key(&old_device.account.user_id, master_key, true).await;

        let flow_id = flow_id();
        let data = SelfVerificationNoMasterKey::new(
            flow_id.as_str().to_owned(),
            new_device.account.ed25519_key,
            master_key,
            QrVerification::generate_secret(),
        );

        let displaying = new_device.verification(&flow_id, &old_device, false, Some(data.into()));
        // We never received the keys of the new device.
        let scanning = old_device.verification(&flow_id, &new_device, true, None);

        let text = displaying.qr_code_text().unwrap().unwrap();
        scanning.user_has_scanned_other_qr_code(&text).await.unwrap();

        assert_eq!(scanning.cancel_info().unwrap().cancel_code(), CancelCode::MismatchedKeys);
    }

    #[tokio::test]
    async fn verifying_another_user_defers_trust() {
        let (alice, bob, alice_verification, bob_verification) = other_user_setup(false).await;

        let text = bob_verification.qr_code_text().unwrap().unwrap();
        alice_verification.user_has_scanned_other_qr_code(&text).await.unwrap();

        assert_eq!(
            alice_verification.state(),
            VerificationTxState::WaitingOtherReciprocateConfirm
        );
        assert!(!alice.master_key_trusted(&bob.account.user_id).await);

        bob_verification.receive_start(&reciprocation(alice.last_sent())).await.unwrap();
        bob_verification.confirm_scanning().await.unwrap();
        assert!(bob.master_key_trusted(&alice.account.user_id).await);

        alice_verification.receive_done().await.unwrap();
        assert_eq!(alice_verification.state(), VerificationTxState::Verified);
        assert!(alice.master_key_trusted(&bob.account.user_id).await);
    }

    #[tokio::test]
    async fn mismatched_master_key() {
        let (alice, bob, alice_verification, bob_verification) = other_user_setup(true).await;

        let text = bob_verification.qr_code_text().unwrap().unwrap();
        alice_verification.user_has_scanned_other_qr_code(&text).await.unwrap();

        let cancel_info = alice_verification.cancel_info().unwrap();
        assert_eq!(cancel_info.cancel_code(), CancelCode::MismatchedKeys);
        assert!(cancel_info.cancelled_by_us());
        assert!(!alice.master_key_trusted(&bob.account.user_id).await);
        assert_matches!(
            alice.last_sent(),
            OutgoingContent::Cancel { code: CancelCode::MismatchedKeys, .. }
        );
    }

    #[tokio::test]
    async fn done_in_the_wrong_state() {
        let (_, _, alice_verification, _) = other_user_setup(false).await;

        alice_verification.receive_done().await.unwrap();

        assert_eq!(
            alice_verification.cancel_info().unwrap().cancel_code(),
            CancelCode::UnexpectedMessage
        );
    }

    #[tokio::test]
    async fn cancelling_twice() {
        let (alice, _, alice_verification, _) = other_user_setup(false).await;
        let mut receiver = alice_verification.subscribe();

        alice_verification.cancel().await.unwrap();
        alice_verification.cancel().await.unwrap();

        let cancel_info = alice_verification.cancel_info().unwrap();
        assert_eq!(cancel_info.cancel_code(), CancelCode::User);

        assert_eq!(
            events(&mut receiver),
            vec![
                VerificationEvent::StateChanged(VerificationTxState::Cancelled(
                    cancel_info.clone()
                )),
                VerificationEvent::Cancelled(cancel_info),
            ]
        );
        assert_eq!(alice.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let (alice, _, alice_verification, bob_verification) = other_user_setup(false).await;

        alice_verification.cancel().await.unwrap();
        let cancelled = alice_verification.state();

        alice_verification.receive_done().await.unwrap();
        alice_verification.receive_cancel(&CancelContent {
            code: "m.key_mismatch".to_owned(),
            reason: "Mismatched keys".to_owned(),
        });
        let text = bob_verification.qr_code_text().unwrap().unwrap();
        assert_matches!(
            alice_verification.user_has_scanned_other_qr_code(&text).await,
            Err(VerificationError::InvalidState { .. })
        );
        assert_matches!(
            alice_verification.confirm_scanning().await,
            Err(VerificationError::InvalidState { .. })
        );

        assert_eq!(alice_verification.state(), cancelled);
        assert_eq!(alice.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_by_the_other_side() {
        let (alice, _, alice_verification, _) = other_user_setup(false).await;

        alice_verification.receive_cancel(&CancelContent {
            code: "m.user".to_owned(),
            reason: "Nope".to_owned(),
        });

        let cancel_info = alice_verification.cancel_info().unwrap();
        assert_eq!(cancel_info.cancel_code(), CancelCode::User);
        assert_eq!(cancel_info.reason(), "Nope");
        assert!(!cancel_info.cancelled_by_us());
        assert!(alice.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_sends_are_retried() {
        let (alice, bob, alice_verification, bob_verification) = other_user_setup(false).await;

        alice.transport.fail.store(true, Ordering::SeqCst);

        let text = bob_verification.qr_code_text().unwrap().unwrap();
        assert_matches!(
            alice_verification.user_has_scanned_other_qr_code(&text).await,
            Err(VerificationError::Transport(_))
        );
        assert_eq!(
            alice_verification.state(),
            VerificationTxState::WaitingOtherReciprocateConfirm
        );
        assert!(alice_verification.has_pending_requests());

        alice.transport.fail.store(false, Ordering::SeqCst);
        alice_verification.retry_pending_requests().await.unwrap();

        assert!(!alice_verification.has_pending_requests());
        bob_verification.receive_start(&reciprocation(alice.last_sent())).await.unwrap();
        assert_eq!(bob_verification.state(), VerificationTxState::QrScannedByOther);
        assert_eq!(bob_verification.other_device_id(), Some(alice.account.device_id.clone()));
        assert!(!bob.master_key_trusted(&alice.account.user_id).await);
    }

    #[tokio::test]
    async fn invalid_qr_codes() {
        let (_, _, alice_verification, _) = other_user_setup(false).await;

        alice_verification.user_has_scanned_other_qr_code("not a QR code").await.unwrap();
        assert_eq!(
            alice_verification.cancel_info().unwrap().cancel_code(),
            CancelCode::QrCodeInvalid
        );

        let (_, _, alice_verification, _) = other_user_setup(false).await;
        let (_, _, _, other_bob_verification) = other_user_setup(false).await;

        let text = other_bob_verification.qr_code_text().unwrap().unwrap();
        alice_verification.user_has_scanned_other_qr_code(&text).await.unwrap();
        assert_eq!(
            alice_verification.cancel_info().unwrap().cancel_code(),
            CancelCode::QrCodeInvalid
        );
    }

    #[tokio::test]
    async fn scanning_twice() {
        let (_, _, alice_verification, bob_verification) = other_user_setup(false).await;

        let text = bob_verification.qr_code_text().unwrap().unwrap();
        alice_verification.user_has_scanned_other_qr_code(&text).await.unwrap();

        assert_matches!(
            alice_verification.user_has_scanned_other_qr_code(&text).await,
            Err(VerificationError::InvalidState {
                found: VerificationTxState::WaitingOtherReciprocateConfirm,
                ..
            })
        );
    }

    #[tokio::test]
    async fn wrong_secret() {
        let (alice, bob, alice_verification, bob_verification) = other_user_setup(false).await;

        let text = bob_verification.qr_code_text().unwrap().unwrap();
        alice_verification.user_has_scanned_other_qr_code(&text).await.unwrap();

        let mut start = reciprocation(alice.last_sent());
        start.secret = Base64::new(b"NOT THE SECRET".to_vec());

        bob_verification.receive_start(&start).await.unwrap();

        assert_eq!(
            bob_verification.cancel_info().unwrap().cancel_code(),
            CancelCode::MismatchedKeys
        );
        assert!(!bob.master_key_trusted(&alice.account.user_id).await);
    }

    #[tokio::test]
    async fn reciprocation_from_an_unexpected_device() {
        let (alice, bob, alice_verification, bob_verification) = other_user_setup(false).await;

        let text = bob_verification.qr_code_text().unwrap().unwrap();
        alice_verification.user_has_scanned_other_qr_code(&text).await.unwrap();

        let mut start = reciprocation(alice.last_sent());
        start.from_device = device_id!("ROGUEDEVICE").to_owned();

        bob_verification.receive_start(&start).await.unwrap();

        assert_eq!(
            bob_verification.cancel_info().unwrap().cancel_code(),
            CancelCode::MismatchedKeys
        );
        assert_eq!(bob_verification.other_device_id(), Some(alice.account.device_id.clone()));
        assert_matches!(
            bob_verification.confirm_scanning().await,
            Err(VerificationError::InvalidState { .. })
        );
        assert!(!bob.master_key_trusted(&alice.account.user_id).await);
    }

    #[tokio::test]
    async fn only_the_first_reciprocating_device_is_verified() {
        let old_device = alice("OLDDEVICE");
        let new_device = alice("NEWDEVICE");
        let rogue_device = alice("ROGUEDEVICE");
        let master_key = master_key();

        old_device.has_master_key(&old_device.account.user_id, master_key, true).await;
        old_device.knows(&new_device).await;
        old_device.knows(&rogue_device).await;

        let flow_id = flow_id();
        let data = QrVerificationData::from(SelfVerificationData::new(
            flow_id.as_str().to_owned(),
            master_key,
            new_device.account.ed25519_key,
            QrVerification::generate_secret(),
        ));
        let secret = data.secret().clone();
        let displaying = old_device.verification(&flow_id, &new_device, false, Some(data));

        let start = StartContent {
            from_device: new_device.account.device_id.clone(),
            method: RECIPROCATE_METHOD.to_owned(),
            secret,
        };
        displaying.receive_start(&start).await.unwrap();

        let rogue_start =
            StartContent { from_device: rogue_device.account.device_id.clone(), ..start };
        displaying.receive_start(&rogue_start).await.unwrap();

        assert_eq!(displaying.cancel_info().unwrap().cancel_code(), CancelCode::MismatchedKeys);
        assert_eq!(displaying.other_device_id(), Some(new_device.account.device_id.clone()));
        assert!(!old_device.device_verified(&new_device).await);
        assert!(!old_device.device_verified(&rogue_device).await);
    }

    #[tokio::test]
    async fn repeated_reciprocations_are_ignored() {
        let (alice, bob, alice_verification, bob_verification) = other_user_setup(false).await;

        let text = bob_verification.qr_code_text().unwrap().unwrap();
        alice_verification.user_has_scanned_other_qr_code(&text).await.unwrap();
        let start = reciprocation(alice.last_sent());

        bob_verification.receive_start(&start).await.unwrap();
        bob_verification.receive_start(&start).await.unwrap();
        assert_eq!(bob_verification.state(), VerificationTxState::QrScannedByOther);

        bob_verification.confirm_scanning().await.unwrap();
        bob_verification.receive_start(&start).await.unwrap();
        assert_eq!(bob_verification.state(), VerificationTxState::WaitingOtherDone);
        assert!(bob.master_key_trusted(&alice.account.user_id).await);

        bob_verification.receive_done().await.unwrap();
        bob_verification.receive_start(&start).await.unwrap();
        assert_eq!(bob_verification.state(), VerificationTxState::Done);

        assert_eq!(bob.transport.sent().len(), 1);
        assert_eq!(bob.last_sent(), OutgoingContent::Done);
    }

    #[tokio::test]
    async fn failing_to_store_trust_cancels_the_confirmation() {
        let (alice, bob, alice_verification, bob_verification) = other_user_setup(false).await;

        let text = bob_verification.qr_code_text().unwrap().unwrap();
        let data = QrVerificationData::from_encoded_str(&text).unwrap();
        let store = FlakyTrustStore::new(bob.store.clone());
        store.fail_marking.store(true, Ordering::SeqCst);

        let bob_verification = bob.verification_with_store(
            bob_verification.flow_id(),
            &alice,
            true,
            Some(data),
            store.clone(),
        );

        alice_verification.user_has_scanned_other_qr_code(&text).await.unwrap();
        bob_verification.receive_start(&reciprocation(alice.last_sent())).await.unwrap();

        assert_matches!(
            bob_verification.confirm_scanning().await,
            Err(VerificationError::Store(_))
        );
        assert_eq!(bob_verification.cancel_info().unwrap().cancel_code(), CancelCode::User);
        assert!(!bob_verification.is_done());
        assert!(!bob.master_key_trusted(&alice.account.user_id).await);
        assert_matches!(bob.last_sent(), OutgoingContent::Cancel { code: CancelCode::User, .. });
        assert!(bob.transport.sent().iter().all(|r| r.content != OutgoingContent::Done));
    }

    #[tokio::test]
    async fn failing_to_store_deferred_trust_cancels_the_flow() {
        let (alice, bob, alice_verification, bob_verification) = other_user_setup(false).await;

        let store = FlakyTrustStore::new(alice.store.clone());
        let alice_verification = alice.verification_with_store(
            alice_verification.flow_id(),
            &bob,
            true,
            None,
            store.clone(),
        );

        let text = bob_verification.qr_code_text().unwrap().unwrap();
        alice_verification.user_has_scanned_other_qr_code(&text).await.unwrap();
        bob_verification.receive_start(&reciprocation(alice.last_sent())).await.unwrap();
        bob_verification.confirm_scanning().await.unwrap();

        store.fail_marking.store(true, Ordering::SeqCst);

        assert_matches!(alice_verification.receive_done().await, Err(VerificationError::Store(_)));
        assert_eq!(alice_verification.cancel_info().unwrap().cancel_code(), CancelCode::User);
        assert!(!alice_verification.is_done());
        assert!(!alice.master_key_trusted(&bob.account.user_id).await);
        assert_matches!(alice.last_sent(), OutgoingContent::Cancel { code: CancelCode::User, .. });
    }

    #[tokio::test]
    async fn cancelling_while_a_scanned_code_is_checked() {
        let (alice, bob, alice_verification, bob_verification) = other_user_setup(false).await;

        let store = FlakyTrustStore::new(alice.store.clone());
        store.pause_lookup.store(true, Ordering::SeqCst);
        let alice_verification = alice.verification_with_store(
            alice_verification.flow_id(),
            &bob,
            true,
            None,
            store.clone(),
        );

        let text = bob_verification.qr_code_text().unwrap().unwrap();
        let cancel = async {
            store.lookup_started.notified().await;
            alice_verification.cancel().await.unwrap();
            store.resume_lookup.notify_one();
        };

        let (result, ()) =
            tokio::join!(alice_verification.user_has_scanned_other_qr_code(&text), cancel);

        result.unwrap();
        assert_eq!(alice_verification.cancel_info().unwrap().cancel_code(), CancelCode::User);
        assert!(!alice.master_key_trusted(&bob.account.user_id).await);
        assert_eq!(alice.transport.sent().len(), 1);
        assert_matches!(alice.last_sent(), OutgoingContent::Cancel { code: CancelCode::User, .. });
    }

    #[tokio::test]
    async fn confirming_requires_a_scan() {
        let (_, bob, _, bob_verification) = other_user_setup(false).await;

        assert_matches!(
            bob_verification.confirm_scanning().await,
            Err(VerificationError::InvalidState { found: VerificationTxState::None, .. })
        );
        assert_matches!(
            bob_verification.deny_scanning().await,
            Err(VerificationError::InvalidState { found: VerificationTxState::None, .. })
        );
        assert_eq!(bob_verification.state(), VerificationTxState::None);
        assert!(bob.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn denying_a_scan() {
        let (alice, bob, alice_verification, bob_verification) = other_user_setup(false).await;

        let text = bob_verification.qr_code_text().unwrap().unwrap();
        alice_verification.user_has_scanned_other_qr_code(&text).await.unwrap();
        bob_verification.receive_start(&reciprocation(alice.last_sent())).await.unwrap();
        bob_verification.deny_scanning().await.unwrap();

        assert_eq!(
            bob_verification.cancel_info().unwrap().cancel_code(),
            CancelCode::MismatchedKeys
        );
        assert!(!bob.master_key_trusted(&alice.account.user_id).await);

        alice_verification.receive_cancel(&CancelContent {
            code: CancelCode::MismatchedKeys.as_str().to_owned(),
            reason: CancelCode::MismatchedKeys.reason().to_owned(),
        });
        assert!(alice_verification.is_cancelled());
        assert!(!alice.master_key_trusted(&bob.account.user_id).await);
    }

    #[tokio::test]
    async fn state_changes_are_observable() {
        let (_, _, alice_verification, _) = other_user_setup(false).await;
        let changes = alice_verification.changes();
        pin_mut!(changes);

        alice_verification.cancel().await.unwrap();

        assert_matches!(changes.next().await, Some(VerificationTxState::Cancelled(_)));
    }
}
