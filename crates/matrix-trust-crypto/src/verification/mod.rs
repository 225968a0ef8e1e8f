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

//! Interactive verification of devices and users by scanning QR codes.
//!
//! Each verification flow is driven by a [`QrVerification`], the
//! [`VerificationMachine`] creates them and routes incoming messages to them.

mod machine;
mod qrcode;
mod requests;

use std::sync::Arc;

pub use machine::VerificationMachine;
pub use qrcode::QrVerification;
pub use requests::{
    CancelContent, IncomingVerificationEvent, OutgoingContent, OutgoingVerificationRequest,
    StartContent, VerificationTransport, RECIPROCATE_METHOD,
};
use ruma::{DeviceId, EventId, OwnedEventId, OwnedRoomId, OwnedTransactionId, RoomId, UserId};
use vodozemac::Ed25519PublicKey;

use crate::{
    identities::{CrossSigningKeys, DeviceKeys},
    olm::StaticAccountData,
    store::{CryptoStoreError, TrustStore},
};

/// The reason a verification was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelCode {
    /// The user cancelled the verification.
    User,
    /// The QR code that was scanned is invalid or belongs to another flow.
    QrCodeInvalid,
    /// The keys we were shown don't match the keys we know about.
    MismatchedKeys,
    /// A message was received that isn't allowed in the current state.
    UnexpectedMessage,
}

impl CancelCode {
    /// The code as it's sent over the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelCode::User => "m.user",
            CancelCode::QrCodeInvalid => "m.qr_code.invalid",
            CancelCode::MismatchedKeys => "m.key_mismatch",
            CancelCode::UnexpectedMessage => "m.unexpected_message",
        }
    }

    /// Parse the wire form of a cancel code.
    pub fn from_wire(code: &str) -> Option<Self> {
        Some(match code {
            "m.user" => CancelCode::User,
            "m.qr_code.invalid" => CancelCode::QrCodeInvalid,
            "m.key_mismatch" => CancelCode::MismatchedKeys,
            "m.unexpected_message" => CancelCode::UnexpectedMessage,
            _ => return None,
        })
    }

    /// A human readable description of the code.
    pub fn reason(&self) -> &'static str {
        match self {
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::QrCodeInvalid => "The scanned QR code is invalid.",
            CancelCode::MismatchedKeys => "The expected key did not match the verified one",
            CancelCode::UnexpectedMessage => "The device received an unexpected message.",
        }
    }
}

impl std::fmt::Display for CancelCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information about the cancellation of a verification flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelInfo {
    cancelled_by_us: bool,
    cancel_code: CancelCode,
    reason: String,
}

impl CancelInfo {
    pub(crate) fn new(cancelled_by_us: bool, cancel_code: CancelCode, reason: String) -> Self {
        Self { cancelled_by_us, cancel_code, reason }
    }

    pub(crate) fn ours(cancel_code: CancelCode) -> Self {
        Self::new(true, cancel_code, cancel_code.reason().to_owned())
    }

    /// Get the human readable reason of the cancellation.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get the `CancelCode` that cancelled this verification.
    pub fn cancel_code(&self) -> CancelCode {
        self.cancel_code
    }

    /// Was the verification cancelled by us?
    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }
}

/// The state of a QR code verification.
///
/// The scanning side goes through `None → Started →
/// WaitingOtherReciprocateConfirm → Verified`, the side that displayed the QR
/// code through `None → QrScannedByOther → Started → WaitingOtherDone → Done`.
/// Every non-terminal state can be cancelled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum VerificationTxState {
    /// Nothing happened yet.
    #[default]
    None,
    /// We are sending our reciprocation, or we confirmed the scan of our QR
    /// code.
    Started,
    /// The other side scanned our QR code, the user needs to confirm this.
    QrScannedByOther,
    /// We scanned the QR code of the other side and wait for them to confirm
    /// it.
    WaitingOtherReciprocateConfirm,
    /// We confirmed the scan of our QR code and wait for the other side to
    /// finish.
    WaitingOtherDone,
    /// The other side confirmed our scan, the verification succeeded.
    Verified,
    /// The other side finished, the verification succeeded.
    Done,
    /// The verification was cancelled.
    Cancelled(CancelInfo),
}

impl VerificationTxState {
    /// Is this a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Done | Self::Cancelled(_))
    }

    /// Is moving from this state into the `next` state allowed.
    pub fn can_transition_to(&self, next: &VerificationTxState) -> bool {
        use VerificationTxState::*;

        if matches!(next, Cancelled(_)) {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (None, Started)
                | (None, QrScannedByOther)
                | (QrScannedByOther, Started)
                | (Started, WaitingOtherReciprocateConfirm)
                | (Started, WaitingOtherDone)
                | (WaitingOtherReciprocateConfirm, Verified)
                | (WaitingOtherDone, Done)
        )
    }
}

/// A notification about a verification flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationEvent {
    /// The flow moved into a new state.
    StateChanged(VerificationTxState),
    /// The flow was cancelled.
    Cancelled(CancelInfo),
    /// The flow succeeded.
    Done,
}

/// The unique identifier of a verification flow.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlowId {
    /// A flow that uses to-device messages, identified by a transaction id.
    ToDevice(OwnedTransactionId),
    /// A flow that happens inside a room, identified by the event id of the
    /// request.
    InRoom(OwnedRoomId, OwnedEventId),
}

impl FlowId {
    /// The room of the flow, if it happens inside a room.
    pub fn room_id(&self) -> Option<&RoomId> {
        if let FlowId::InRoom(r, _) = &self {
            Some(r)
        } else {
            None
        }
    }

    /// The flow id as a string, this is the transaction id of the QR code.
    pub fn as_str(&self) -> &str {
        match self {
            FlowId::InRoom(_, r) => r.as_str(),
            FlowId::ToDevice(t) => t.as_str(),
        }
    }
}

impl From<OwnedTransactionId> for FlowId {
    fn from(transaction_id: OwnedTransactionId) -> Self {
        FlowId::ToDevice(transaction_id)
    }
}

impl From<(OwnedRoomId, OwnedEventId)> for FlowId {
    fn from(ids: (OwnedRoomId, OwnedEventId)) -> Self {
        FlowId::InRoom(ids.0, ids.1)
    }
}

impl From<(&RoomId, &EventId)> for FlowId {
    fn from(ids: (&RoomId, &EventId)) -> Self {
        FlowId::InRoom(ids.0.to_owned(), ids.1.to_owned())
    }
}

#[derive(Clone, Debug)]
pub(crate) struct VerificationStore {
    pub account: StaticAccountData,
    inner: Arc<dyn TrustStore>,
}

impl VerificationStore {
    pub fn new(account: StaticAccountData, inner: Arc<dyn TrustStore>) -> Self {
        Self { account, inner }
    }

    /// Get a device of another user, or another device of ours.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceKeys>, CryptoStoreError> {
        Ok(self.inner.get_device(user_id, device_id).await?.filter(|d| {
            !(d.user_id == self.account.user_id && d.device_id == self.account.device_id)
        }))
    }

    pub async fn get_cross_signing_keys(
        &self,
        user_id: &UserId,
    ) -> Result<Option<CrossSigningKeys>, CryptoStoreError> {
        self.inner.get_cross_signing_keys(user_id).await
    }

    pub async fn own_cross_signing_keys(
        &self,
    ) -> Result<Option<CrossSigningKeys>, CryptoStoreError> {
        self.inner.get_cross_signing_keys(self.account.user_id()).await
    }

    pub async fn own_master_key(&self) -> Result<Option<Ed25519PublicKey>, CryptoStoreError> {
        Ok(self.own_cross_signing_keys().await?.map(|k| k.master_key))
    }

    pub fn inner(&self) -> &dyn TrustStore {
        &*self.inner
    }
}
