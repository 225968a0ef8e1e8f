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

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock},
};

use matrix_trust_qrcode::{
    QrVerificationData, SelfVerificationData, SelfVerificationNoMasterKey, VerificationData,
};
use ruma::{DeviceId, UserId};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, trace, warn};

use super::{
    requests::{IncomingVerificationEvent, VerificationTransport},
    FlowId, QrVerification, VerificationStore,
};
use crate::{error::VerificationError, olm::StaticAccountData, store::TrustStore};

const NEW_VERIFICATION_CAPACITY: usize = 16;

/// Keeps track of the running verification flows and routes incoming
/// verification messages to them.
///
/// The machine needs to be [started](Self::start) before verifications can
/// be created, [stopping](Self::stop) it cancels every flow that is still
/// running.
#[derive(Clone, Debug)]
pub struct VerificationMachine {
    store: VerificationStore,
    transport: Arc<dyn VerificationTransport>,
    verifications: Arc<StdRwLock<BTreeMap<FlowId, QrVerification>>>,
    new_verifications: Arc<StdMutex<Option<broadcast::Sender<QrVerification>>>>,
}

impl VerificationMachine {
    /// Create a new, stopped, `VerificationMachine`.
    pub fn new(
        account: StaticAccountData,
        trust_store: Arc<dyn TrustStore>,
        transport: Arc<dyn VerificationTransport>,
    ) -> Self {
        Self {
            store: VerificationStore::new(account, trust_store),
            transport,
            verifications: Default::default(),
            new_verifications: Default::default(),
        }
    }

    /// Our own user id.
    pub fn own_user_id(&self) -> &UserId {
        self.store.account.user_id()
    }

    /// Our own device id.
    pub fn own_device_id(&self) -> &DeviceId {
        self.store.account.device_id()
    }

    /// Is the machine running.
    pub fn is_running(&self) -> bool {
        self.new_verifications.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Start the machine.
    ///
    /// Returns a receiver for the verification flows that get created while
    /// the machine is running, the receiver closes once the machine is
    /// stopped. Starting a running machine only adds another receiver.
    pub fn start(&self) -> broadcast::Receiver<QrVerification> {
        let mut sender = self.new_verifications.lock().unwrap_or_else(PoisonError::into_inner);

        match &*sender {
            Some(sender) => sender.subscribe(),
            None => {
                info!(user_id = %self.own_user_id(), "Starting the verification machine");

                let (new_sender, receiver) = broadcast::channel(NEW_VERIFICATION_CAPACITY);
                *sender = Some(new_sender);

                receiver
            }
        }
    }

    /// Stop the machine.
    ///
    /// Every verification flow that didn't finish yet is cancelled and
    /// forgotten.
    pub async fn stop(&self) {
        let sender = self.new_verifications.lock().unwrap_or_else(PoisonError::into_inner).take();

        if sender.is_none() {
            return;
        }

        info!("Stopping the verification machine");

        let verifications: Vec<_> = std::mem::take(
            &mut *self.verifications.write().unwrap_or_else(PoisonError::into_inner),
        )
        .into_values()
        .collect();

        for verification in verifications {
            if verification.state().is_terminal() {
                continue;
            }

            if let Err(e) = verification.cancel().await {
                warn!(
                    flow_id = verification.flow_id().as_str(),
                    error = ?e,
                    "Couldn't send the cancellation of a verification flow"
                );
            }
        }
    }

    /// Create a new QR code verification flow.
    ///
    /// # Arguments
    ///
    /// * `flow_id` - The unique id of the flow, the QR code will carry it as
    ///   its transaction id.
    ///
    /// * `other_user_id` - The user we are verifying, this can be our own
    ///   user id.
    ///
    /// * `other_device_id` - The device we are verifying, if we know it.
    ///
    /// * `we_started` - Did we start the flow or did the other side.
    ///
    /// The QR code of the flow contains the keys we know about. If we don't
    /// know enough keys the flow won't have a QR code and we can only scan
    /// the code of the other side.
    #[instrument(skip_all, fields(flow_id = flow_id.as_str(), %other_user_id))]
    pub async fn create_qr_verification(
        &self,
        flow_id: FlowId,
        other_user_id: &UserId,
        other_device_id: Option<&DeviceId>,
        we_started: bool,
    ) -> Result<QrVerification, VerificationError> {
        if !self.is_running() {
            return Err(VerificationError::NotRunning);
        }

        if self.get_verification(&flow_id).is_some() {
            return Err(VerificationError::AlreadyExists(flow_id.as_str().to_owned()));
        }

        let qr_code = self.generate_qr_code(&flow_id, other_user_id, other_device_id).await?;

        if let Some(qr_code) = &qr_code {
            // Fail early for transaction ids that can't be encoded.
            qr_code.to_bytes()?;
        }

        let verification = QrVerification::new(
            self.store.clone(),
            self.transport.clone(),
            flow_id.clone(),
            other_user_id.to_owned(),
            other_device_id.map(ToOwned::to_owned),
            qr_code,
            we_started,
        );

        {
            let mut verifications =
                self.verifications.write().unwrap_or_else(PoisonError::into_inner);

            if verifications.contains_key(&flow_id) {
                return Err(VerificationError::AlreadyExists(flow_id.as_str().to_owned()));
            }

            verifications.insert(flow_id, verification.clone());
        }

        match &*self.new_verifications.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(sender) => {
                if sender.send(verification.clone()).is_err() {
                    trace!("Nobody is listening for new verification flows");
                }
            }
            None => debug!("The machine was stopped while the verification was being created"),
        }

        Ok(verification)
    }

    async fn generate_qr_code(
        &self,
        flow_id: &FlowId,
        other_user_id: &UserId,
        other_device_id: Option<&DeviceId>,
    ) -> Result<Option<QrVerificationData>, VerificationError> {
        let Some(own_keys) = self.store.own_cross_signing_keys().await? else {
            debug!("We don't have a master key, not creating a QR code");
            return Ok(None);
        };

        let transaction_id = flow_id.as_str().to_owned();
        let secret = QrVerification::generate_secret();

        let qr_code = if other_user_id != self.own_user_id() {
            let Some(their_keys) = self.store.get_cross_signing_keys(other_user_id).await? else {
                debug!("We don't know the master key of the other user, not creating a QR code");
                return Ok(None);
            };

            let master_key = own_keys.master_key;
            VerificationData::new(transaction_id, master_key, their_keys.master_key, secret).into()
        } else if own_keys.master_key_trusted {
            let device = match other_device_id {
                Some(device_id) => self.store.get_device(other_user_id, device_id).await?,
                None => None,
            };

            let Some(device) = device else {
                debug!("We don't know the other device, not creating a QR code");
                return Ok(None);
            };

            let master_key = own_keys.master_key;
            SelfVerificationData::new(transaction_id, master_key, device.ed25519_key, secret).into()
        } else {
            SelfVerificationNoMasterKey::new(
                transaction_id,
                self.store.account.ed25519_key,
                own_keys.master_key,
                secret,
            )
            .into()
        };

        Ok(Some(qr_code))
    }

    /// Get the verification flow with the given flow id.
    pub fn get_verification(&self, flow_id: &FlowId) -> Option<QrVerification> {
        self.verifications.read().unwrap_or_else(PoisonError::into_inner).get(flow_id).cloned()
    }

    /// Handle a verification message the other side sent us.
    ///
    /// Messages for unknown flows, or messages that weren't sent by the user
    /// we are verifying, are ignored. Flows that finished are forgotten once
    /// all their messages were sent.
    #[instrument(skip_all, fields(%sender, flow_id = event.flow_id().as_str()))]
    pub async fn receive_event(
        &self,
        sender: &UserId,
        event: &IncomingVerificationEvent,
    ) -> Result<(), VerificationError> {
        if !self.is_running() {
            debug!("Received a verification message while the machine is stopped");
            return Ok(());
        }

        let Some(verification) = self.get_verification(event.flow_id()) else {
            warn!("Received a verification message for an unknown flow");
            return Ok(());
        };

        if verification.other_user_id() != sender {
            warn!(
                other_user_id = %verification.other_user_id(),
                "Received a verification message from a user that isn't part of the flow"
            );
            return Ok(());
        }

        let result = match event {
            IncomingVerificationEvent::Start(_, content) => {
                verification.receive_start(content).await
            }
            IncomingVerificationEvent::Done(_) => verification.receive_done().await,
            IncomingVerificationEvent::Cancel(_, content) => {
                verification.receive_cancel(content);
                Ok(())
            }
        };

        self.garbage_collect();

        result
    }

    /// Forget the verification flows that finished and don't have any
    /// unsent messages left.
    pub fn garbage_collect(&self) {
        self.verifications.write().unwrap_or_else(PoisonError::into_inner).retain(|flow_id, v| {
            let finished = v.state().is_terminal() && !v.has_pending_requests();

            if finished {
                trace!(flow_id = flow_id.as_str(), "Forgetting a finished verification flow");
            }

            !finished
        });
    }
}
